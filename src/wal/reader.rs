use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use super::{record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::corruption;
use crate::error::Result;

enum Fragment {
    /// A decoded physical record.
    Record(RecordType, Vec<u8>),
    /// A damaged or discarded fragment; scanning continues.
    Bad,
    /// No more data.
    Eof,
}

/// Reassembles user records from a log file, skipping damaged fragments and
/// records that start before a requested initial offset.
pub struct Reader {
    file: File,
    verify: bool,
    buffer: Vec<u8>,
    pos: usize,
    buffer_end_offset: u64,
    initial_offset: u64,
    eof: bool,
}

impl Reader {
    pub fn open(path: &Path, verify: bool, initial_offset: u64) -> Result<Reader> {
        let file = File::open(path)?;
        let mut reader = Reader {
            file,
            verify,
            buffer: Vec::new(),
            pos: 0,
            buffer_end_offset: 0,
            initial_offset,
            eof: false,
        };
        if initial_offset > 0 {
            reader.skip_to_initial_block()?;
        }
        Ok(reader)
    }

    /// Returns the next user record, or None at end of log. A record cut
    /// short by end-of-file is dropped. A bad checksum surfaces as a
    /// corruption error; the damage classes that can be bounded (zeroed
    /// pages, overrun lengths, unknown types) are skipped.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembling = false;
        let mut record = Vec::new();

        loop {
            match self.read_physical_record()? {
                Fragment::Eof => {
                    if assembling {
                        tracing::warn!("dropping user record truncated by end of log");
                    }
                    return Ok(None);
                }
                Fragment::Bad => {
                    if assembling {
                        tracing::warn!("dropping user record with damaged fragment");
                        assembling = false;
                        record.clear();
                    }
                }
                Fragment::Record(rtype, data) => match rtype {
                    RecordType::Full if !assembling => return Ok(Some(data)),
                    RecordType::First if !assembling => {
                        assembling = true;
                        record = data;
                    }
                    RecordType::Middle if assembling => record.extend_from_slice(&data),
                    RecordType::Last if assembling => {
                        record.extend_from_slice(&data);
                        return Ok(Some(record));
                    }
                    other => {
                        tracing::warn!(rtype = other as u8, "fragment out of sequence");
                        assembling = false;
                        record.clear();
                    }
                },
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Fragment> {
        loop {
            if self.buffer.len() - self.pos < HEADER_SIZE {
                // Page tails shorter than a header are writer padding.
                if self.eof {
                    return Ok(Fragment::Eof);
                }
                self.buffer.resize(BLOCK_SIZE, 0);
                self.pos = 0;
                let n = read_full(&mut self.file, &mut self.buffer)?;
                self.buffer.truncate(n);
                self.buffer_end_offset += n as u64;
                if n == 0 {
                    self.eof = true;
                    return Ok(Fragment::Eof);
                }
                if n < BLOCK_SIZE {
                    self.eof = true;
                }
                continue;
            }

            let header = &self.buffer[self.pos..self.pos + HEADER_SIZE];
            let expected_crc = LittleEndian::read_u32(&header[0..4]);
            let length = LittleEndian::read_u16(&header[4..6]) as usize;
            let type_byte = header[6];
            let fragment_start =
                self.buffer_end_offset - (self.buffer.len() - self.pos) as u64;

            if self.pos + HEADER_SIZE + length > self.buffer.len() {
                self.pos = self.buffer.len();
                if self.eof {
                    // A write interrupted mid-fragment; drop silently.
                    return Ok(Fragment::Eof);
                }
                tracing::warn!(length, "physical record overruns its page");
                return Ok(Fragment::Bad);
            }

            if type_byte == RecordType::Zero as u8 && length == 0 {
                // Pre-zeroed region; nothing else decodable in this page.
                self.pos = self.buffer.len();
                return Ok(Fragment::Bad);
            }

            let rtype = match RecordType::from_u8(type_byte) {
                Some(rtype) => rtype,
                None => {
                    tracing::warn!(type_byte, "unknown physical record type");
                    self.pos = self.buffer.len();
                    return Ok(Fragment::Bad);
                }
            };

            let payload =
                &self.buffer[self.pos + HEADER_SIZE..self.pos + HEADER_SIZE + length];

            if self.verify && record_crc(rtype, payload) != expected_crc {
                self.pos = self.buffer.len();
                return Err(corruption!("log record checksum mismatch"));
            }

            let payload = payload.to_vec();
            self.pos += HEADER_SIZE + length;

            if fragment_start < self.initial_offset {
                return Ok(Fragment::Bad);
            }

            return Ok(Fragment::Record(rtype, payload));
        }
    }

    fn skip_to_initial_block(&mut self) -> Result<()> {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start = self.initial_offset - offset_in_block;
        if BLOCK_SIZE as u64 - offset_in_block < HEADER_SIZE as u64 {
            // The target byte sits in trailer padding; its record starts in
            // the next page.
            block_start += BLOCK_SIZE as u64;
        }
        self.file.seek(SeekFrom::Start(block_start))?;
        self.buffer_end_offset = block_start;
        Ok(())
    }
}

/// Reads until the buffer is full or EOF; returns bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
