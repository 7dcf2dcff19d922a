use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use super::{record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::error::Result;

/// Appends user records to a log file, fragmenting across 32 KiB pages.
pub struct Writer {
    file: File,
    block_offset: usize,
}

impl Writer {
    /// Creates a fresh log file, truncating any previous contents.
    pub fn create(path: &Path) -> Result<Writer> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Writer {
            file,
            block_offset: 0,
        })
    }

    /// Appends one user record. Returns the number of bytes written,
    /// including fragment headers and any page padding emitted first.
    pub fn add_record(&mut self, data: &[u8]) -> Result<usize> {
        let mut left = data.len();
        let mut offset = 0;
        let mut begin = true;
        let mut written = 0;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    self.file.write_all(&[0u8; HEADER_SIZE][..leftover])?;
                    written += leftover;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.min(avail);
            let end = left == fragment_len;

            let rtype = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(rtype, &data[offset..offset + fragment_len])?;
            written += HEADER_SIZE + fragment_len;
            self.block_offset += HEADER_SIZE + fragment_len;

            offset += fragment_len;
            left -= fragment_len;
            begin = false;
            if left == 0 {
                break;
            }
        }
        Ok(written)
    }

    /// Flushes buffered data to the OS and fsyncs.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn emit_physical_record(&mut self, rtype: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.write_u32::<LittleEndian>(record_crc(rtype, payload))?;
        header.write_u16::<LittleEndian>(payload.len() as u16)?;
        header.push(rtype as u8);

        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        Ok(())
    }
}
