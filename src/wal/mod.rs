//! Write-ahead log format.
//!
//! A log file is a sequence of 32 KiB pages. Each page holds physical
//! records; a user record that does not fit in the remainder of a page is
//! split into First/Middle/Last fragments. Page tails shorter than a record
//! header are zero-padded.
//!
//! ```text
//! +--------- 32 KiB page ----------+--------- 32 KiB page ----------+
//! | [hdr|payload] [hdr|payload] 00 | [hdr|payload] [hdr|payload] ...|
//! +--------------------------------+--------------------------------+
//!
//! header: u32 crc32c(type || payload) | u16 payload_len | u8 type
//! ```
//!
//! The same format carries both memtable logs and the manifest.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

use crc::{Crc, CRC_32_ISCSI};

/// Page size; records never span a page boundary undeclared.
pub const BLOCK_SIZE: usize = 32768;

/// Bytes of physical record header: checksum, length, type.
pub const HEADER_SIZE: usize = 7;

pub(crate) const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Physical record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Padding produced by pre-zeroed page tails; never written explicitly.
    Zero = 0,
    /// A whole user record in one fragment.
    Full = 1,
    /// First fragment of a spanning record.
    First = 2,
    /// Interior fragment of a spanning record.
    Middle = 3,
    /// Final fragment of a spanning record.
    Last = 4,
}

impl RecordType {
    pub(crate) fn from_u8(value: u8) -> Option<RecordType> {
        match value {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

/// Checksum of a physical record: the type byte chained with the payload.
pub(crate) fn record_crc(rtype: RecordType, payload: &[u8]) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(&[rtype as u8]);
    digest.update(payload);
    digest.finalize()
}
