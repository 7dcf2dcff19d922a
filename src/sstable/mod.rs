//! Immutable sorted table files.
//!
//! ```text
//! +--------------+---------+--------------+---------+-----+
//! | data block 0 | trailer | data block 1 | trailer | ... |
//! +--------------+---------+--------------+---------+-----+
//! | filter block | metaindex block | index block | footer |
//! +--------------+-----------------+-------------+--------+
//! ```
//!
//! Each data block carries a 5-byte trailer (`u8 compression = 0 | u32
//! crc32c`). The index block maps shortened separator keys to data-block
//! handles; the metaindex maps `"filter.<policy>"` to the filter block. The
//! footer is the fixed-size entry point at end of file.

pub mod block;
pub mod builder;
mod reader;
mod two_level;

pub use builder::{build_table, TableBuilder};
pub use reader::Table;
pub use two_level::TwoLevelIterator;

use crc::{Crc, CRC_32_ISCSI};

use crate::coding::{decode_fixed32, decode_fixed64, put_fixed32, put_fixed64};
use crate::corruption;
use crate::error::Result;

/// Magic trailer identifying an sstable.
pub const TABLE_MAGIC: u64 = 0xdb4775248b80fb57;

/// Encoded footer length: two block handles plus the magic.
pub const FOOTER_SIZE: usize = 24;

/// Data-block trailer length: compression flag plus checksum.
pub const BLOCK_TRAILER_SIZE: usize = 5;

pub(crate) const BLOCK_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Location of a block within the table file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub size: u64,
    pub offset: u64,
}

impl BlockHandle {
    pub fn new(size: u64, offset: u64) -> BlockHandle {
        BlockHandle { size, offset }
    }

    /// Eight bytes: `u32 size | u32 offset`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        put_fixed32(&mut buf, self.size as u32);
        put_fixed32(&mut buf, self.offset as u32);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<BlockHandle> {
        if data.len() < 8 {
            return Err(corruption!("block handle truncated"));
        }
        Ok(BlockHandle {
            size: decode_fixed32(data) as u64,
            offset: decode_fixed32(&data[4..]) as u64,
        })
    }
}

/// The fixed 24 bytes at end of file locating the metaindex and index.
#[derive(Clone, Copy, Debug)]
pub struct Footer {
    pub metaindex: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        buf.extend_from_slice(&self.metaindex.encode());
        buf.extend_from_slice(&self.index.encode());
        put_fixed64(&mut buf, TABLE_MAGIC);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Footer> {
        if data.len() < FOOTER_SIZE {
            return Err(corruption!("footer truncated"));
        }
        if decode_fixed64(&data[16..]) != TABLE_MAGIC {
            return Err(corruption!("bad table magic number"));
        }
        Ok(Footer {
            metaindex: BlockHandle::decode(data)?,
            index: BlockHandle::decode(&data[8..])?,
        })
    }
}
