use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use super::block::Block;
use super::two_level::TwoLevelIterator;
use super::{BlockHandle, Footer, BLOCK_CRC, BLOCK_TRAILER_SIZE, FOOTER_SIZE};
use crate::coding::decode_fixed32;
use crate::config::{Options, ReadOptions};
use crate::corruption;
use crate::error::Result;
use crate::iterator::{EmptyIter, Iter};
use crate::keys::{BytewiseComparator, Comparator};
use crate::filter::FilterBlockReader;

/// An open sstable. Immutable once built; safe to share across threads
/// behind an `Arc`.
pub struct Table {
    cmp: Arc<dyn Comparator>,
    file: File,
    file_size: u64,
    index: Arc<Block>,
    filter: Option<FilterBlockReader>,
}

impl Table {
    /// Opens the table at `path`, which must be exactly `file_size` bytes,
    /// and loads its footer, index, and (when the configured policy matches
    /// the metaindex entry) filter block.
    pub fn open(options: &Options, path: &Path, file_size: u64) -> Result<Table> {
        let mut file = File::open(path)?;
        if file_size < FOOTER_SIZE as u64 {
            return Err(corruption!("file too short to be an sstable"));
        }

        let mut footer_bytes = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(file_size - FOOTER_SIZE as u64))?;
        file.read_exact(&mut footer_bytes)?;
        let footer = Footer::decode(&footer_bytes)?;

        if footer.index.size > file_size || footer.metaindex.size > file_size {
            return Err(corruption!("footer handles exceed file size"));
        }

        let index_contents = read_exact_at(&mut file, footer.index)?;
        let index = Arc::new(Block::new(index_contents)?);

        let filter = match &options.filter_policy {
            Some(policy) => {
                let metaindex_contents = read_exact_at(&mut file, footer.metaindex)?;
                let metaindex = Arc::new(Block::new(metaindex_contents)?);
                let mut iter = metaindex.iter(Arc::new(BytewiseComparator));
                let name = format!("filter.{}", policy.name());
                iter.seek(name.as_bytes());
                if iter.valid() && iter.key() == name.as_bytes() {
                    let handle = BlockHandle::decode(iter.value())?;
                    let contents = read_exact_at(&mut file, handle)?;
                    FilterBlockReader::new(Arc::clone(policy), contents)
                } else {
                    None
                }
            }
            None => None,
        };

        Ok(Table {
            cmp: Arc::clone(&options.comparator),
            file,
            file_size,
            index,
            filter,
        })
    }

    /// Point lookup: index seek, filter check, block seek. Returns the
    /// first entry with key >= `key`, which the caller inspects against the
    /// sought key.
    pub fn get(
        &self,
        read_options: &ReadOptions,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index.iter(Arc::clone(&self.cmp));
        index_iter.seek(key);
        if !index_iter.valid() {
            return Ok(None);
        }

        let handle = BlockHandle::decode(index_iter.value())?;
        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, key) {
                return Ok(None);
            }
        }

        let block = self.read_block(handle, read_options)?;
        let mut block_iter = block.iter(Arc::clone(&self.cmp));
        block_iter.seek(key);
        if !block_iter.valid() {
            return Ok(None);
        }
        Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
    }

    /// Two-level iterator over the whole table.
    pub fn iter(self: &Arc<Self>, read_options: ReadOptions) -> TwoLevelIterator {
        let table = Arc::clone(self);
        let index_iter = self.index.iter(Arc::clone(&self.cmp));
        TwoLevelIterator::new(
            Box::new(index_iter),
            Box::new(move |handle_bytes: &[u8]| table.block_iter(handle_bytes, &read_options)),
        )
    }

    /// Approximate file offset where `key`'s data would live.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = self.index.iter(Arc::clone(&self.cmp));
        index_iter.seek(key);
        if index_iter.valid() {
            if let Ok(handle) = BlockHandle::decode(index_iter.value()) {
                return handle.offset;
            }
        }
        self.file_size
    }

    fn block_iter(&self, handle_bytes: &[u8], read_options: &ReadOptions) -> Box<dyn Iter> {
        let handle = match BlockHandle::decode(handle_bytes) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable index entry");
                return Box::new(EmptyIter);
            }
        };
        match self.read_block(handle, read_options) {
            Ok(block) => Box::new(block.iter(Arc::clone(&self.cmp))),
            Err(err) => {
                tracing::warn!(error = %err, offset = handle.offset, "unreadable data block");
                Box::new(EmptyIter)
            }
        }
    }

    /// Reads a data block and its 5-byte trailer, verifying the checksum
    /// when asked.
    fn read_block(&self, handle: BlockHandle, read_options: &ReadOptions) -> Result<Arc<Block>> {
        let total = handle.size as usize + BLOCK_TRAILER_SIZE;
        if handle.offset + total as u64 > self.file_size {
            return Err(corruption!("block handle out of file range"));
        }

        let mut raw = vec![0u8; total];
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(handle.offset))?;
        file.read_exact(&mut raw)?;

        let contents = &raw[..handle.size as usize];
        let trailer = &raw[handle.size as usize..];
        if trailer[0] != 0 {
            return Err(corruption!("unknown block compression flag {}", trailer[0]));
        }
        if read_options.verify_checksums {
            let expected = decode_fixed32(&trailer[1..]);
            if BLOCK_CRC.checksum(contents) != expected {
                return Err(corruption!("block checksum mismatch"));
            }
        }

        Ok(Arc::new(Block::new(contents.to_vec())?))
    }
}

fn read_exact_at(file: &mut File, handle: BlockHandle) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; handle.size as usize];
    file.seek(SeekFrom::Start(handle.offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}
