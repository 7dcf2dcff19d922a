use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::block::BlockBuilder;
use super::{BlockHandle, Footer, BLOCK_CRC};
use crate::coding::put_fixed32;
use crate::config::Options;
use crate::error::Result;
use crate::filter::FilterBlockBuilder;
use crate::iterator::Iter;
use crate::keys::Comparator;

/// Append-only writer for one sstable. Keys must arrive in comparator
/// order; `finish` seals the file with the filter, metaindex, index, and
/// footer sections.
pub struct TableBuilder {
    cmp: Arc<dyn Comparator>,
    file: File,
    path: PathBuf,
    block_size: usize,
    block: BlockBuilder,
    index_block: BlockBuilder,
    filter: Option<(FilterBlockBuilder, &'static str)>,
    offset: u64,
    num_entries: u64,
    last_key: Vec<u8>,
    finished: bool,
}

impl TableBuilder {
    pub fn new(options: &Options, path: &Path) -> Result<TableBuilder> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let filter = options
            .filter_policy
            .as_ref()
            .map(|policy| (FilterBlockBuilder::new(Arc::clone(policy)), policy.name()));
        Ok(TableBuilder {
            cmp: Arc::clone(&options.comparator),
            file,
            path: path.to_path_buf(),
            block_size: options.block_size,
            block: BlockBuilder::new(options.restart_interval),
            // One entry per data block; no sharing to search against.
            index_block: BlockBuilder::new(1),
            filter,
            offset: 0,
            num_entries: 0,
            last_key: Vec::new(),
            finished: false,
        })
    }

    /// Appends a key/value pair. `key` must sort after every key added so
    /// far.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.finished);
        if self.block.current_size_estimate() >= self.block_size {
            self.flush_data_block(key)?;
        }

        self.block.add(key, value);
        if let Some((filter, _)) = &mut self.filter {
            filter.add_key(key);
        }
        self.num_entries += 1;
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        Ok(())
    }

    /// Seals the table. The file is fsynced but not renamed; the caller owns
    /// moving it into place.
    pub fn finish(mut self) -> Result<u64> {
        if !self.block.is_empty() {
            let successor = self.last_key.clone();
            self.flush_data_block(&successor)?;
        }
        self.finished = true;

        // Filter block, raw (no trailer).
        let mut metaindex = BlockBuilder::new(1);
        if let Some((filter, policy_name)) = self.filter.take() {
            let contents = filter.finish();
            let handle = BlockHandle::new(contents.len() as u64, self.offset);
            self.file.write_all(&contents)?;
            self.offset += contents.len() as u64;

            let key = format!("filter.{policy_name}");
            metaindex.add(key.as_bytes(), &handle.encode());
        }

        let metaindex_contents = metaindex.finish();
        let metaindex_handle =
            BlockHandle::new(metaindex_contents.len() as u64, self.offset);
        self.file.write_all(&metaindex_contents)?;
        self.offset += metaindex_contents.len() as u64;

        let index_contents = self.index_block.finish();
        let index_handle = BlockHandle::new(index_contents.len() as u64, self.offset);
        self.file.write_all(&index_contents)?;
        self.offset += index_contents.len() as u64;

        let footer = Footer {
            metaindex: metaindex_handle,
            index: index_handle,
        };
        let encoded = footer.encode();
        self.file.write_all(&encoded)?;
        self.offset += encoded.len() as u64;

        self.file.sync_all()?;
        Ok(self.offset)
    }

    /// Discards the table under construction and removes its file.
    pub fn abandon(self) -> Result<()> {
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// Writes out the accumulated data block, records its index entry under
    /// a separator shortened against `successor`, and tells the filter a new
    /// block begins at the post-write offset.
    fn flush_data_block(&mut self, successor: &[u8]) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let separator = self.cmp.find_shortest_separator(&self.last_key, successor);
        let contents = self.block.finish();
        self.block.reset();

        let handle = BlockHandle::new(contents.len() as u64, self.offset);
        self.write_raw_block(&contents)?;

        self.index_block.add(&separator, &handle.encode());
        if let Some((filter, _)) = &mut self.filter {
            filter.start_block(self.offset as usize);
        }
        Ok(())
    }

    fn write_raw_block(&mut self, contents: &[u8]) -> Result<()> {
        self.file.write_all(contents)?;

        let mut trailer = Vec::with_capacity(super::BLOCK_TRAILER_SIZE);
        trailer.push(0); // no compression
        put_fixed32(&mut trailer, BLOCK_CRC.checksum(contents));
        self.file.write_all(&trailer)?;

        self.offset += (contents.len() + super::BLOCK_TRAILER_SIZE) as u64;
        Ok(())
    }
}

/// Drains an iterator into a fresh table file. Returns the final file size
/// and the number of entries written; an empty source leaves no file.
pub fn build_table(
    options: &Options,
    path: &Path,
    iter: &mut dyn Iter,
) -> Result<(u64, u64)> {
    iter.seek_to_first();
    if !iter.valid() {
        return Ok((0, 0));
    }

    let mut builder = TableBuilder::new(options, path)?;
    while iter.valid() {
        builder.add(iter.key(), iter.value())?;
        iter.next();
    }
    let entries = builder.num_entries();
    let size = builder.finish()?;
    Ok((size, entries))
}
