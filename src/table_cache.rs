//! Bounded cache of open sstable readers.
//!
//! Keyed by file number; capacity `TABLE_CACHE_ENTRIES`. Eviction is FIFO
//! over insertion order; a hit does not refresh an entry's position.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{Options, ReadOptions};
use crate::error::Result;
use crate::filename::table_file_name;
use crate::iterator::{EmptyIter, Iter};
use crate::sstable::Table;

pub struct TableCache {
    dbname: PathBuf,
    options: Options,
    entries: usize,
    state: Mutex<CacheState>,
}

struct CacheState {
    cache: HashMap<u64, Arc<Table>>,
    order: VecDeque<u64>,
}

impl TableCache {
    pub fn new(dbname: PathBuf, options: Options, entries: usize) -> TableCache {
        TableCache {
            dbname,
            options,
            entries,
            state: Mutex::new(CacheState {
                cache: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Returns the open table for `number`, opening `<db>/<number>.ldb` on
    /// a miss and evicting the oldest entry once over capacity.
    pub fn find_table(&self, number: u64, file_size: u64) -> Result<Arc<Table>> {
        {
            let state = self.state.lock().unwrap();
            if let Some(table) = state.cache.get(&number) {
                return Ok(Arc::clone(table));
            }
        }

        // Open outside the lock; a racing open of the same table is
        // harmless and the second insert wins.
        let path = table_file_name(&self.dbname, number);
        let table = Arc::new(Table::open(&self.options, &path, file_size)?);

        let mut state = self.state.lock().unwrap();
        while state.cache.len() >= self.entries {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.cache.remove(&oldest);
                }
                None => break,
            }
        }
        if state.cache.insert(number, Arc::clone(&table)).is_none() {
            state.order.push_back(number);
        }
        Ok(table)
    }

    /// Point lookup through the cache. Returns the first entry at or after
    /// `key` in the table, or None.
    pub fn get(
        &self,
        read_options: &ReadOptions,
        number: u64,
        file_size: u64,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(number, file_size)?;
        table.get(read_options, key)
    }

    /// Iterator over the given table; unreadable tables iterate as empty.
    pub fn iter(&self, read_options: ReadOptions, number: u64, file_size: u64) -> Box<dyn Iter> {
        match self.find_table(number, file_size) {
            Ok(table) => Box::new(table.iter(read_options)),
            Err(err) => {
                tracing::warn!(number, error = %err, "unable to open sstable");
                Box::new(EmptyIter)
            }
        }
    }

    /// Drops the entry for a deleted file immediately.
    pub fn evict(&self, number: u64) {
        let mut state = self.state.lock().unwrap();
        state.cache.remove(&number);
        state.order.retain(|n| *n != number);
    }

    #[cfg(test)]
    fn cached_count(&self) -> usize {
        self.state.lock().unwrap().cache.len()
    }
}
