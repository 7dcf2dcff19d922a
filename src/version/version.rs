//! Versions: immutable snapshots of the per-level file set.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::coding::{decode_fixed64, put_fixed64};
use crate::config::{ReadOptions, MAX_LEVEL, MAX_MEM_COMPACT_LEVEL};
use crate::error::{Error, Result};
use crate::iterator::Iter;
use crate::keys::{Comparator, InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType};
use crate::sstable::TwoLevelIterator;
use crate::table_cache::TableCache;

/// Metadata for one sstable file.
#[derive(Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Budget of fruitless lookups this file may absorb before it becomes a
    /// compaction candidate. Roughly one seek is worth 16 KiB of
    /// compaction I/O; very small files get a floor so a handful of misses
    /// does not churn them.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, size: u64, smallest: InternalKey, largest: InternalKey) -> FileMetaData {
        let allowed = ((size / 16384) as i64).max(100);
        FileMetaData {
            number,
            size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed),
        }
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        FileMetaData {
            number: self.number,
            size: self.size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for FileMetaData {
    fn eq(&self, other: &Self) -> bool {
        // The seek budget is runtime state, not identity.
        self.number == other.number
            && self.size == other.size
            && self.smallest == other.smallest
            && self.largest == other.largest
    }
}

/// Sum of file sizes at one level.
pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// Side data from a `Version::get`: the file to charge when the lookup had
/// to probe more than one file.
#[derive(Default)]
pub struct GetStats {
    pub seek_file: Option<(usize, Arc<FileMetaData>)>,
}

/// An immutable snapshot of the database's file layout. Reads walk it
/// newest-level-first; the compaction scheduler reads the score computed
/// when the version was installed.
pub struct Version {
    pub(crate) icmp: InternalKeyComparator,
    pub(crate) table_cache: Arc<TableCache>,
    pub(crate) files: Vec<Vec<Arc<FileMetaData>>>,
    /// Level whose score drove `compaction_score`.
    pub(crate) compaction_level: usize,
    /// >= 1.0 means the level is due for compaction.
    pub(crate) compaction_score: f64,
    /// File that exhausted its seek budget, if any.
    pub(crate) file_to_compact: Mutex<Option<(usize, Arc<FileMetaData>)>>,
}

impl Version {
    pub(crate) fn empty(icmp: InternalKeyComparator, table_cache: Arc<TableCache>) -> Version {
        Version {
            icmp,
            table_cache,
            files: vec![Vec::new(); MAX_LEVEL],
            compaction_level: 0,
            compaction_score: -1.0,
            file_to_compact: Mutex::new(None),
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    /// Point lookup across the levels, newest first. `Some(Some(v))` is a
    /// value, `Some(None)` a tombstone, `None` a miss everywhere.
    pub fn get(
        &self,
        read_options: &ReadOptions,
        key: &LookupKey,
        stats: &mut GetStats,
    ) -> Result<Option<Option<Vec<u8>>>> {
        let ikey = key.internal_key();
        let ukey = key.user_key();
        let ucmp = Arc::clone(self.icmp.user_comparator());

        let mut last_file_read: Option<(usize, Arc<FileMetaData>)> = None;

        for level in 0..MAX_LEVEL {
            let candidates = self.candidates_for(level, ukey, ikey);
            for file in candidates {
                // A lookup touching a second file charges the first; enough
                // charges and the file earns a compaction of its own.
                if stats.seek_file.is_none() {
                    if let Some(prior) = last_file_read.take() {
                        stats.seek_file = Some(prior);
                    }
                }
                last_file_read = Some((level, Arc::clone(&file)));

                let found =
                    match self
                        .table_cache
                        .get(read_options, file.number, file.size, ikey)
                    {
                        Ok(found) => found,
                        Err(Error::Corruption(msg)) => {
                            // A damaged block means the key is not readable
                            // from this file; later levels may still hold it.
                            tracing::warn!(file = file.number, error = %msg, "corrupt table block during get");
                            continue;
                        }
                        Err(err) => return Err(err),
                    };

                if let Some((found_key, found_value)) = found {
                    let parsed = ParsedInternalKey::decode(&found_key)?;
                    if ucmp.compare(parsed.user_key, ukey) == CmpOrdering::Equal {
                        match parsed.vtype {
                            ValueType::Value => return Ok(Some(Some(found_value))),
                            ValueType::Deletion => return Ok(Some(None)),
                            ValueType::Seek => {}
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Applies the seek charge from a finished lookup. Returns true when a
    /// file just exhausted its budget and compaction should be considered.
    pub fn update_stats(&self, stats: GetStats) -> Result<bool> {
        if let Some((level, file)) = stats.seek_file {
            if file.allowed_seeks.fetch_sub(1, Ordering::Relaxed) == 1 {
                let mut slot = self.file_to_compact.lock().map_err(Error::from)?;
                if slot.is_none() {
                    *slot = Some((level, file));
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Files that may hold `ukey` at a level, in probe order.
    fn candidates_for(&self, level: usize, ukey: &[u8], ikey: &[u8]) -> Vec<Arc<FileMetaData>> {
        let files = &self.files[level];
        let ucmp = self.icmp.user_comparator();

        if level == 0 {
            // Level-0 files overlap; probe every cover, newest file first.
            let mut overlapping: Vec<Arc<FileMetaData>> = files
                .iter()
                .filter(|f| {
                    ucmp.compare(ukey, f.smallest.user_key()) != CmpOrdering::Less
                        && ucmp.compare(ukey, f.largest.user_key()) != CmpOrdering::Greater
                })
                .cloned()
                .collect();
            overlapping.sort_by(|a, b| b.number.cmp(&a.number));
            return overlapping;
        }

        // Sorted, disjoint: at most one candidate.
        let index = files.partition_point(|f| {
            self.icmp.compare(f.largest.encoded(), ikey) == CmpOrdering::Less
        });
        match files.get(index) {
            Some(file)
                if ucmp.compare(ukey, file.smallest.user_key()) != CmpOrdering::Less =>
            {
                vec![Arc::clone(file)]
            }
            _ => Vec::new(),
        }
    }

    /// True iff some file at `level` intersects the user-key range. `None`
    /// bounds are unbounded.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user: Option<&[u8]>,
        largest_user: Option<&[u8]>,
    ) -> bool {
        let files = &self.files[level];
        let ucmp = self.icmp.user_comparator();

        if level == 0 {
            return files.iter().any(|f| {
                let before = largest_user.is_some_and(|largest| {
                    ucmp.compare(f.smallest.user_key(), largest) == CmpOrdering::Greater
                });
                let after = smallest_user.is_some_and(|smallest| {
                    ucmp.compare(f.largest.user_key(), smallest) == CmpOrdering::Less
                });
                !before && !after
            });
        }

        let index = match smallest_user {
            Some(smallest) => files.partition_point(|f| {
                ucmp.compare(f.largest.user_key(), smallest) == CmpOrdering::Less
            }),
            None => 0,
        };
        match files.get(index) {
            None => false,
            Some(file) => !largest_user.is_some_and(|largest| {
                ucmp.compare(file.smallest.user_key(), largest) == CmpOrdering::Greater
            }),
        }
    }

    /// Level where a fresh memtable flush covering the range should land:
    /// 0 when level 0 overlaps, otherwise pushed down while the next level
    /// stays clear, up to `MAX_MEM_COMPACT_LEVEL`.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user: &[u8],
        largest_user: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user), Some(largest_user)) {
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(level + 1, Some(smallest_user), Some(largest_user)) {
                    break;
                }
                level += 1;
            }
        }
        level
    }

    /// Every file at `level` whose range intersects `[begin, end]`. At
    /// level 0 a hit widens the search range (files there overlap each
    /// other), so the scan restarts until the range is stable.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator();
        let mut begin_user = begin.map(|k| k.user_key().to_vec());
        let mut end_user = end.map(|k| k.user_key().to_vec());

        let mut inputs = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;
            let file_start = file.smallest.user_key();
            let file_limit = file.largest.user_key();

            if begin_user
                .as_deref()
                .is_some_and(|b| ucmp.compare(file_limit, b) == CmpOrdering::Less)
            {
                continue;
            }
            if end_user
                .as_deref()
                .is_some_and(|e| ucmp.compare(file_start, e) == CmpOrdering::Greater)
            {
                continue;
            }

            inputs.push(Arc::clone(file));
            if level == 0 {
                // The selected file may extend the range; rescan with the
                // wider bounds so every transitive overlap is captured.
                if begin_user
                    .as_deref()
                    .is_some_and(|b| ucmp.compare(file_start, b) == CmpOrdering::Less)
                {
                    begin_user = Some(file_start.to_vec());
                    inputs.clear();
                    i = 0;
                    continue;
                }
                if end_user
                    .as_deref()
                    .is_some_and(|e| ucmp.compare(file_limit, e) == CmpOrdering::Greater)
                {
                    end_user = Some(file_limit.to_vec());
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
        }
        inputs
    }

    pub fn needs_compaction(&self) -> bool {
        if self.compaction_score >= 1.0 {
            return true;
        }
        // A poisoned slot reports no seek candidate rather than panicking
        // the scheduler.
        self.file_to_compact
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Iterator over one sorted (>= 1) level: the file list indexes into
    /// per-table iterators.
    pub fn concatenating_iter(&self, read_options: ReadOptions, level: usize) -> TwoLevelIterator {
        new_level_iter(
            self.icmp.clone(),
            Arc::clone(&self.table_cache),
            read_options,
            self.files[level].clone(),
        )
    }

    /// One iterator per data source in this version: each level-0 file,
    /// then one concatenating iterator per deeper non-empty level.
    pub fn iters(&self, read_options: ReadOptions) -> Vec<Box<dyn Iter>> {
        let mut iters: Vec<Box<dyn Iter>> = Vec::new();
        for file in &self.files[0] {
            iters.push(self.table_cache.iter(read_options, file.number, file.size));
        }
        for level in 1..MAX_LEVEL {
            if !self.files[level].is_empty() {
                iters.push(Box::new(self.concatenating_iter(read_options, level)));
            }
        }
        iters
    }
}

/// Index iterator over a sorted level's file list: keys are each file's
/// largest internal key, values locate the file for the table cache.
pub struct LevelFileNumIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    values: Vec<Vec<u8>>,
    index: usize,
}

impl LevelFileNumIterator {
    pub fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> LevelFileNumIterator {
        let values = files
            .iter()
            .map(|f| {
                let mut buf = Vec::with_capacity(16);
                put_fixed64(&mut buf, f.number);
                put_fixed64(&mut buf, f.size);
                buf
            })
            .collect();
        let index = files.len();
        LevelFileNumIterator {
            icmp,
            files,
            values,
            index,
        }
    }
}

impl Iter for LevelFileNumIterator {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn key(&self) -> &[u8] {
        self.files[self.index].largest.encoded()
    }

    fn value(&self) -> &[u8] {
        &self.values[self.index]
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.index += 1;
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if self.index == 0 {
            self.index = self.files.len();
        } else {
            self.index -= 1;
        }
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = self.files.partition_point(|f| {
            self.icmp.compare(f.largest.encoded(), target) == CmpOrdering::Less
        });
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
    }

    fn seek_to_last(&mut self) {
        self.index = if self.files.is_empty() {
            self.files.len()
        } else {
            self.files.len() - 1
        };
    }
}

/// Builds the two-level iterator for a sorted run of files.
pub fn new_level_iter(
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    read_options: ReadOptions,
    files: Vec<Arc<FileMetaData>>,
) -> TwoLevelIterator {
    let index = LevelFileNumIterator::new(icmp, files);
    TwoLevelIterator::new(
        Box::new(index),
        Box::new(move |value: &[u8]| {
            let number = decode_fixed64(value);
            let size = decode_fixed64(&value[8..]);
            table_cache.iter(read_options, number, size)
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::keys::BytewiseComparator;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn cache() -> Arc<TableCache> {
        Arc::new(TableCache::new(
            std::env::temp_dir(),
            Options::new(),
            4,
        ))
    }

    fn meta(number: u64, smallest: &str, largest: &str) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            1000,
            InternalKey::new(smallest.as_bytes(), 100, ValueType::Value),
            InternalKey::new(largest.as_bytes(), 100, ValueType::Value),
        ))
    }

    fn version_with(files: Vec<(usize, Arc<FileMetaData>)>) -> Version {
        let mut version = Version::empty(icmp(), cache());
        for (level, file) in files {
            version.files[level].push(file);
        }
        let cmp = icmp();
        for level in 1..MAX_LEVEL {
            version.files[level]
                .sort_by(|a, b| cmp.compare_keys(&a.smallest, &b.smallest));
        }
        version
    }

    #[test]
    fn test_overlap_in_level_zero() {
        let version = version_with(vec![
            (0, meta(1, "a", "m")),
            (0, meta(2, "k", "z")),
        ]);
        assert!(version.overlap_in_level(0, Some(b"l"), Some(b"l")));
        assert!(version.overlap_in_level(0, None, Some(b"b")));
        assert!(version.overlap_in_level(0, Some(b"y"), None));
        assert!(!version.overlap_in_level(1, Some(b"a"), Some(b"z")));
    }

    #[test]
    fn test_overlap_in_sorted_level() {
        let version = version_with(vec![
            (1, meta(3, "a", "f")),
            (1, meta(4, "m", "r")),
        ]);
        assert!(version.overlap_in_level(1, Some(b"e"), Some(b"g")));
        assert!(version.overlap_in_level(1, Some(b"n"), Some(b"n")));
        assert!(!version.overlap_in_level(1, Some(b"g"), Some(b"l")));
        assert!(!version.overlap_in_level(1, Some(b"s"), None));
    }

    #[test]
    fn test_pick_level_for_memtable_output() {
        // Nothing anywhere: push to the max memtable compaction level.
        let version = version_with(vec![]);
        assert_eq!(
            version.pick_level_for_memtable_output(b"a", b"b"),
            MAX_MEM_COMPACT_LEVEL
        );

        // Overlap at level 0 pins the flush at level 0.
        let version = version_with(vec![(0, meta(1, "a", "m"))]);
        assert_eq!(version.pick_level_for_memtable_output(b"b", b"c"), 0);

        // Clear at 0, overlap at 1: stay at level 0.
        let version = version_with(vec![(1, meta(2, "a", "m"))]);
        assert_eq!(version.pick_level_for_memtable_output(b"b", b"c"), 0);

        // Clear at 0 and 1, overlap at 2: land at 1.
        let version = version_with(vec![(2, meta(2, "a", "m"))]);
        assert_eq!(version.pick_level_for_memtable_output(b"b", b"c"), 1);
    }

    #[test]
    fn test_overlapping_inputs_level0_expands() {
        // Picking the "e".."h" range pulls in file 1, whose low end drags
        // the range across file 2 as well.
        let version = version_with(vec![
            (0, meta(1, "c", "f")),
            (0, meta(2, "a", "d")),
            (0, meta(3, "x", "z")),
        ]);
        let begin = InternalKey::new(b"e", crate::keys::MAX_SEQUENCE, ValueType::Seek);
        let end = InternalKey::new(b"h", crate::keys::MAX_SEQUENCE, ValueType::Seek);
        let inputs = version.get_overlapping_inputs(0, Some(&begin), Some(&end));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_overlapping_inputs_sorted_level() {
        let version = version_with(vec![
            (1, meta(1, "a", "c")),
            (1, meta(2, "e", "g")),
            (1, meta(3, "i", "k")),
        ]);
        let begin = InternalKey::new(b"f", crate::keys::MAX_SEQUENCE, ValueType::Seek);
        let end = InternalKey::new(b"j", crate::keys::MAX_SEQUENCE, ValueType::Seek);
        let inputs = version.get_overlapping_inputs(1, Some(&begin), Some(&end));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn test_level_file_num_iterator() {
        let files = vec![meta(1, "a", "c"), meta(2, "e", "g"), meta(3, "i", "k")];
        let mut iter = LevelFileNumIterator::new(icmp(), files);

        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(decode_fixed64(iter.value()), 1);

        let target = InternalKey::new(b"f", crate::keys::MAX_SEQUENCE, ValueType::Seek);
        iter.seek(target.encoded());
        assert!(iter.valid());
        assert_eq!(decode_fixed64(iter.value()), 2);

        iter.seek_to_last();
        assert_eq!(decode_fixed64(iter.value()), 3);
        iter.next();
        assert!(!iter.valid());
    }
}
