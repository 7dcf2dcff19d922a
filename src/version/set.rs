//! The version set: every live version, the manifest, and the counters
//! that name files and order writes.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::config::{
    max_bytes_for_level, Options, ReadOptions, L0_COMPACTION_TRIGGER, MAX_LEVEL,
};
use crate::corruption;
use crate::error::{Error, Result};
use crate::filename::{current_file_name, descriptor_file_name, set_current_file};
use crate::iterator::{Iter, MergeIterator};
use crate::keys::{Comparator, InternalKey, InternalKeyComparator};
use crate::table_cache::TableCache;
use crate::wal;

use super::builder::VersionBuilder;
use super::compaction::Compaction;
use super::edit::VersionEdit;
use super::version::{new_level_iter, total_file_size, Version};

pub struct VersionSet {
    dbname: PathBuf,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: u64,
    /// Number of the WAL backing the active memtable; older logs are
    /// obsolete once recorded here.
    log_number: u64,

    current: Arc<Version>,
    /// Versions still referenced by iterators; pruned lazily.
    live: Vec<Weak<Version>>,

    /// Per-level resume key: the next compaction at a level starts past
    /// the last key it compacted.
    compact_pointers: Vec<Vec<u8>>,

    descriptor_log: Option<wal::Writer>,
}

impl VersionSet {
    pub fn new(
        dbname: PathBuf,
        options: &Options,
        table_cache: Arc<TableCache>,
    ) -> VersionSet {
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let current = Arc::new(Version::empty(icmp.clone(), Arc::clone(&table_cache)));
        VersionSet {
            dbname,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            current,
            live: Vec::new(),
            compact_pointers: vec![Vec::new(); MAX_LEVEL],
            descriptor_log: None,
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Hands back the most recently allocated number, e.g. when the file
    /// it was meant for never materialized.
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(self.current.files(level))
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.needs_compaction()
    }

    /// File numbers referenced by any version an iterator may still hold.
    pub fn live_files(&mut self) -> HashSet<u64> {
        let mut live = HashSet::new();
        self.live.retain(|weak| {
            if let Some(version) = weak.upgrade() {
                for level in 0..MAX_LEVEL {
                    for file in version.files(level) {
                        live.insert(file.number);
                    }
                }
                true
            } else {
                false
            }
        });
        for level in 0..MAX_LEVEL {
            for file in self.current.files(level) {
                live.insert(file.number);
            }
        }
        live
    }

    /// Applies `edit` to the current version, persists it in the manifest,
    /// and installs the result as current. On any failure the transition
    /// is abandoned and the current version is unchanged.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(number) => {
                debug_assert!(number >= self.log_number);
                debug_assert!(number < self.next_file_number);
            }
            None => edit.set_log_number(self.log_number),
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut builder = VersionBuilder::new(self.icmp.clone());
        builder.apply(edit);
        let mut version = builder.finish(&self.current);
        self.finalize(&mut version);

        // First write after open: start a fresh manifest seeded with a
        // snapshot of the current state.
        let created = self.descriptor_log.is_none();
        if created {
            let path = descriptor_file_name(&self.dbname, self.manifest_file_number);
            let result = wal::Writer::create(&path).and_then(|mut log| {
                let snapshot = self.snapshot_edit();
                log.add_record(&snapshot.encode())?;
                Ok(log)
            });
            match result {
                Ok(log) => self.descriptor_log = Some(log),
                Err(err) => {
                    let _ = fs::remove_file(&path);
                    return Err(err);
                }
            }
        }

        let append = (|| -> Result<()> {
            let log = self.descriptor_log.as_mut().expect("manifest open");
            log.add_record(&edit.encode())?;
            log.sync()?;
            if created {
                set_current_file(&self.dbname, self.manifest_file_number)?;
            }
            Ok(())
        })();
        if let Err(err) = append {
            if created {
                self.descriptor_log = None;
                let _ = fs::remove_file(descriptor_file_name(
                    &self.dbname,
                    self.manifest_file_number,
                ));
            }
            return Err(err);
        }

        self.log_number = edit.log_number.expect("filled above");
        for (level, key) in &edit.compact_pointers {
            self.compact_pointers[*level] = key.encoded().to_vec();
        }

        let version = Arc::new(version);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
        Ok(())
    }

    /// Rebuilds state from CURRENT and the manifest it names.
    pub fn recover(&mut self) -> Result<()> {
        let current_contents = fs::read_to_string(current_file_name(&self.dbname))?;
        let manifest_name = current_contents.trim_end_matches('\n');
        if manifest_name.is_empty() || manifest_name.len() == current_contents.len() {
            return Err(corruption!("CURRENT file is malformed"));
        }
        let manifest_path = self.dbname.join(manifest_name);

        let mut reader = wal::Reader::open(&manifest_path, true, 0)?;
        let mut builder = VersionBuilder::new(self.icmp.clone());
        let mut log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator_name {
                let configured = self.icmp.user_comparator().name();
                if name != configured {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: db uses {name}, options supply {configured}"
                    )));
                }
            }

            builder.apply(&edit);
            for (level, key) in &edit.compact_pointers {
                self.compact_pointers[*level] = key.encoded().to_vec();
            }
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        let next_file_number =
            next_file_number.ok_or_else(|| corruption!("manifest lacks a file number"))?;
        let log_number = log_number.ok_or_else(|| corruption!("manifest lacks a log number"))?;
        let last_sequence =
            last_sequence.ok_or_else(|| corruption!("manifest lacks a sequence number"))?;

        let mut version = builder.finish(&self.current);
        self.finalize(&mut version);
        let version = Arc::new(version);
        self.live.push(Arc::downgrade(&version));
        self.current = version;

        self.next_file_number = next_file_number;
        self.mark_file_number_used(log_number);
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        // Descriptor edits continue into a fresh manifest.
        self.manifest_file_number = self.new_file_number();

        tracing::info!(
            manifest = manifest_name,
            log_number,
            next_file_number,
            last_sequence,
            "recovered version state"
        );
        Ok(())
    }

    /// Chooses the next compaction, size-triggered first, then
    /// seek-triggered. None when nothing is due.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();

        let mut c = if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            let mut c = Compaction::new(level, Arc::clone(&current));

            // Resume past the last compacted key at this level.
            let pointer = &self.compact_pointers[level];
            for file in current.files(level) {
                if pointer.is_empty()
                    || self
                        .icmp
                        .compare(file.largest.encoded(), pointer)
                        .is_gt()
                {
                    c.inputs[0].push(Arc::clone(file));
                    break;
                }
            }
            if c.inputs[0].is_empty() {
                // Pointer is past the end of the level; wrap around.
                if let Some(file) = current.files(level).first() {
                    c.inputs[0].push(Arc::clone(file));
                }
            }
            if c.inputs[0].is_empty() {
                return None;
            }
            c
        } else {
            // A poisoned slot yields no seek candidate.
            let seek = match current.file_to_compact.lock() {
                Ok(slot) => slot.clone(),
                Err(_) => None,
            };
            let (level, file) = seek?;
            let mut c = Compaction::new(level, Arc::clone(&current));
            c.inputs[0].push(file);
            c
        };

        if c.level == 0 {
            let (smallest, largest) = self.get_range(&c.inputs[0]);
            c.inputs[0] = current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let current = self.current();
        let (smallest, largest) = self.get_range(&c.inputs[0]);
        c.inputs[1] = current.get_overlapping_inputs(c.level + 1, Some(&smallest), Some(&largest));

        let (all_start, all_limit) = if c.inputs[1].is_empty() {
            (smallest.clone(), largest.clone())
        } else {
            let mut all = c.inputs[0].clone();
            all.extend(c.inputs[1].iter().cloned());
            self.get_range(&all)
        };

        if c.level + 2 < MAX_LEVEL {
            c.grandparents =
                current.get_overlapping_inputs(c.level + 2, Some(&all_start), Some(&all_limit));
        }

        // The next compaction at this level resumes after everything this
        // one covers; recorded both in memory and in the edit so recovery
        // restores it.
        self.compact_pointers[c.level] = largest.encoded().to_vec();
        c.edit.set_compact_pointer(c.level, largest);
    }

    /// Merge iterator over every input of `c`. Level-0 inputs each get
    /// their own table iterator; sorted levels share one concatenating
    /// iterator.
    pub fn make_input_iterator(&self, c: &Compaction) -> MergeIterator {
        let read_options = ReadOptions {
            verify_checksums: true,
            fill_cache: false,
        };

        let mut iters: Vec<Box<dyn Iter>> = Vec::new();
        if c.level == 0 {
            for file in &c.inputs[0] {
                iters.push(
                    self.table_cache
                        .iter(read_options, file.number, file.size),
                );
            }
        } else {
            iters.push(Box::new(new_level_iter(
                self.icmp.clone(),
                Arc::clone(&self.table_cache),
                read_options,
                c.inputs[0].clone(),
            )));
        }
        if !c.inputs[1].is_empty() {
            iters.push(Box::new(new_level_iter(
                self.icmp.clone(),
                Arc::clone(&self.table_cache),
                read_options,
                c.inputs[1].clone(),
            )));
        }

        MergeIterator::new(Arc::new(self.icmp.clone()), iters)
    }

    /// Smallest and largest internal keys across a set of files.
    fn get_range(&self, files: &[Arc<super::version::FileMetaData>]) -> (InternalKey, InternalKey) {
        debug_assert!(!files.is_empty());
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for file in &files[1..] {
            if self.icmp.compare_keys(&file.smallest, &smallest).is_lt() {
                smallest = file.smallest.clone();
            }
            if self.icmp.compare_keys(&file.largest, &largest).is_gt() {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }

    /// Scores the version: level 0 by file count, deeper levels by byte
    /// budget. The winning level is what `pick_compaction` works on.
    fn finalize(&self, version: &mut Version) {
        let mut best_level = 0;
        let mut best_score = -1.0f64;

        for level in 0..MAX_LEVEL - 1 {
            let score = if level == 0 {
                version.num_files(0) as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                total_file_size(version.files(level)) as f64 / max_bytes_for_level(level)
            };
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }

        version.compaction_level = best_level;
        version.compaction_score = best_score;
    }

    /// A self-contained edit reproducing the current state, written at the
    /// head of each new manifest.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if !pointer.is_empty() {
                edit.set_compact_pointer(level, InternalKey::decode_from(pointer));
            }
        }
        for level in 0..MAX_LEVEL {
            for file in self.current.files(level) {
                edit.add_file(
                    level,
                    file.number,
                    file.size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        edit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ValueType;

    fn new_set(dir: &tempfile::TempDir) -> VersionSet {
        let options = Options::new();
        let cache = Arc::new(TableCache::new(
            dir.path().to_path_buf(),
            options.clone(),
            4,
        ));
        VersionSet::new(dir.path().to_path_buf(), &options, cache)
    }

    fn ikey(user: &str, seq: u64) -> InternalKey {
        InternalKey::new(user.as_bytes(), seq, ValueType::Value)
    }

    #[test]
    fn test_file_number_allocation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut set = new_set(&dir);
        let a = set.new_file_number();
        let b = set.new_file_number();
        assert_eq!(b, a + 1);
        set.reuse_file_number(b);
        assert_eq!(set.new_file_number(), b);
        set.mark_file_number_used(100);
        assert_eq!(set.new_file_number(), 101);
    }

    #[test]
    fn test_log_and_apply_then_recover() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");

        {
            let mut set = new_set(&dir);
            set.manifest_file_number = set.new_file_number();

            let mut edit = VersionEdit::new();
            edit.set_comparator_name("emberdb.BytewiseComparator");
            edit.add_file(0, 10, 2048, ikey("aaa", 5), ikey("mmm", 9));
            edit.add_file(1, 11, 4096, ikey("aaa", 4), ikey("zzz", 4));
            set.set_last_sequence(9);
            set.log_and_apply(&mut edit)?;

            assert_eq!(set.num_level_files(0), 1);
            assert_eq!(set.num_level_files(1), 1);
            assert_eq!(set.num_level_bytes(1), 4096);

            let mut edit = VersionEdit::new();
            edit.delete_file(0, 10);
            edit.add_file(1, 12, 1024, ikey("aaa", 9), ikey("lll", 9));
            set.log_and_apply(&mut edit)?;
            assert_eq!(set.num_level_files(0), 0);
            assert_eq!(set.num_level_files(1), 2);
        }

        // Fresh set recovers the same live-file set from the manifest.
        let mut set = new_set(&dir);
        set.recover()?;
        assert_eq!(set.num_level_files(0), 0);
        assert_eq!(set.num_level_files(1), 2);
        assert_eq!(set.last_sequence(), 9);
        let live = set.live_files();
        assert!(live.contains(&11));
        assert!(live.contains(&12));
        assert!(!live.contains(&10));
        Ok(())
    }

    #[test]
    fn test_recover_rejects_comparator_mismatch() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut set = new_set(&dir);
            set.manifest_file_number = set.new_file_number();
            let mut edit = VersionEdit::new();
            edit.set_comparator_name("some.other.Comparator");
            edit.add_file(0, 10, 2048, ikey("a", 5), ikey("m", 9));
            set.log_and_apply(&mut edit)?;
        }

        let mut set = new_set(&dir);
        assert!(matches!(
            set.recover(),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_compaction_scoring_prefers_full_level0() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut set = new_set(&dir);
        set.manifest_file_number = set.new_file_number();

        let mut edit = VersionEdit::new();
        for i in 0..4u64 {
            edit.add_file(
                0,
                10 + i,
                1024,
                ikey(&format!("a{i}"), i + 1),
                ikey(&format!("m{i}"), i + 1),
            );
        }
        set.log_and_apply(&mut edit)?;

        assert!(set.needs_compaction());
        let c = set.pick_compaction().expect("compaction due");
        assert_eq!(c.level, 0);
        assert_eq!(c.num_input_files(0), 4);
        Ok(())
    }

    #[test]
    fn test_no_compaction_when_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut set = new_set(&dir);
        assert!(!set.needs_compaction());
        assert!(set.pick_compaction().is_none());
    }
}
