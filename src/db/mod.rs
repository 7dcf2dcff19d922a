//! The database handle: open/recover, the writer coordinator, reads, and
//! the background compaction worker.
//!
//! # Write path
//!
//! Writers queue up; the one at the head merges compatible neighbors into
//! a group, appends the group to the WAL, applies it to the memtable, and
//! signals everyone it carried. One mutex protects the queue, the memtable
//! pointers, the version set, and the compaction flag; it is dropped for
//! all file I/O.
//!
//! ```text
//! writers ──> [w3, w2, w1*] ── head merges ──> WAL append ──> memtable
//!                                  │ (rotation when full)
//!                                  v
//!                    imm ──(background thread)──> level-0 table
//!                                  │
//!                                  v
//!                        compaction into level L+1
//! ```
//!
//! # Read path
//!
//! A read captures the memtable, the immutable memtable, and the current
//! version under the mutex, then resolves the key newest-source-first
//! without it.

mod iter;

pub use iter::DbIterator;

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use crate::batch::WriteBatch;
use crate::config::{
    Options, ReadOptions, WriteOptions, L0_STOP_WRITES_TRIGGER, TABLE_CACHE_ENTRIES,
};
use crate::error::{Error, Result};
use crate::filename::{
    current_file_name, info_log_file_name, lock_file_name, log_file_name,
    old_info_log_file_name, parse_file_name, table_file_name, temp_file_name, FileType,
};
use crate::filter::InternalFilterPolicy;
use crate::flock::FileLock;
use crate::iterator::{Iter, MergeIterator};
use crate::keys::{
    Comparator, InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType,
};
use crate::memtable::MemTable;
use crate::sstable::builder::build_table;
use crate::sstable::TableBuilder;
use crate::table_cache::TableCache;
use crate::version::{Compaction, GetStats, VersionEdit, VersionSet};
use crate::wal;

/// Group commit caps: a large head batch may grow to a megabyte; a small
/// one only drags in a bounded amount of company to keep its latency low.
const MAX_GROUP_SIZE: usize = 1 << 20;
const SMALL_BATCH_SIZE: usize = 128 << 10;

struct WriterHandle {
    batch: WriteBatch,
    sync: bool,
    done: AtomicBool,
    error: Mutex<Option<Error>>,
    cv: Condvar,
}

impl WriterHandle {
    fn new(batch: WriteBatch, sync: bool) -> WriterHandle {
        WriterHandle {
            batch,
            sync,
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn finish(&self, result: &Result<()>) {
        if let Err(err) = result {
            *self.error.lock().unwrap() = Some(err.clone());
        }
        self.done.store(true, Ordering::Release);
    }

    fn take_result(&self) -> Result<()> {
        match self.error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct DbState {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    log_file_number: u64,
    versions: VersionSet,
    writers: VecDeque<Arc<WriterHandle>>,
    background_compaction_scheduled: bool,
    bg_error: Option<Error>,
    /// Files being written by compactions; protected from collection.
    pending_outputs: HashSet<u64>,
}

struct DbInner {
    dbname: PathBuf,
    options: Options,
    /// Table options: internal-key comparator, trailer-stripping filter.
    internal_options: Options,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    _lock: FileLock,
    mutex: Mutex<DbState>,
    /// Signaled when a background compaction step completes.
    background_work_finished: Condvar,
    /// Only the head writer touches the log, so this mutex is uncontended;
    /// it exists so rotation and appends need not hold the state mutex.
    log: Mutex<Option<wal::Writer>>,
    shutting_down: AtomicBool,
}

/// An open database.
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Opens (creating if absent) the database in `path`, recovering any
    /// state a previous process left behind.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Db> {
        let dbname = path.as_ref().to_path_buf();
        fs::create_dir_all(&dbname)?;

        // Rotate the informational log for this incarnation.
        let _ = fs::rename(
            info_log_file_name(&dbname),
            old_info_log_file_name(&dbname),
        );
        let _ = fs::File::create(info_log_file_name(&dbname));

        let lock = FileLock::lock(lock_file_name(&dbname))?;

        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let internal_options = Options {
            comparator: Arc::new(icmp.clone()) as Arc<dyn Comparator>,
            filter_policy: options.filter_policy.clone().map(|p| {
                Arc::new(InternalFilterPolicy::new(p)) as Arc<dyn crate::filter::FilterPolicy>
            }),
            ..options.clone()
        };
        let table_cache = Arc::new(TableCache::new(
            dbname.clone(),
            internal_options.clone(),
            TABLE_CACHE_ENTRIES,
        ));
        let mut versions =
            VersionSet::new(dbname.clone(), &internal_options, Arc::clone(&table_cache));

        if !current_file_name(&dbname).exists() {
            create_new_db(&dbname, &icmp)?;
            tracing::info!(db = %dbname.display(), "created new database");
        }
        versions.recover()?;

        // Replay WAL files the manifest does not yet account for.
        let mut edit = VersionEdit::new();
        let mut max_sequence = versions.last_sequence();
        let mem = Arc::new(MemTable::new(icmp.clone()));
        let mut log_numbers: Vec<u64> = fs::read_dir(&dbname)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_file_name(&entry.file_name().to_string_lossy()))
            .filter(|(number, ftype)| {
                *ftype == FileType::Log && *number >= versions.log_number()
            })
            .map(|(number, _)| number)
            .collect();
        log_numbers.sort_unstable();

        for number in &log_numbers {
            versions.mark_file_number_used(*number);
            let recovered =
                replay_log_file(&dbname, *number, &mem)?;
            if let Some(last) = recovered {
                max_sequence = max_sequence.max(last);
            }
        }

        // Recovered writes move straight to a level-0 table so the old
        // logs can be retired.
        if mem.approximate_memory_usage() > 0 {
            let number = versions.new_file_number();
            flush_memtable_to_table(
                &dbname,
                &internal_options,
                &versions,
                &mem,
                number,
                &mut edit,
            )?;
            tracing::info!(file = number, "flushed recovered writes to level 0");
        }

        let new_log_number = versions.new_file_number();
        let log = wal::Writer::create(&log_file_name(&dbname, new_log_number))?;
        edit.set_log_number(new_log_number);
        versions.set_last_sequence(max_sequence);
        versions.log_and_apply(&mut edit)?;

        let inner = Arc::new(DbInner {
            dbname,
            options,
            internal_options,
            icmp: icmp.clone(),
            table_cache,
            _lock: lock,
            mutex: Mutex::new(DbState {
                mem: Arc::new(MemTable::new(icmp)),
                imm: None,
                log_file_number: new_log_number,
                versions,
                writers: VecDeque::new(),
                background_compaction_scheduled: false,
                bg_error: None,
                pending_outputs: HashSet::new(),
            }),
            background_work_finished: Condvar::new(),
            log: Mutex::new(Some(log)),
            shutting_down: AtomicBool::new(false),
        });

        {
            let mut state = inner.mutex.lock()?;
            inner.remove_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
        }

        Ok(Db { inner })
    }

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Applies a batch atomically. The calling thread may block while the
    /// engine makes room (memtable rotation, level-0 backpressure) or
    /// while earlier writers drain.
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        let inner = &self.inner;
        let w = Arc::new(WriterHandle::new(batch, options.sync));

        let mut state = inner.mutex.lock()?;
        state.writers.push_back(Arc::clone(&w));
        while !w.done.load(Ordering::Acquire)
            && !Arc::ptr_eq(state.writers.front().expect("queued"), &w)
        {
            state = w.cv.wait(state)?;
        }
        if w.done.load(Ordering::Acquire) {
            return w.take_result();
        }

        // This writer is the group leader.
        let (mut state, mut status) = inner.make_room_for_write(state, false);
        let mut grouped = 1;

        if status.is_ok() {
            let (mut group, last_index, sync) = build_batch_group(&state);
            grouped = last_index + 1;
            let sequence = state.versions.last_sequence();
            group.set_sequence(sequence + 1);
            let count = group.count() as u64;
            let mem = Arc::clone(&state.mem);

            // WAL append and memtable apply run unlocked; only the head
            // writer can be here, and the queue can only grow behind it.
            drop(state);
            let mut result = match inner.log.lock() {
                Ok(mut log_guard) => {
                    let log = log_guard.as_mut().expect("log open");
                    log.add_record(group.contents()).and_then(|_| {
                        if sync {
                            log.sync()
                        } else {
                            Ok(())
                        }
                    })
                }
                Err(err) => Err(Error::from(err)),
            };
            if result.is_ok() {
                result = group.insert_into(&mem);
            }

            // The waiters must still be signaled, so a poisoned relock
            // recovers the guard and folds the poison into the result.
            state = match inner.mutex.lock() {
                Ok(state) => state,
                Err(poisoned) => {
                    result = result.and(Err(Error::Io(poisoned.to_string())));
                    poisoned.into_inner()
                }
            };
            if result.is_ok() {
                state.versions.set_last_sequence(sequence + count);
            } else {
                // The log may hold a partial record; poison the database
                // rather than risk diverging from what recovery will see.
                state.bg_error = Some(result.clone().unwrap_err());
            }
            status = result;
        }

        for _ in 0..grouped {
            let writer = state.writers.pop_front().expect("grouped writer");
            if !Arc::ptr_eq(&writer, &w) {
                writer.finish(&status);
                writer.cv.notify_one();
            }
        }
        if let Some(front) = state.writers.front() {
            front.cv.notify_one();
        }
        drop(state);

        status
    }

    /// Reads the newest value for `key` visible at the current sequence.
    /// A missing or tombstoned key is `Error::NotFound`.
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let (snapshot, mem, imm, current) = {
            let state = inner.mutex.lock()?;
            (
                state.versions.last_sequence(),
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
            )
        };

        let lkey = LookupKey::new(key, snapshot);
        let value = if let Some(found) = mem.get(&lkey) {
            found
        } else if let Some(found) = imm.as_ref().and_then(|imm| imm.get(&lkey)) {
            found
        } else {
            let mut stats = GetStats::default();
            let found = current.get(options, &lkey, &mut stats)?;
            if current.update_stats(stats)? {
                let mut state = inner.mutex.lock()?;
                inner.maybe_schedule_compaction(&mut state);
            }
            found.unwrap_or(None)
        };

        match value {
            Some(value) => Ok(value),
            None => Err(Error::NotFound),
        }
    }

    /// Ordered iterator over the database at the current sequence.
    pub fn iter(&self, options: &ReadOptions) -> Result<DbIterator> {
        let inner = &self.inner;
        let (snapshot, mem, imm, current) = {
            let state = inner.mutex.lock()?;
            (
                state.versions.last_sequence(),
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
            )
        };

        let mut children: Vec<Box<dyn Iter>> = Vec::new();
        children.push(Box::new(mem.iter()));
        if let Some(imm) = &imm {
            children.push(Box::new(imm.iter()));
        }
        children.extend(current.iters(*options));

        let merged = MergeIterator::new(
            Arc::new(inner.icmp.clone()) as Arc<dyn Comparator>,
            children,
        );
        Ok(DbIterator::new(merged, inner.icmp.clone(), snapshot, current))
    }

    /// Blocks until no background work is scheduled. Reads after this see
    /// every completed flush and compaction.
    pub fn wait_for_background_work(&self) -> Result<()> {
        let mut state = self.inner.mutex.lock()?;
        while state.background_compaction_scheduled {
            state = self.inner.background_work_finished.wait(state)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn num_files_at_level(&self, level: usize) -> Result<usize> {
        Ok(self.inner.mutex.lock()?.versions.num_level_files(level))
    }

    #[cfg(test)]
    fn latest_sequence(&self) -> Result<u64> {
        Ok(self.inner.mutex.lock()?.versions.last_sequence())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        // A poisoned state cannot make progress; skip the wait and let the
        // background thread observe the shutdown flag on its own.
        let mut state = match self.inner.mutex.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        while state.background_compaction_scheduled {
            state = match self.inner.background_work_finished.wait(state) {
                Ok(state) => state,
                Err(_) => return,
            };
        }
    }
}

impl DbInner {
    /// Waits out backpressure, rotates the memtable when full, and kicks
    /// the background thread. Only the head writer calls this.
    fn make_room_for_write<'a>(
        self: &Arc<Self>,
        mut state: MutexGuard<'a, DbState>,
        force: bool,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        loop {
            if let Some(err) = &state.bg_error {
                let err = err.clone();
                return (state, Err(err));
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return (state, Err(Error::ShuttingDown));
            }
            if !force
                && state.mem.approximate_memory_usage() < self.options.write_buffer_size
            {
                return (state, Ok(()));
            }
            if state.imm.is_some() {
                // Previous rotation still flushing; wait for the
                // background thread to clear it.
                state = match self.background_work_finished.wait(state) {
                    Ok(state) => state,
                    Err(poisoned) => {
                        let err = Error::Io(poisoned.to_string());
                        return (poisoned.into_inner(), Err(err));
                    }
                };
                continue;
            }
            if state.versions.num_level_files(0) > L0_STOP_WRITES_TRIGGER {
                tracing::info!("too many level-0 files; stalling writes");
                state = match self.background_work_finished.wait(state) {
                    Ok(state) => state,
                    Err(poisoned) => {
                        let err = Error::Io(poisoned.to_string());
                        return (poisoned.into_inner(), Err(err));
                    }
                };
                continue;
            }

            // Rotate: fresh log, memtable becomes immutable.
            let new_log_number = state.versions.new_file_number();
            let new_log = match wal::Writer::create(&log_file_name(&self.dbname, new_log_number))
            {
                Ok(log) => log,
                Err(err) => {
                    state.versions.reuse_file_number(new_log_number);
                    return (state, Err(err));
                }
            };
            match self.log.lock() {
                Ok(mut log) => *log = Some(new_log),
                Err(err) => {
                    state.versions.reuse_file_number(new_log_number);
                    return (state, Err(Error::from(err)));
                }
            }
            state.log_file_number = new_log_number;
            state.imm = Some(Arc::clone(&state.mem));
            state.mem = Arc::new(MemTable::new(self.icmp.clone()));
            tracing::info!(log = new_log_number, "rotated memtable");
            self.maybe_schedule_compaction(&mut state);
            return (state, Ok(()));
        }
    }

    /// Spawns the background worker when there is work and none running.
    fn maybe_schedule_compaction(self: &Arc<Self>, state: &mut DbState) {
        if state.background_compaction_scheduled {
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) || state.bg_error.is_some() {
            return;
        }
        if state.imm.is_none() && !state.versions.needs_compaction() {
            return;
        }
        state.background_compaction_scheduled = true;
        let inner = Arc::clone(self);
        thread::spawn(move || inner.background_call());
    }

    fn background_call(self: Arc<Self>) {
        let mut state = match self.mutex.lock() {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error = %Error::from(err), "state mutex poisoned; background worker exiting");
                return;
            }
        };
        debug_assert!(state.background_compaction_scheduled);

        if !self.shutting_down.load(Ordering::Acquire) && state.bg_error.is_none() {
            let (returned, result) = self.background_compaction(state);
            state = returned;
            if let Err(err) = result {
                tracing::error!(error = %err, "background compaction failed");
                state.bg_error = Some(err);
            }
        }

        state.background_compaction_scheduled = false;
        // More work may have become visible while this step ran.
        self.maybe_schedule_compaction(&mut state);
        self.background_work_finished.notify_all();
    }

    /// Exactly one unit of background work: a memtable flush when one is
    /// pending, otherwise one table compaction.
    fn background_compaction<'a>(
        self: &'a Arc<Self>,
        state: MutexGuard<'a, DbState>,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        if state.imm.is_some() {
            return self.compact_memtable(state);
        }

        let mut state = state;
        let compaction = state.versions.pick_compaction();
        match compaction {
            None => (state, Ok(())),
            Some(mut c) if c.is_trivial_move() => {
                // Move the file down a level by edit alone.
                let file = Arc::clone(c.input(0, 0));
                c.edit.delete_file(c.level, file.number);
                c.edit.add_file(
                    c.level + 1,
                    file.number,
                    file.size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
                let result = state.versions.log_and_apply(&mut c.edit);
                tracing::info!(
                    file = file.number,
                    from = c.level,
                    to = c.level + 1,
                    "trivial compaction move"
                );
                (state, result)
            }
            Some(mut c) => {
                let (mut state, result) = self.do_compaction_work(state, &mut c);
                self.remove_obsolete_files(&mut state);
                (state, result)
            }
        }
    }

    /// Flushes the immutable memtable into a table at the level the
    /// current version picks for its key range, then retires it.
    fn compact_memtable<'a>(
        self: &'a Arc<Self>,
        mut state: MutexGuard<'a, DbState>,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let imm = state.imm.clone().expect("immutable memtable pending");
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        let base = state.versions.current();
        let log_file_number = state.log_file_number;

        drop(state);
        let mut edit = VersionEdit::new();
        let mut build = flush_memtable_to_table(
            &self.dbname,
            &self.internal_options,
            // Level choice consults the version captured above.
            &VersionsView { base: &base },
            &imm,
            number,
            &mut edit,
        );
        // Recover the guard even from a poisoned relock so the pending
        // output is released and the failure propagates as an error.
        let mut state = match self.mutex.lock() {
            Ok(state) => state,
            Err(poisoned) => {
                build = build.and(Err(Error::Io(poisoned.to_string())));
                poisoned.into_inner()
            }
        };
        state.pending_outputs.remove(&number);

        let result = match build {
            Err(err) => {
                let _ = fs::remove_file(temp_file_name(&self.dbname, number));
                let _ = fs::remove_file(table_file_name(&self.dbname, number));
                self.table_cache.evict(number);
                state.versions.reuse_file_number(number);
                Err(err)
            }
            Ok(()) => {
                // The new log number retires every log at or below the old
                // one once this edit commits.
                edit.set_log_number(log_file_number);
                match state.versions.log_and_apply(&mut edit) {
                    Ok(()) => {
                        state.imm = None;
                        self.remove_obsolete_files(&mut state);
                        Ok(())
                    }
                    Err(err) => {
                        // Abandon the table so the number can be reused.
                        let _ = fs::remove_file(table_file_name(&self.dbname, number));
                        self.table_cache.evict(number);
                        state.versions.reuse_file_number(number);
                        Err(err)
                    }
                }
            }
        };
        (state, result)
    }

    /// Merges the compaction inputs into new tables at level + 1 and
    /// installs the swap atomically.
    fn do_compaction_work<'a>(
        self: &'a Arc<Self>,
        state: MutexGuard<'a, DbState>,
        c: &mut Compaction,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let snapshot = state.versions.last_sequence();
        let mut input = state.versions.make_input_iterator(c);
        let (range_lo, range_hi) = c.describe_range();
        tracing::info!(
            level = c.level,
            inputs = c.num_input_files(0),
            next_level_inputs = c.num_input_files(1),
            range_lo = %range_lo,
            range_hi = %range_hi,
            "starting compaction"
        );
        drop(state);

        let ucmp = Arc::clone(self.icmp.user_comparator());
        let mut outputs: Vec<CompactionOutput> = Vec::new();
        let mut builder: Option<TableBuilder> = None;
        let mut last_user_key: Option<Vec<u8>> = None;
        let mut result = Ok(());

        input.seek_to_first();
        while input.valid() {
            if self.shutting_down.load(Ordering::Acquire) {
                result = Err(Error::ShuttingDown);
                break;
            }

            let key = input.key().to_vec();

            // Cut the output early if it would overlap too much of the
            // grandparent level.
            if builder.is_some() && c.should_stop_before(&key, &self.icmp) {
                let table = builder.take().expect("open");
                result = finish_output(&self.dbname, table, outputs.last_mut().expect("output"));
                if result.is_err() {
                    break;
                }
            }

            let mut drop_entry = false;
            match ParsedInternalKey::decode(&key) {
                Err(_) => {
                    // Carry undecodable keys through unchanged.
                    last_user_key = None;
                }
                Ok(parsed) => {
                    let first_occurrence = last_user_key
                        .as_deref()
                        .map_or(true, |last| {
                            ucmp.compare(parsed.user_key, last) != std::cmp::Ordering::Equal
                        });
                    if first_occurrence {
                        last_user_key = Some(parsed.user_key.to_vec());
                        if parsed.vtype == ValueType::Deletion
                            && parsed.sequence <= snapshot
                            && c.is_base_level_for_key(parsed.user_key)
                        {
                            // No deeper level can hold this key, so the
                            // tombstone has nothing left to shadow.
                            drop_entry = true;
                        }
                    } else {
                        // Hidden by a newer entry for the same user key.
                        drop_entry = true;
                    }
                }
            }

            if !drop_entry {
                if builder.is_none() {
                    match self.open_compaction_output() {
                        Ok((table, output)) => {
                            builder = Some(table);
                            outputs.push(output);
                        }
                        Err(err) => {
                            result = Err(err);
                            break;
                        }
                    }
                }
                let table = builder.as_mut().expect("open");
                let output = outputs.last_mut().expect("output");
                if output.smallest.is_empty() {
                    output.smallest = InternalKey::decode_from(&key);
                }
                output.largest = InternalKey::decode_from(&key);
                if let Err(err) = table.add(&key, input.value()) {
                    result = Err(err);
                    break;
                }

                if table.file_size() >= c.max_output_file_size() {
                    let table = builder.take().expect("open");
                    result =
                        finish_output(&self.dbname, table, outputs.last_mut().expect("output"));
                    if result.is_err() {
                        break;
                    }
                }
            }

            input.next();
        }

        if result.is_ok() {
            if let Some(table) = builder.take() {
                result = finish_output(&self.dbname, table, outputs.last_mut().expect("output"));
            }
        } else if let Some(table) = builder.take() {
            let _ = table.abandon();
        }

        // As in the write path: the bookkeeping below must run, so a
        // poisoned relock folds into the result instead of panicking.
        let mut state = match self.mutex.lock() {
            Ok(state) => state,
            Err(poisoned) => {
                result = result.and(Err(Error::Io(poisoned.to_string())));
                poisoned.into_inner()
            }
        };
        if result.is_ok() {
            c.add_input_deletions();
            for output in &outputs {
                c.edit.add_file(
                    c.level + 1,
                    output.number,
                    output.file_size,
                    output.smallest.clone(),
                    output.largest.clone(),
                );
            }
            result = state.versions.log_and_apply(&mut c.edit);
        }

        for output in &outputs {
            state.pending_outputs.remove(&output.number);
        }

        match &result {
            Ok(()) => {
                tracing::info!(
                    level = c.level,
                    outputs = outputs.len(),
                    "compaction finished"
                );
            }
            Err(err) => {
                tracing::warn!(level = c.level, error = %err, "compaction abandoned");
                for output in &outputs {
                    let _ = fs::remove_file(table_file_name(&self.dbname, output.number));
                    self.table_cache.evict(output.number);
                }
            }
        }
        (state, result)
    }

    fn open_compaction_output(self: &Arc<Self>) -> Result<(TableBuilder, CompactionOutput)> {
        let number = {
            let mut state = self.mutex.lock()?;
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        let path = temp_file_name(&self.dbname, number);
        let table = TableBuilder::new(&self.internal_options, &path)?;
        Ok((
            table,
            CompactionOutput {
                number,
                file_size: 0,
                smallest: InternalKey::default(),
                largest: InternalKey::default(),
            },
        ))
    }

    /// Deletes files no live version references: old logs, superseded
    /// manifests, compacted tables, abandoned temporaries.
    fn remove_obsolete_files(&self, state: &mut DbState) {
        if state.bg_error.is_some() {
            // After an error the file set cannot be reasoned about.
            return;
        }

        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());
        let log_number = state.versions.log_number();
        let manifest_number = state.versions.manifest_file_number();

        let entries = match fs::read_dir(&self.dbname) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "unable to scan database directory");
                return;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some((number, ftype)) = parse_file_name(&name.to_string_lossy()) else {
                continue;
            };
            let keep = match ftype {
                FileType::Log => number >= log_number,
                FileType::Descriptor => number >= manifest_number,
                FileType::Table => live.contains(&number),
                FileType::Temp => state.pending_outputs.contains(&number),
                FileType::Current | FileType::Lock | FileType::InfoLog => true,
            };
            if !keep {
                if ftype == FileType::Table {
                    self.table_cache.evict(number);
                }
                tracing::info!(file = %name.to_string_lossy(), "removing obsolete file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

/// Seals one compaction output: finish, fsync, rename into place.
fn finish_output(dbname: &Path, table: TableBuilder, output: &mut CompactionOutput) -> Result<()> {
    let entries = table.num_entries();
    output.file_size = table.finish()?;
    fs::rename(
        temp_file_name(dbname, output.number),
        table_file_name(dbname, output.number),
    )?;
    tracing::info!(
        file = output.number,
        entries,
        bytes = output.file_size,
        "compaction output sealed"
    );
    Ok(())
}

/// Merges consecutive queued writers with the head's sync preference into
/// one batch. Returns the group, the index of the last writer included,
/// and the sync flag.
fn build_batch_group(state: &DbState) -> (WriteBatch, usize, bool) {
    let head = state.writers.front().expect("head writer");
    let mut group = head.batch.clone();
    let sync = head.sync;

    let head_size = group.byte_size();
    let max_size = if head_size <= SMALL_BATCH_SIZE {
        head_size + SMALL_BATCH_SIZE
    } else {
        MAX_GROUP_SIZE
    };

    let mut size = head_size;
    let mut last_index = 0;
    for (index, writer) in state.writers.iter().enumerate().skip(1) {
        if writer.sync != sync {
            break;
        }
        if size + writer.batch.byte_size() > max_size {
            break;
        }
        group.append(&writer.batch);
        size += writer.batch.byte_size();
        last_index = index;
    }
    (group, last_index, sync)
}

/// Bootstraps an empty database: a manifest holding one descriptive edit,
/// and CURRENT pointing at it.
fn create_new_db(dbname: &Path, icmp: &InternalKeyComparator) -> Result<()> {
    let mut edit = VersionEdit::new();
    edit.set_comparator_name(icmp.user_comparator().name());
    edit.set_log_number(0);
    edit.set_next_file_number(2);
    edit.set_last_sequence(0);

    let manifest_number = 1;
    let path = crate::filename::descriptor_file_name(dbname, manifest_number);
    let mut log = wal::Writer::create(&path)?;
    if let Err(err) = log.add_record(&edit.encode()).and_then(|_| log.sync()) {
        let _ = fs::remove_file(&path);
        return Err(err);
    }
    crate::filename::set_current_file(dbname, manifest_number)
}

/// Replays one WAL into the memtable. Returns the last sequence applied,
/// or None for an empty log. A corrupt tail truncates replay; everything
/// before it is kept.
fn replay_log_file(dbname: &Path, number: u64, mem: &MemTable) -> Result<Option<u64>> {
    let path = log_file_name(dbname, number);
    let mut reader = wal::Reader::open(&path, true, 0)?;
    let mut last_sequence = None;

    loop {
        let record = match reader.read_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(Error::Corruption(msg)) => {
                tracing::warn!(log = number, error = %msg, "log truncated at corruption");
                break;
            }
            Err(err) => return Err(err),
        };
        let batch = WriteBatch::from_contents(record)?;
        batch.insert_into(mem)?;
        last_sequence = Some(batch.sequence() + batch.count() as u64 - 1);
    }

    if let Some(last) = last_sequence {
        tracing::info!(log = number, last_sequence = last, "replayed write-ahead log");
    }
    Ok(last_sequence)
}

/// Narrow view over the version a flush consults for level placement.
struct VersionsView<'a> {
    base: &'a Arc<crate::version::Version>,
}

/// Builds a table from a memtable and records it in `edit` at the level
/// the base version picks for its range. Shared by recovery (where the
/// base is the freshly recovered version) and the background flush.
fn flush_memtable_to_table(
    dbname: &Path,
    internal_options: &Options,
    base: &dyn FlushBase,
    mem: &Arc<MemTable>,
    number: u64,
    edit: &mut VersionEdit,
) -> Result<()> {
    let temp_path = temp_file_name(dbname, number);
    let mut iter = mem.iter();
    let (file_size, entries) = match build_table(internal_options, &temp_path, &mut iter) {
        Ok(built) => built,
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
    };
    if entries == 0 {
        let _ = fs::remove_file(&temp_path);
        return Ok(());
    }
    fs::rename(&temp_path, table_file_name(dbname, number))?;

    let mut bounds = mem.iter();
    bounds.seek_to_first();
    let smallest = InternalKey::decode_from(bounds.key());
    bounds.seek_to_last();
    let largest = InternalKey::decode_from(bounds.key());

    let level = base.pick_level(smallest.user_key(), largest.user_key());
    edit.add_file(level, number, file_size, smallest, largest);
    tracing::info!(
        file = number,
        level,
        entries,
        bytes = file_size,
        "memtable flushed to table"
    );
    Ok(())
}

/// Where a flushed memtable may land.
trait FlushBase {
    fn pick_level(&self, smallest_user: &[u8], largest_user: &[u8]) -> usize;
}

impl FlushBase for VersionsView<'_> {
    fn pick_level(&self, smallest_user: &[u8], largest_user: &[u8]) -> usize {
        self.base
            .pick_level_for_memtable_output(smallest_user, largest_user)
    }
}

impl FlushBase for VersionSet {
    fn pick_level(&self, smallest_user: &[u8], largest_user: &[u8]) -> usize {
        self.current()
            .pick_level_for_memtable_output(smallest_user, largest_user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_LEVEL;

    fn open_db(dir: &tempfile::TempDir) -> Db {
        Db::open(dir.path(), Options::default()).expect("open")
    }

    fn wopts() -> WriteOptions {
        WriteOptions::default()
    }

    fn ropts() -> ReadOptions {
        ReadOptions::default()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);

        db.put(&wopts(), b"alpha", b"one").expect("put");
        db.put(&wopts(), b"beta", b"two").expect("put");
        assert_eq!(db.get(&ropts(), b"alpha").expect("get"), b"one");
        assert_eq!(db.get(&ropts(), b"beta").expect("get"), b"two");

        db.put(&wopts(), b"alpha", b"updated").expect("put");
        assert_eq!(db.get(&ropts(), b"alpha").expect("get"), b"updated");

        db.delete(&wopts(), b"alpha").expect("delete");
        assert_eq!(db.get(&ropts(), b"alpha"), Err(Error::NotFound));
        assert_eq!(db.get(&ropts(), b"missing"), Err(Error::NotFound));
        // Deleted keys come back on a later put.
        db.put(&wopts(), b"alpha", b"revived").expect("put");
        assert_eq!(db.get(&ropts(), b"alpha").expect("get"), b"revived");
    }

    #[test]
    fn test_read_your_writes_across_rotations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);

        // The default 4 KiB buffer rotates every few of these writes.
        let value = vec![b'v'; 400];
        for i in 0..200 {
            let key = format!("key{i:05}");
            db.put(&wopts(), key.as_bytes(), &value).expect("put");
            assert_eq!(db.get(&ropts(), key.as_bytes()).expect("get"), value);
        }
        db.wait_for_background_work().expect("background work");

        for i in 0..200 {
            let key = format!("key{i:05}");
            assert_eq!(db.get(&ropts(), key.as_bytes()).expect("get"), value);
        }
        // Something reached disk along the way.
        let total: usize = (0..MAX_LEVEL)
            .map(|l| db.num_files_at_level(l).expect("level files"))
            .sum();
        assert!(total > 0);
    }

    #[test]
    fn test_delete_survives_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);

        db.put(&wopts(), b"victim", b"value").expect("put");
        db.delete(&wopts(), b"victim").expect("delete");

        // Push the tombstone through a rotation and flush.
        let value = vec![b'x'; 400];
        for i in 0..50 {
            let key = format!("filler{i:04}");
            db.put(&wopts(), key.as_bytes(), &value).expect("put");
        }
        db.wait_for_background_work().expect("background work");

        assert_eq!(db.get(&ropts(), b"victim"), Err(Error::NotFound));
    }

    #[test]
    fn test_sequence_monotonicity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);

        let mut last = db.latest_sequence().expect("sequence");
        for i in 0..20 {
            db.put(&wopts(), format!("k{i}").as_bytes(), b"v").expect("put");
            let now = db.latest_sequence().expect("sequence");
            assert!(now > last, "sequence did not advance: {now} <= {last}");
            last = now;
        }

        // A batch advances the sequence by its record count.
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        db.write(&wopts(), batch).expect("write");
        assert_eq!(db.latest_sequence().expect("sequence"), last + 3);
    }

    #[test]
    fn test_empty_batch_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let before = db.latest_sequence().expect("sequence");
        db.write(&wopts(), WriteBatch::new()).expect("write");
        assert_eq!(db.latest_sequence().expect("sequence"), before);
    }

    #[test]
    fn test_reopen_recovers_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let value = vec![b'r'; 100];

        {
            let db = open_db(&dir);
            for i in 0..100 {
                let key = format!("key{i:04}");
                db.put(&wopts(), key.as_bytes(), &value).expect("put");
            }
            db.delete(&wopts(), b"key0007").expect("delete");
        }

        let db = open_db(&dir);
        for i in 0..100 {
            let key = format!("key{i:04}");
            if i == 7 {
                assert_eq!(db.get(&ropts(), key.as_bytes()), Err(Error::NotFound));
            } else {
                assert_eq!(db.get(&ropts(), key.as_bytes()).expect("get"), value);
            }
        }
    }

    #[test]
    fn test_reopen_twice_keeps_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = open_db(&dir);
            db.put(&wopts(), b"first", b"1").expect("put");
        }
        {
            let db = open_db(&dir);
            assert_eq!(db.get(&ropts(), b"first").expect("get"), b"1");
            db.put(&wopts(), b"second", b"2").expect("put");
        }
        let db = open_db(&dir);
        assert_eq!(db.get(&ropts(), b"first").expect("get"), b"1");
        assert_eq!(db.get(&ropts(), b"second").expect("get"), b"2");
    }

    #[test]
    fn test_iteration_is_ordered_and_mirrors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);

        // Unordered inserts, some overwritten, some deleted.
        let keys = [
            "mango", "apple", "peach", "banana", "cherry", "grape", "lemon",
        ];
        for key in keys {
            db.put(&wopts(), key.as_bytes(), format!("v-{key}").as_bytes())
                .expect("put");
        }
        db.put(&wopts(), b"apple", b"v-apple2").expect("put");
        db.delete(&wopts(), b"peach").expect("delete");

        let mut iter = db.iter(&ropts()).expect("iter");
        iter.seek_to_first();
        let mut forward = Vec::new();
        while iter.valid() {
            forward.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }

        let want: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b"apple".to_vec(), b"v-apple2".to_vec()),
            (b"banana".to_vec(), b"v-banana".to_vec()),
            (b"cherry".to_vec(), b"v-cherry".to_vec()),
            (b"grape".to_vec(), b"v-grape".to_vec()),
            (b"lemon".to_vec(), b"v-lemon".to_vec()),
            (b"mango".to_vec(), b"v-mango".to_vec()),
        ];
        assert_eq!(forward, want);

        let mut iter = db.iter(&ropts()).expect("iter");
        iter.seek_to_last();
        let mut backward = Vec::new();
        while iter.valid() {
            backward.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.prev();
        }
        backward.reverse();
        assert_eq!(backward, want);

        let mut iter = db.iter(&ropts()).expect("iter");
        iter.seek(b"cat");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"cherry");
    }

    #[test]
    fn test_iterator_snapshot_isolation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);

        db.put(&wopts(), b"stable", b"before").expect("put");
        let mut iter = db.iter(&ropts()).expect("iter");

        db.put(&wopts(), b"stable", b"after").expect("put");
        db.put(&wopts(), b"unseen", b"new").expect("put");

        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"stable");
        assert_eq!(iter.value(), b"before");
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_batch_atomicity_under_concurrent_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(open_db(&dir));

        let mut seed = WriteBatch::new();
        seed.put(b"left", b"0");
        seed.put(b"right", b"0");
        db.write(&wopts(), seed).expect("seed");

        let writer_db = Arc::clone(&db);
        let writer = thread::spawn(move || {
            for i in 1..200u32 {
                let value = i.to_string();
                let mut batch = WriteBatch::new();
                batch.put(b"left", value.as_bytes());
                batch.put(b"right", value.as_bytes());
                writer_db.write(&wopts(), batch).expect("write");
            }
        });

        // Each iterator observes one sequence; the pair must always agree.
        for _ in 0..500 {
            let mut iter = db.iter(&ropts()).expect("iter");
            iter.seek(b"left");
            assert!(iter.valid());
            let left = iter.value().to_vec();
            iter.seek(b"right");
            assert!(iter.valid());
            let right = iter.value().to_vec();
            assert_eq!(left, right, "torn batch observed");
        }

        writer.join().expect("writer");
        assert_eq!(db.get(&ropts(), b"left").expect("get"), b"199");
        assert_eq!(db.get(&ropts(), b"right").expect("get"), b"199");
    }

    #[test]
    fn test_compaction_preserves_live_set_and_disjointness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);

        // Overwrite one key range repeatedly so flushes overlap, stack up
        // in level 0, and force real merging compactions.
        let mut expected = std::collections::BTreeMap::new();
        for round in 0..10 {
            for i in 0..100 {
                let key = format!("key{i:04}");
                let value = format!("round{round}-value{i}");
                db.put(&wopts(), key.as_bytes(), value.as_bytes()).expect("put");
                expected.insert(key, value);
            }
            db.wait_for_background_work().expect("background work");
        }
        db.wait_for_background_work().expect("background work");

        // Every key readable with its newest value.
        for (key, value) in &expected {
            assert_eq!(
                db.get(&ropts(), key.as_bytes()).expect("get"),
                value.as_bytes()
            );
        }

        // Scans agree with point reads.
        let mut iter = db.iter(&ropts()).expect("iter");
        iter.seek_to_first();
        let mut scanned = 0;
        while iter.valid() {
            let key = String::from_utf8(iter.key().to_vec()).expect("utf8");
            assert_eq!(iter.value(), expected[&key].as_bytes());
            scanned += 1;
            iter.next();
        }
        assert_eq!(scanned, expected.len());

        // Levels >= 1 hold disjoint user-key ranges.
        let state = db.inner.mutex.lock().unwrap();
        let current = state.versions.current();
        for level in 1..MAX_LEVEL {
            let files = current.files(level);
            for pair in files.windows(2) {
                assert!(
                    pair[0].largest.user_key() < pair[1].smallest.user_key(),
                    "level {level} files overlap"
                );
            }
        }
    }

    #[test]
    fn test_group_commit_merges_waiters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(open_db(&dir));

        let mut handles = Vec::new();
        for t in 0..8 {
            let db = Arc::clone(&db);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("t{t}-k{i}");
                    db.put(&wopts(), key.as_bytes(), b"v").expect("put");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("writer thread");
        }
        db.wait_for_background_work().expect("background work");

        for t in 0..8 {
            for i in 0..50 {
                let key = format!("t{t}-k{i}");
                assert_eq!(db.get(&ropts(), key.as_bytes()).expect("get"), b"v");
            }
        }
    }

    #[test]
    fn test_bloom_filter_database_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = Options::default().bloom_filter(10);
        let db = Db::open(dir.path(), options).expect("open");

        let value = vec![b'b'; 300];
        for i in 0..100 {
            db.put(&wopts(), format!("bloom{i:04}").as_bytes(), &value)
                .expect("put");
        }
        db.wait_for_background_work().expect("background work");

        for i in 0..100 {
            assert_eq!(
                db.get(&ropts(), format!("bloom{i:04}").as_bytes()).expect("get"),
                value
            );
        }
        assert_eq!(db.get(&ropts(), b"bloom9999"), Err(Error::NotFound));
    }

    #[test]
    fn test_second_open_fails_on_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _db = open_db(&dir);
        assert!(Db::open(dir.path(), Options::default()).is_err());
    }
}
