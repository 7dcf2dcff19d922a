//! Engine configuration and tuning constants.

use std::sync::Arc;

use crate::filter::{BloomFilterPolicy, FilterPolicy};
use crate::keys::{BytewiseComparator, UserComparator};

/// Number of on-disk levels.
pub const MAX_LEVEL: usize = 7;

/// Maximum level a fresh memtable flush may be pushed to when it does not
/// overlap the levels in between. Pushing past level 0 skips the relatively
/// expensive 0 -> 1 compactions for cold key ranges.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which writers block until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 4 * 1024 * 1024;

/// Capacity of the table cache (open sstable readers).
pub const TABLE_CACHE_ENTRIES: usize = 16;

/// Target size for compaction output files.
pub const TARGET_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Maximum bytes of grandparent (level + 2) overlap a single compaction
/// output may accumulate before it is cut.
pub const MAX_GRANDPARENT_OVERLAP_BYTES: u64 = 10 * TARGET_FILE_SIZE;

/// Cap on the total byte size of a compaction's inputs when the level-L set
/// is expanded to soak up additional non-overlapping files.
pub const EXPANDED_COMPACTION_BYTE_SIZE_LIMIT: u64 = 25 * TARGET_FILE_SIZE;

/// Byte budget for a level, used by the compaction score. Level 0 is scored
/// by file count instead.
pub fn max_bytes_for_level(level: usize) -> f64 {
    let mut result = 10.0 * 1048576.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

/// Options controlling an open database.
#[derive(Clone)]
pub struct Options {
    /// Target uncompressed size for sstable data blocks.
    pub block_size: usize,

    /// Number of block entries between restart points.
    pub restart_interval: usize,

    /// Memtable size threshold before rotation to a level-0 sstable.
    pub write_buffer_size: usize,

    /// Optional "may-contain" filter applied per data block region.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Total order on user keys.
    pub comparator: UserComparator,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: 4096,
            restart_interval: 16,
            write_buffer_size: 4096,
            filter_policy: None,
            comparator: Arc::new(BytewiseComparator),
        }
    }
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    /// Set the target data-block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the restart interval for data blocks.
    pub fn restart_interval(mut self, interval: usize) -> Self {
        self.restart_interval = interval;
        self
    }

    /// Set the memtable rotation threshold.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Install a bloom filter policy with the given bits per key.
    pub fn bloom_filter(mut self, bits_per_key: usize) -> Self {
        self.filter_policy = Some(Arc::new(BloomFilterPolicy::new(bits_per_key)));
        self
    }

    /// Install a custom filter policy.
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Install a custom user-key comparator.
    pub fn comparator(mut self, cmp: UserComparator) -> Self {
        self.comparator = cmp;
        self
    }
}

/// Options controlling read operations.
#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    /// Verify block checksums on load.
    pub verify_checksums: bool,

    /// Hint that loaded blocks should be cached.
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            fill_cache: false,
        }
    }
}

/// Options controlling write operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Fsync the write-ahead log before acknowledging the write. Without it
    /// a machine crash may lose recent writes; a process crash loses none.
    pub sync: bool,
}
