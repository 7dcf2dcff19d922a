//! A planned compaction: which files merge from level L into L + 1.

use std::sync::Arc;

use crate::config::{
    MAX_GRANDPARENT_OVERLAP_BYTES, MAX_LEVEL, TARGET_FILE_SIZE,
};
use crate::keys::{extract_user_key, Comparator, InternalKeyComparator};

use super::edit::VersionEdit;
use super::version::{total_file_size, FileMetaData, Version};

pub struct Compaction {
    /// Source level; outputs land at `level + 1`.
    pub level: usize,
    /// `inputs[0]` from `level`, `inputs[1]` from `level + 1`.
    pub inputs: [Vec<Arc<FileMetaData>>; 2],
    /// Files at `level + 2` overlapping the output range, used to bound
    /// how much future work one output file can create.
    pub grandparents: Vec<Arc<FileMetaData>>,
    /// The edit under construction; input deletions and output additions
    /// accumulate here.
    pub edit: VersionEdit,
    /// Version the inputs were chosen from; held so its files stay live
    /// for the duration.
    pub input_version: Arc<Version>,

    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level cursors for is_base_level_for_key.
    level_ptrs: [usize; MAX_LEVEL],
}

impl Compaction {
    pub fn new(level: usize, input_version: Arc<Version>) -> Compaction {
        Compaction {
            level,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            edit: VersionEdit::new(),
            input_version,
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; MAX_LEVEL],
        }
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    pub fn max_output_file_size(&self) -> u64 {
        TARGET_FILE_SIZE
    }

    /// A move: one input at `level`, nothing overlapping at `level + 1`,
    /// and little enough grandparent overlap that moving beats rewriting.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= MAX_GRANDPARENT_OVERLAP_BYTES
    }

    /// Marks every input file deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.delete_file(self.level + which, file.number);
            }
        }
    }

    /// True iff no level deeper than the output level can hold `user_key`.
    /// When it holds, a deletion tombstone at the bottom of the merge may
    /// be dropped entirely.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let icmp = self.input_version.icmp.clone();
        let ucmp = Arc::clone(icmp.user_comparator());
        for level in self.level + 2..MAX_LEVEL {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, file.largest.user_key()).is_le() {
                    if ucmp.compare(user_key, file.smallest.user_key()).is_ge() {
                        return false;
                    }
                    break;
                }
                // Keys arrive in ascending order, so the cursor never
                // revisits earlier files.
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True when the current output should be cut before `internal_key` to
    /// keep its grandparent overlap under the budget.
    pub fn should_stop_before(&mut self, internal_key: &[u8], icmp: &InternalKeyComparator) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && icmp
                .compare(
                    internal_key,
                    self.grandparents[self.grandparent_index].largest.encoded(),
                )
                .is_gt()
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > MAX_GRANDPARENT_OVERLAP_BYTES {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// User-key span of all inputs, for logging.
    pub fn describe_range(&self) -> (String, String) {
        let mut smallest: Option<&[u8]> = None;
        let mut largest: Option<&[u8]> = None;
        let ucmp = self.input_version.icmp.user_comparator();
        for which in 0..2 {
            for file in &self.inputs[which] {
                let lo = extract_user_key(file.smallest.encoded());
                let hi = extract_user_key(file.largest.encoded());
                if smallest.map_or(true, |s| ucmp.compare(lo, s).is_lt()) {
                    smallest = Some(lo);
                }
                if largest.map_or(true, |l| ucmp.compare(hi, l).is_gt()) {
                    largest = Some(hi);
                }
            }
        }
        (
            String::from_utf8_lossy(smallest.unwrap_or_default()).into_owned(),
            String::from_utf8_lossy(largest.unwrap_or_default()).into_owned(),
        )
    }
}
