//! Ephemeral helper that applies edits to a base version.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::MAX_LEVEL;
use crate::keys::InternalKeyComparator;

use super::edit::VersionEdit;
use super::version::{FileMetaData, Version};

/// Accumulates file additions and deletions on top of a base version, then
/// materializes the result with each level sorted by (smallest key
/// ascending, file number descending).
pub struct VersionBuilder {
    icmp: InternalKeyComparator,
    added: Vec<BTreeMap<u64, Arc<FileMetaData>>>,
    deleted: Vec<HashSet<u64>>,
}

impl VersionBuilder {
    pub fn new(icmp: InternalKeyComparator) -> VersionBuilder {
        VersionBuilder {
            icmp,
            added: (0..MAX_LEVEL).map(|_| BTreeMap::new()).collect(),
            deleted: (0..MAX_LEVEL).map(|_| HashSet::new()).collect(),
        }
    }

    pub fn apply(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
            self.added[*level].remove(number);
        }
        for (level, meta) in &edit.new_files {
            self.deleted[*level].remove(&meta.number);
            self.added[*level].insert(meta.number, Arc::new(meta.clone()));
        }
    }

    /// Builds the new version from `base` plus the accumulated changes.
    pub fn finish(self, base: &Version) -> Version {
        let mut version = Version::empty(self.icmp.clone(), Arc::clone(&base.table_cache));

        for level in 0..MAX_LEVEL {
            let mut files: Vec<Arc<FileMetaData>> = base.files[level]
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.number))
                .filter(|f| !self.added[level].contains_key(&f.number))
                .cloned()
                .collect();
            files.extend(self.added[level].values().cloned());

            files.sort_by(|a, b| {
                self.icmp
                    .compare_keys(&a.smallest, &b.smallest)
                    .then(b.number.cmp(&a.number))
            });

            if cfg!(debug_assertions) && level > 0 {
                for pair in files.windows(2) {
                    debug_assert!(
                        self.icmp
                            .user_comparator()
                            .compare(pair[0].largest.user_key(), pair[1].smallest.user_key())
                            .is_lt(),
                        "overlapping files installed at level {level}"
                    );
                }
            }

            version.files[level] = files;
        }
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::keys::{BytewiseComparator, InternalKey, ValueType};
    use crate::table_cache::TableCache;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn empty_base() -> Version {
        let cache = Arc::new(TableCache::new(std::env::temp_dir(), Options::new(), 4));
        Version::empty(icmp(), cache)
    }

    fn add(edit: &mut VersionEdit, level: usize, number: u64, smallest: &str, largest: &str) {
        edit.add_file(
            level,
            number,
            1000,
            InternalKey::new(smallest.as_bytes(), 10, ValueType::Value),
            InternalKey::new(largest.as_bytes(), 10, ValueType::Value),
        );
    }

    #[test]
    fn test_apply_add_and_delete() {
        let base = empty_base();

        let mut edit1 = VersionEdit::new();
        add(&mut edit1, 1, 7, "a", "c");
        add(&mut edit1, 1, 8, "e", "g");

        let mut builder = VersionBuilder::new(icmp());
        builder.apply(&edit1);
        let v1 = builder.finish(&base);
        assert_eq!(v1.num_files(1), 2);

        let mut edit2 = VersionEdit::new();
        edit2.delete_file(1, 7);
        add(&mut edit2, 2, 9, "a", "c");

        let mut builder = VersionBuilder::new(icmp());
        builder.apply(&edit2);
        let v2 = builder.finish(&v1);
        assert_eq!(v2.num_files(1), 1);
        assert_eq!(v2.files(1)[0].number, 8);
        assert_eq!(v2.num_files(2), 1);
    }

    #[test]
    fn test_levels_sorted_by_smallest_key() {
        let base = empty_base();
        let mut edit = VersionEdit::new();
        add(&mut edit, 1, 5, "m", "o");
        add(&mut edit, 1, 6, "a", "c");
        add(&mut edit, 1, 7, "e", "g");

        let mut builder = VersionBuilder::new(icmp());
        builder.apply(&edit);
        let version = builder.finish(&base);

        let order: Vec<u64> = version.files(1).iter().map(|f| f.number).collect();
        assert_eq!(order, vec![6, 7, 5]);
    }

    #[test]
    fn test_delete_then_readd_keeps_file() {
        let base = empty_base();
        let mut edit = VersionEdit::new();
        edit.delete_file(1, 4);
        add(&mut edit, 1, 4, "a", "b");

        let mut builder = VersionBuilder::new(icmp());
        builder.apply(&edit);
        let version = builder.finish(&base);
        assert_eq!(version.num_files(1), 1);
    }
}
