//! Lock-free sorted skip list backing the memtable.
//!
//! Writes are serialized externally (only the head of the writer queue
//! inserts); readers run concurrently with the writer and never take a
//! lock. The safety argument rests on the per-pointer discipline: a new
//! node's forward pointers are populated before any predecessor is pointed
//! at it with a release store, and traversal loads every pointer with
//! acquire, so a reader observes the node fully linked at each level it is
//! visible on, or not at all.
//!
//! ```text
//! level 3: head --------------------------> e ------------> nil
//! level 2: head ----------> c ------------> e ------------> nil
//! level 1: head ----> b --> c ------------> e --> f ------> nil
//! level 0: head a --> b --> c --> d ------> e --> f --> g   nil
//! ```
//!
//! Nodes are never unlinked or freed while the list is alive; the whole
//! chain is reclaimed when the list drops.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use rand::Rng;

use crate::keys::MemtableKeyComparator;

/// Maximum tower height.
pub const MAX_HEIGHT: usize = 12;

/// Probability denominator for growing a tower by one level.
const BRANCHING: u32 = 4;

struct Node {
    entry: Vec<u8>,
    next: Vec<AtomicPtr<Node>>,
}

impl Node {
    fn new(entry: Vec<u8>, height: usize) -> *mut Node {
        let next = (0..height).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Box::into_raw(Box::new(Node { entry, next }))
    }

    fn next(&self, level: usize) -> *mut Node {
        self.next[level].load(Ordering::Acquire)
    }

    fn set_next(&self, level: usize, node: *mut Node) {
        self.next[level].store(node, Ordering::Release);
    }

    /// Pre-publication initialization of a link; the node is not yet
    /// reachable, so no ordering is required.
    fn init_next(&self, level: usize, node: *mut Node) {
        self.next[level].store(node, Ordering::Relaxed);
    }
}

pub struct SkipList {
    head: *mut Node,
    cmp: MemtableKeyComparator,
}

unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    pub fn new(cmp: MemtableKeyComparator) -> SkipList {
        SkipList {
            head: Node::new(Vec::new(), MAX_HEIGHT),
            cmp,
        }
    }

    /// Inserts an encoded memtable entry. Entries carry unique sequence
    /// numbers, so no two compare equal. Must only be called from the
    /// single writing thread.
    pub fn insert(&self, entry: Vec<u8>) {
        let mut prev = [self.head; MAX_HEIGHT];
        self.find_greater_or_equal(&entry, Some(&mut prev));

        let height = random_height();
        let node = Node::new(entry, height);
        for (level, pred) in prev.iter().take(height).enumerate() {
            unsafe {
                (*node).init_next(level, (**pred).next(level));
                (**pred).set_next(level, node);
            }
        }
    }

    /// First node whose entry is >= the search key, or null.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut current = self.head;
        let mut level = MAX_HEIGHT - 1;
        loop {
            let next = unsafe { (*current).next(level) };
            let descend = if next.is_null() {
                true
            } else {
                let next_entry = unsafe { &(*next).entry };
                self.cmp.compare_entries(next_entry, key).is_ge()
            };

            if descend {
                if let Some(prev) = prev.as_mut() {
                    prev[level] = current;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            } else {
                current = next;
            }
        }
    }

    /// Last node whose entry is < the search key, or null when the key
    /// precedes every entry.
    fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut current = self.head;
        let mut level = MAX_HEIGHT - 1;
        loop {
            let next = unsafe { (*current).next(level) };
            let descend = if next.is_null() {
                true
            } else {
                let next_entry = unsafe { &(*next).entry };
                self.cmp.compare_entries(next_entry, key).is_ge()
            };

            if descend {
                if level == 0 {
                    return if current == self.head {
                        ptr::null_mut()
                    } else {
                        current
                    };
                }
                level -= 1;
            } else {
                current = next;
            }
        }
    }

    fn find_last(&self) -> *mut Node {
        let mut current = self.head;
        let mut level = MAX_HEIGHT - 1;
        loop {
            let next = unsafe { (*current).next(level) };
            if !next.is_null() {
                current = next;
            } else if level == 0 {
                return if current == self.head {
                    ptr::null_mut()
                } else {
                    current
                };
            } else {
                level -= 1;
            }
        }
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        unsafe {
            let mut current = (*self.head).next(0);
            while !current.is_null() {
                let next = (*current).next(0);
                drop(Box::from_raw(current));
                current = next;
            }
            drop(Box::from_raw(self.head));
        }
    }
}

fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING) == 0 {
        height += 1;
    }
    height
}

/// Raw cursor over the list. The caller guarantees the list outlives the
/// cursor; `MemTableIter` does so by holding the owning memtable.
pub(crate) struct SkipListCursor {
    node: *mut Node,
}

unsafe impl Send for SkipListCursor {}

impl SkipListCursor {
    pub fn new() -> SkipListCursor {
        SkipListCursor {
            node: ptr::null_mut(),
        }
    }

    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    pub fn entry(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { &(*self.node).entry }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    pub fn prev(&mut self, list: &SkipList) {
        debug_assert!(self.valid());
        let entry = unsafe { &(*self.node).entry };
        self.node = list.find_less_than(entry);
    }

    pub fn seek(&mut self, list: &SkipList, key: &[u8]) {
        self.node = list.find_greater_or_equal(key, None);
    }

    pub fn seek_to_first(&mut self, list: &SkipList) {
        self.node = unsafe { (*list.head).next(0) };
    }

    pub fn seek_to_last(&mut self, list: &SkipList) {
        self.node = list.find_last();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{put_fixed32, put_fixed64};
    use crate::keys::{
        pack_sequence_and_type, BytewiseComparator, InternalKeyComparator, ValueType,
    };
    use std::sync::Arc;

    fn comparator() -> MemtableKeyComparator {
        MemtableKeyComparator::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    fn entry(user_key: &[u8], seq: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        put_fixed32(&mut buf, (user_key.len() + 8) as u32);
        buf.extend_from_slice(user_key);
        put_fixed64(&mut buf, pack_sequence_and_type(seq, ValueType::Value));
        put_fixed32(&mut buf, 0);
        buf
    }

    fn collect_user_keys(list: &SkipList) -> Vec<Vec<u8>> {
        let mut cursor = SkipListCursor::new();
        cursor.seek_to_first(list);
        let mut keys = Vec::new();
        while cursor.valid() {
            let entry = cursor.entry();
            let klen = crate::coding::decode_fixed32(entry) as usize;
            keys.push(entry[4..4 + klen - 8].to_vec());
            cursor.next();
        }
        keys
    }

    #[test]
    fn test_sorted_insertion_order() {
        let list = SkipList::new(comparator());
        let mut seq = 1;
        for key in [&b"delta"[..], b"alpha", b"echo", b"charlie", b"bravo"] {
            list.insert(entry(key, seq));
            seq += 1;
        }
        assert_eq!(
            collect_user_keys(&list),
            vec![
                b"alpha".to_vec(),
                b"bravo".to_vec(),
                b"charlie".to_vec(),
                b"delta".to_vec(),
                b"echo".to_vec()
            ]
        );
    }

    #[test]
    fn test_same_user_key_newest_first() {
        let list = SkipList::new(comparator());
        list.insert(entry(b"key", 1));
        list.insert(entry(b"key", 3));
        list.insert(entry(b"key", 2));

        let mut cursor = SkipListCursor::new();
        cursor.seek_to_first(&list);
        let mut sequences = Vec::new();
        while cursor.valid() {
            let entry = cursor.entry();
            let klen = crate::coding::decode_fixed32(entry) as usize;
            let tag = crate::coding::decode_fixed64(&entry[4 + klen - 8..]);
            sequences.push(tag >> 8);
            cursor.next();
        }
        assert_eq!(sequences, vec![3, 2, 1]);
    }

    #[test]
    fn test_seek_and_prev() {
        let list = SkipList::new(comparator());
        for (i, key) in [&b"aa"[..], b"cc", b"ee", b"gg"].iter().enumerate() {
            list.insert(entry(key, i as u64 + 1));
        }

        let mut cursor = SkipListCursor::new();
        cursor.seek(&list, &entry(b"dd", crate::keys::MAX_SEQUENCE));
        assert!(cursor.valid());
        let found = cursor.entry();
        let klen = crate::coding::decode_fixed32(found) as usize;
        assert_eq!(&found[4..4 + klen - 8], b"ee");

        cursor.prev(&list);
        assert!(cursor.valid());
        let found = cursor.entry();
        let klen = crate::coding::decode_fixed32(found) as usize;
        assert_eq!(&found[4..4 + klen - 8], b"cc");

        cursor.prev(&list);
        cursor.prev(&list);
        assert!(!cursor.valid());
    }

    #[test]
    fn test_concurrent_readers_see_prefix_of_writes() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;

        let list = Arc::new(SkipList::new(comparator()));
        let stop = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..3 {
            let list = Arc::clone(&list);
            let stop = Arc::clone(&stop);
            readers.push(thread::spawn(move || {
                let mut max_seen = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let keys = collect_user_keys(&list);
                    // Writers insert in ascending key order, so a snapshot
                    // is always sorted and only ever grows.
                    assert!(keys.windows(2).all(|w| w[0] < w[1]));
                    assert!(keys.len() >= max_seen);
                    max_seen = keys.len();
                }
            }));
        }

        for i in 0..2000u32 {
            list.insert(entry(format!("key{i:08}").as_bytes(), i as u64 + 1));
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().expect("reader");
        }
        assert_eq!(collect_user_keys(&list).len(), 2000);
    }
}
