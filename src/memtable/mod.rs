//! The in-memory sorted buffer of recent writes.
//!
//! Entries are stored fully encoded so the skip list never re-parses more
//! than a length prefix:
//!
//! ```text
//! +------------------+--------------+-----------------+---------------+-------+
//! | u32 len(ikey)    | user key     | u64 seq<<8|type | u32 len(value)| value |
//! +------------------+--------------+-----------------+---------------+-------+
//! ```
//!
//! A memtable accepts writes from the single thread at the head of the
//! writer queue while readers traverse it concurrently. Once rotated it
//! becomes immutable and lives only until its contents reach a level-0
//! sstable.

pub mod skiplist;

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use skiplist::{SkipList, SkipListCursor};

use crate::coding::{decode_fixed32, decode_fixed64, put_fixed32, put_fixed64};
use crate::iterator::Iter;
use crate::keys::{
    pack_sequence_and_type, InternalKeyComparator, LookupKey, MemtableKeyComparator, ValueType,
};

pub struct MemTable {
    list: SkipList,
    icmp: InternalKeyComparator,
    written: AtomicUsize,
}

impl MemTable {
    pub fn new(icmp: InternalKeyComparator) -> MemTable {
        MemTable {
            list: SkipList::new(MemtableKeyComparator::new(icmp.clone())),
            icmp,
            written: AtomicUsize::new(0),
        }
    }

    /// Inserts one operation. Callers serialize through the writer queue.
    pub fn add(&self, seq: u64, vtype: ValueType, user_key: &[u8], value: &[u8]) {
        let ikey_len = user_key.len() + 8;
        let mut entry = Vec::with_capacity(4 + ikey_len + 4 + value.len());
        put_fixed32(&mut entry, ikey_len as u32);
        entry.extend_from_slice(user_key);
        put_fixed64(&mut entry, pack_sequence_and_type(seq, vtype));
        put_fixed32(&mut entry, value.len() as u32);
        entry.extend_from_slice(value);

        self.written.fetch_add(entry.len(), Ordering::Relaxed);
        self.list.insert(entry);
    }

    /// Looks up the newest entry for the key visible at the lookup
    /// sequence. `Some(Some(v))` is a live value, `Some(None)` a tombstone,
    /// `None` a miss.
    pub fn get(&self, key: &LookupKey) -> Option<Option<Vec<u8>>> {
        let mut cursor = SkipListCursor::new();
        cursor.seek(&self.list, key.memtable_key());
        if !cursor.valid() {
            return None;
        }

        let entry = cursor.entry();
        let ikey_len = decode_fixed32(entry) as usize;
        let ikey = &entry[4..4 + ikey_len];
        let user_key = &ikey[..ikey.len() - 8];
        if self
            .icmp
            .user_comparator()
            .compare(user_key, key.user_key())
            != CmpOrdering::Equal
        {
            return None;
        }

        let tag = decode_fixed64(&ikey[ikey.len() - 8..]);
        match ValueType::from_u8((tag & 0xff) as u8) {
            Ok(ValueType::Value) => {
                let value_start = 4 + ikey_len;
                let value_len = decode_fixed32(&entry[value_start..]) as usize;
                Some(Some(
                    entry[value_start + 4..value_start + 4 + value_len].to_vec(),
                ))
            }
            Ok(ValueType::Deletion) => Some(None),
            _ => None,
        }
    }

    /// Running total of bytes inserted, entry framing included.
    pub fn approximate_memory_usage(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    /// Iterator yielding internal keys in internal-key order.
    pub fn iter(self: &Arc<Self>) -> MemTableIter {
        MemTableIter {
            memtable: Arc::clone(self),
            cursor: SkipListCursor::new(),
        }
    }
}

/// Cursor over a memtable. Holds the table alive; keys are the internal
/// keys of stored entries.
pub struct MemTableIter {
    memtable: Arc<MemTable>,
    cursor: SkipListCursor,
}

impl MemTableIter {
    fn current_entry(&self) -> &[u8] {
        self.cursor.entry()
    }
}

impl Iter for MemTableIter {
    fn valid(&self) -> bool {
        self.cursor.valid()
    }

    fn key(&self) -> &[u8] {
        let entry = self.current_entry();
        let ikey_len = decode_fixed32(entry) as usize;
        &entry[4..4 + ikey_len]
    }

    fn value(&self) -> &[u8] {
        let entry = self.current_entry();
        let ikey_len = decode_fixed32(entry) as usize;
        let value_start = 4 + ikey_len;
        let value_len = decode_fixed32(&entry[value_start..]) as usize;
        &entry[value_start + 4..value_start + 4 + value_len]
    }

    fn next(&mut self) {
        self.cursor.next();
    }

    fn prev(&mut self) {
        self.cursor.prev(&self.memtable.list);
    }

    fn seek(&mut self, target: &[u8]) {
        // Targets arrive as internal keys; reframe as a memtable key.
        let mut mem_key = Vec::with_capacity(4 + target.len());
        put_fixed32(&mut mem_key, target.len() as u32);
        mem_key.extend_from_slice(target);
        self.cursor.seek(&self.memtable.list, &mem_key);
    }

    fn seek_to_first(&mut self) {
        self.cursor.seek_to_first(&self.memtable.list);
    }

    fn seek_to_last(&mut self) {
        self.cursor.seek_to_last(&self.memtable.list);
    }
}
