//! The user-visible database iterator.
//!
//! The merged internal stream yields every entry of every source: multiple
//! sequences per user key, tombstones included. This wrapper collapses it
//! to the newest entry per user key visible at the iterator's snapshot
//! sequence, hiding deleted keys, in both directions.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use crate::coding::put_fixed64;
use crate::iterator::{Iter, MergeIterator};
use crate::keys::{
    pack_sequence_and_type, InternalKeyComparator, ParsedInternalKey, ValueType,
};
use crate::version::Version;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// The current entry is `inner`'s current entry.
    Forward,
    /// `inner` sits just before the entries for the current user key,
    /// which is saved in `saved_key`/`saved_value`.
    Reverse,
}

pub struct DbIterator {
    inner: MergeIterator,
    icmp: InternalKeyComparator,
    /// Writes after this sequence are invisible.
    sequence: u64,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    /// Keeps every file the merged iterator reads from alive.
    _version: Arc<Version>,
}

impl DbIterator {
    pub(crate) fn new(
        inner: MergeIterator,
        icmp: InternalKeyComparator,
        sequence: u64,
        version: Arc<Version>,
    ) -> DbIterator {
        DbIterator {
            inner,
            icmp,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            _version: version,
        }
    }

    /// Scans forward to the newest visible, undeleted entry of the next
    /// user key. When `skipping`, entries for user keys <= `saved_key` are
    /// shadowed and passed over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        let ucmp = Arc::clone(self.icmp.user_comparator());
        while self.inner.valid() {
            if let Ok(parsed) = ParsedInternalKey::decode(self.inner.key()) {
                if parsed.sequence <= self.sequence {
                    match parsed.vtype {
                        ValueType::Deletion => {
                            // Everything older for this user key is deleted.
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(parsed.user_key);
                            skipping = true;
                        }
                        ValueType::Value => {
                            if !(skipping
                                && ucmp.compare(parsed.user_key, &self.saved_key)
                                    != CmpOrdering::Greater)
                            {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                        ValueType::Seek => {}
                    }
                }
            }
            self.inner.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Scans backward until positioned just before the entries of the
    /// nearest preceding visible, undeleted user key, captured in
    /// `saved_key`/`saved_value`.
    fn find_prev_user_entry(&mut self) {
        let ucmp = Arc::clone(self.icmp.user_comparator());
        let mut value_type = ValueType::Deletion;

        while self.inner.valid() {
            if let Ok(parsed) = ParsedInternalKey::decode(self.inner.key()) {
                if parsed.sequence <= self.sequence {
                    if value_type != ValueType::Deletion
                        && ucmp.compare(parsed.user_key, &self.saved_key) == CmpOrdering::Less
                    {
                        // Stepped past every entry of the saved key; it is
                        // the answer.
                        break;
                    }
                    value_type = parsed.vtype;
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.inner.value());
                    }
                }
            }
            self.inner.prev();
        }

        if value_type == ValueType::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl Iter for DbIterator {
    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => {
                ParsedInternalKey::decode(self.inner.key())
                    .expect("validated")
                    .user_key
            }
            Direction::Reverse => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // inner sits before the current key's entries; step onto them.
            // saved_key already holds the user key to move past.
            if self.inner.valid() {
                self.inner.next();
            } else {
                self.inner.seek_to_first();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(
                ParsedInternalKey::decode(self.inner.key())
                    .expect("validated")
                    .user_key,
            );
            self.inner.next();
        }

        self.find_next_user_entry(true);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // Position inner before the current user key's entries.
            let current_user = ParsedInternalKey::decode(self.inner.key())
                .expect("validated")
                .user_key
                .to_vec();
            self.saved_key.clear();
            self.saved_key.extend_from_slice(&current_user);
            let ucmp = Arc::clone(self.icmp.user_comparator());
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                let user_key = ParsedInternalKey::decode(self.inner.key())
                    .expect("validated")
                    .user_key;
                if ucmp.compare(user_key, &self.saved_key) == CmpOrdering::Less {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();
        let mut bound = Vec::with_capacity(target.len() + 8);
        bound.extend_from_slice(target);
        put_fixed64(
            &mut bound,
            pack_sequence_and_type(self.sequence, ValueType::Seek),
        );
        self.inner.seek(&bound);
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_key.clear();
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }
}
