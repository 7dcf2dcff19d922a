//! Internal keys and comparators.
//!
//! The engine never stores a user key alone. Every key in the memtable, in
//! sstables, and in the manifest is an *internal key*:
//!
//! ```text
//! +----------------+--------------------------------+
//! | user key bytes | u64 LE (sequence << 8 | type)  |
//! +----------------+--------------------------------+
//! ```
//!
//! Internal keys order by user key ascending, then sequence descending, so
//! the newest write for a user key sorts first. The `Seek` type is the
//! largest tag and is only used to build lookup bounds.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::{decode_fixed64, get_length_prefixed, put_fixed32, put_fixed64};
use crate::error::Result;
use crate::corruption;

/// Largest sequence number the engine can assign (56 bits).
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Tag byte stored in the low 8 bits of the internal key trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// Sentinel used as the max type during lookups; never stored.
    Seek = 0,
    /// A live value.
    Value = 1,
    /// A deletion tombstone.
    Deletion = 2,
}

impl ValueType {
    pub fn from_u8(tag: u8) -> Result<ValueType> {
        match tag {
            0 => Ok(ValueType::Seek),
            1 => Ok(ValueType::Value),
            2 => Ok(ValueType::Deletion),
            other => Err(corruption!("unknown value type tag {other}")),
        }
    }
}

/// Packs a sequence number and type into the 8-byte internal key trailer.
pub fn pack_sequence_and_type(seq: u64, vtype: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    seq << 8 | vtype as u64
}

/// Splits an internal key into its user key and trailer fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: u64,
    pub vtype: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn decode(ikey: &'a [u8]) -> Result<ParsedInternalKey<'a>> {
        if ikey.len() < 8 {
            return Err(corruption!("internal key shorter than 8 bytes"));
        }
        let tag = decode_fixed64(&ikey[ikey.len() - 8..]);
        Ok(ParsedInternalKey {
            user_key: &ikey[..ikey.len() - 8],
            sequence: tag >> 8,
            vtype: ValueType::from_u8((tag & 0xff) as u8)?,
        })
    }
}

/// Returns the user-key portion of an encoded internal key.
pub fn extract_user_key(ikey: &[u8]) -> &[u8] {
    debug_assert!(ikey.len() >= 8);
    &ikey[..ikey.len() - 8]
}

/// An owned, encoded internal key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InternalKey {
    content: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seq: u64, vtype: ValueType) -> InternalKey {
        let mut content = Vec::with_capacity(user_key.len() + 8);
        content.extend_from_slice(user_key);
        put_fixed64(&mut content, pack_sequence_and_type(seq, vtype));
        InternalKey { content }
    }

    pub fn decode_from(data: &[u8]) -> InternalKey {
        InternalKey {
            content: data.to_vec(),
        }
    }

    pub fn encoded(&self) -> &[u8] {
        &self.content
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.content)
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Bounds used to probe the memtable and sstables for a user key at a
/// snapshot sequence. Owns one buffer laid out as a full memtable key
/// (`u32 len | user_key | trailer`) so the three views are cheap slices.
pub struct LookupKey {
    data: Vec<u8>,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: u64) -> LookupKey {
        let mut data = Vec::with_capacity(4 + user_key.len() + 8);
        put_fixed32(&mut data, (user_key.len() + 8) as u32);
        data.extend_from_slice(user_key);
        put_fixed64(&mut data, pack_sequence_and_type(seq, ValueType::Seek));
        LookupKey { data }
    }

    /// Key formatted for a skip-list seek (length prefix included).
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// Key formatted for an sstable seek.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[4..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.data[4..self.data.len() - 8]
    }
}

/// A total order over byte strings, plus the separator shortening used by
/// sstable index blocks.
pub trait Comparator: Send + Sync {
    /// Name persisted in the manifest; a mismatch on reopen is an error.
    fn name(&self) -> &'static str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Returns a key `k` with `from <= k < to` that is as short as possible.
    /// Falls back to `from` when no shorter separator exists.
    fn find_shortest_separator(&self, from: &[u8], to: &[u8]) -> Vec<u8>;
}

/// Lexicographic byte order, the default user comparator.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "emberdb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, from: &[u8], to: &[u8]) -> Vec<u8> {
        let min_len = from.len().min(to.len());
        let mut shared = 0;
        while shared < min_len && from[shared] == to[shared] {
            shared += 1;
        }
        if shared < min_len {
            let byte = from[shared];
            if byte < 0xff && byte + 1 < to[shared] {
                let mut sep = from[..shared + 1].to_vec();
                sep[shared] += 1;
                return sep;
            }
        }
        from.to_vec()
    }
}

/// Shared handle to a user comparator.
pub type UserComparator = Arc<dyn Comparator>;

/// The derived order on internal keys: user key ascending, then the packed
/// `(sequence, type)` trailer descending so newer entries sort first.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: UserComparator,
}

impl InternalKeyComparator {
    pub fn new(user: UserComparator) -> InternalKeyComparator {
        InternalKeyComparator { user }
    }

    pub fn user_comparator(&self) -> &UserComparator {
        &self.user
    }

    pub fn compare_keys(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.encoded(), b.encoded())
    }
}

/// Reorders a trailer for comparison: `Seek` is encoded as 0 but acts as
/// the maximum type, so a lookup bound at sequence S sorts ahead of every
/// entry written at S.
fn rank_tag(tag: u64) -> u64 {
    match tag & 0xff {
        0 => (tag & !0xff) | 3,
        _ => tag,
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "emberdb.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let split_a = a.len() - 8;
        let split_b = b.len() - 8;
        match self.user.compare(&a[..split_a], &b[..split_b]) {
            Ordering::Equal => {
                let tag_a = rank_tag(decode_fixed64(&a[split_a..]));
                let tag_b = rank_tag(decode_fixed64(&b[split_b..]));
                tag_b.cmp(&tag_a)
            }
            ord => ord,
        }
    }

    fn find_shortest_separator(&self, from: &[u8], to: &[u8]) -> Vec<u8> {
        let user_from = extract_user_key(from);
        let user_to = extract_user_key(to);
        let short = self.user.find_shortest_separator(user_from, user_to);
        if short.len() < user_from.len()
            && self.user.compare(user_from, &short) == Ordering::Less
        {
            // The shortened user key sits strictly between the two user
            // keys; give it the max trailer so it still sorts before every
            // entry of the successor key.
            let mut sep = short;
            put_fixed64(
                &mut sep,
                pack_sequence_and_type(MAX_SEQUENCE, ValueType::Seek),
            );
            return sep;
        }
        from.to_vec()
    }
}

/// Order on encoded memtable entries: each entry starts with a
/// length-prefixed internal key, compared with the internal-key order.
#[derive(Clone)]
pub struct MemtableKeyComparator {
    icmp: InternalKeyComparator,
}

impl MemtableKeyComparator {
    pub fn new(icmp: InternalKeyComparator) -> MemtableKeyComparator {
        MemtableKeyComparator { icmp }
    }

    pub fn compare_entries(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (key_a, _) = get_length_prefixed(a).expect("memtable entry");
        let (key_b, _) = get_length_prefixed(b).expect("memtable entry");
        self.icmp.compare(key_a, key_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ikey(user: &[u8], seq: u64, vtype: ValueType) -> Vec<u8> {
        InternalKey::new(user, seq, vtype).encoded().to_vec()
    }

    #[test]
    fn test_pack_roundtrip() {
        let key = ikey(b"foo", 100, ValueType::Value);
        let parsed = ParsedInternalKey::decode(&key).unwrap();
        assert_eq!(parsed.user_key, b"foo");
        assert_eq!(parsed.sequence, 100);
        assert_eq!(parsed.vtype, ValueType::Value);
    }

    #[test]
    fn test_internal_order_user_key_ascending() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let a = ikey(b"apple", 5, ValueType::Value);
        let b = ikey(b"banana", 5, ValueType::Value);
        assert_eq!(icmp.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_internal_order_sequence_descending() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let newer = ikey(b"key", 9, ValueType::Value);
        let older = ikey(b"key", 3, ValueType::Value);
        assert_eq!(icmp.compare(&newer, &older), Ordering::Less);
    }

    #[test]
    fn test_seek_bound_includes_same_sequence_entries() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let seek = ikey(b"key", 7, ValueType::Seek);
        let value = ikey(b"key", 7, ValueType::Value);
        let deletion = ikey(b"key", 7, ValueType::Deletion);
        let newer = ikey(b"key", 8, ValueType::Value);
        // A Seek bound at sequence 7 sorts ahead of entries written at 7 but
        // behind entries written at 8, so "first entry >= bound" yields the
        // newest entry with sequence <= 7.
        assert_eq!(icmp.compare(&seek, &value), Ordering::Less);
        assert_eq!(icmp.compare(&seek, &deletion), Ordering::Less);
        assert_eq!(icmp.compare(&newer, &seek), Ordering::Less);
        // Stored types tie-break descending: a deletion at a sequence sorts
        // before a value at the same sequence.
        assert_eq!(icmp.compare(&deletion, &value), Ordering::Less);
    }

    #[test]
    fn test_lookup_key_views() {
        let lkey = LookupKey::new(b"user", 42);
        assert_eq!(lkey.user_key(), b"user");
        assert_eq!(lkey.internal_key().len(), 4 + 8);
        assert_eq!(lkey.memtable_key().len(), 4 + 4 + 8);
        let parsed = ParsedInternalKey::decode(lkey.internal_key()).unwrap();
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.vtype, ValueType::Seek);
    }

    #[test]
    fn test_shortest_separator_bumps_first_divergent_byte() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.find_shortest_separator(b"abcd", b"abzz"), b"abd".to_vec());
        // Adjacent bytes leave no room to shorten.
        assert_eq!(cmp.find_shortest_separator(b"abc", b"abd"), b"abc".to_vec());
        // A prefix of the other key cannot be shortened.
        assert_eq!(cmp.find_shortest_separator(b"ab", b"abcd"), b"ab".to_vec());
    }

    #[test]
    fn test_internal_separator_carries_max_trailer() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let from = ikey(b"abcd", 10, ValueType::Value);
        let to = ikey(b"abzz", 20, ValueType::Value);
        let sep = icmp.find_shortest_separator(&from, &to);
        assert_eq!(extract_user_key(&sep), b"abd");
        assert_eq!(icmp.compare(&from, &sep), Ordering::Less);
        assert_eq!(icmp.compare(&sep, &to), Ordering::Less);
    }
}
