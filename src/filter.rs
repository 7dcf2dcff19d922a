//! Filter policies and the per-table filter block.
//!
//! A filter policy is a "may-contain" oracle: it summarizes a set of keys
//! into a short byte string and later answers whether a key might be in the
//! set. A negative answer is authoritative and lets reads skip a data-block
//! fetch; a positive answer may be wrong.
//!
//! The filter *block* partitions an sstable's key space into 2 KiB regions
//! of file offset. One filter is generated per region:
//!
//! ```text
//! +-----------+-----------+-----+------------------+--------------+----+
//! | filter 0  | filter 1  | ... | u32 offsets[n]   | index_offset | lg |
//! +-----------+-----------+-----+------------------+--------------+----+
//! ```
//!
//! `lg` is the log2 of the region size (11), so a reader maps a data-block
//! offset to its region with a shift.

use crate::coding::{decode_fixed32, put_fixed32};
use crc::{Crc, CRC_32_ISO_HDLC};

/// Region size covered by one filter.
pub const FILTER_BASE: usize = 2048;
/// log2(FILTER_BASE), stored in the block's final byte.
pub const FILTER_BASE_LG: u8 = 11;

const BLOOM_HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A pluggable "may-contain" summary over a set of keys.
pub trait FilterPolicy: Send + Sync {
    /// Name persisted in the table's metaindex. Changing the filter encoding
    /// incompatibly must change the name, or old filters would be consulted
    /// with the new semantics.
    fn name(&self) -> &'static str;

    /// Builds a filter summarizing `keys`.
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// Must return true for every key passed to `create_filter`; should
    /// return false with high probability for keys that were not.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// The default bloom filter policy.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> BloomFilterPolicy {
        // Round intent: 0.69 =~ ln(2), the probe count minimizing the false
        // positive rate for the chosen bits per key.
        let k = ((bits_per_key as f64 * 0.69) as usize).clamp(1, 30);
        BloomFilterPolicy { bits_per_key, k }
    }

    fn bloom_hash(key: &[u8]) -> u32 {
        BLOOM_HASH.checksum(key)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "emberdb.BloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        // A floor keeps tiny key sets from degenerating into a filter that
        // matches everything.
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let mut filter = vec![0u8; bytes + 1];
        filter[bytes] = self.k as u8;

        for key in keys {
            let mut h = Self::bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bitpos = (h % bits as u32) as usize;
                filter[bitpos / 8] |= 1 << (bitpos % 8);
                h = h.wrapping_add(delta);
            }
        }
        filter
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }
        let bytes = filter.len() - 1;
        let bits = bytes * 8;
        let k = filter[bytes] as usize;
        if k > 30 {
            // Reserved for future encodings; treat as a match.
            return true;
        }

        let mut h = Self::bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bitpos = (h % bits as u32) as usize;
            if filter[bitpos / 8] & (1 << (bitpos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

/// Adapts a user-key policy to tables that store internal keys: the 8-byte
/// trailer varies per write, so filters are built and probed on the user
/// key alone.
pub struct InternalFilterPolicy {
    user_policy: std::sync::Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user_policy: std::sync::Arc<dyn FilterPolicy>) -> InternalFilterPolicy {
        InternalFilterPolicy { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        let user_keys: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| crate::keys::extract_user_key(k).to_vec())
            .collect();
        self.user_policy.create_filter(&user_keys)
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user_policy
            .key_may_match(crate::keys::extract_user_key(key), filter)
    }
}

/// Accumulates the filter block while a table is being built. The table
/// builder calls `start_block(offset)` as each data block is begun and
/// `add_key` for every key it writes.
pub struct FilterBlockBuilder {
    policy: std::sync::Arc<dyn FilterPolicy>,
    keys: Vec<Vec<u8>>,
    buffer: Vec<u8>,
    offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: std::sync::Arc<dyn FilterPolicy>) -> FilterBlockBuilder {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            buffer: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    /// Called with the file offset of each new data block; emits one filter
    /// per region boundary crossed since the previous call.
    pub fn start_block(&mut self, offset: usize) {
        let index = offset / FILTER_BASE;
        while self.offsets.len() < index {
            self.generate_filter();
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate_filter();
        }

        let index_offset = self.buffer.len() as u32;
        let offsets = std::mem::take(&mut self.offsets);
        for offset in offsets {
            put_fixed32(&mut self.buffer, offset);
        }
        put_fixed32(&mut self.buffer, index_offset);
        self.buffer.push(FILTER_BASE_LG);
        self.buffer
    }

    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.offsets.len() * 4 + 5
    }

    fn generate_filter(&mut self) {
        self.offsets.push(self.buffer.len() as u32);
        if self.keys.is_empty() {
            return;
        }
        let filter = self.policy.create_filter(&self.keys);
        self.buffer.extend_from_slice(&filter);
        self.keys.clear();
    }
}

/// Parses a filter block and answers region-scoped membership queries.
pub struct FilterBlockReader {
    policy: std::sync::Arc<dyn FilterPolicy>,
    block: Vec<u8>,
    offsets: Vec<u32>,
    base_lg: u8,
}

impl FilterBlockReader {
    pub fn new(policy: std::sync::Arc<dyn FilterPolicy>, block: Vec<u8>) -> Option<FilterBlockReader> {
        if block.len() < 5 {
            return None;
        }
        let base_lg = block[block.len() - 1];
        let index_offset = decode_fixed32(&block[block.len() - 5..]) as usize;
        if index_offset > block.len() - 5 {
            return None;
        }

        let mut offsets = Vec::new();
        let mut pos = index_offset;
        while pos + 4 <= block.len() - 5 {
            offsets.push(decode_fixed32(&block[pos..]));
            pos += 4;
        }
        // Sentinel so filter i spans offsets[i]..offsets[i + 1].
        offsets.push(index_offset as u32);

        for window in offsets.windows(2) {
            if window[1] < window[0] || window[1] as usize > index_offset {
                return None;
            }
        }

        Some(FilterBlockReader {
            policy,
            block,
            offsets,
            base_lg,
        })
    }

    /// True iff the key may be present in the data block starting at
    /// `block_offset`.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index + 1 >= self.offsets.len() {
            // Offsets past the covered range are treated as potential
            // matches rather than errors.
            return true;
        }
        let start = self.offsets[index] as usize;
        let limit = self.offsets[index + 1] as usize;
        let filter = &self.block[start..limit];
        if filter.is_empty() {
            // No keys were mapped to this region.
            return false;
        }
        self.policy.key_may_match(key, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    #[test]
    fn test_bloom_no_false_negatives() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key{i}").into_bytes()).collect();
        let filter = policy.create_filter(&keys);
        for key in &keys {
            assert!(policy.key_may_match(key, &filter), "lost {key:?}");
        }
    }

    #[test]
    fn test_bloom_false_positive_rate() {
        let policy = BloomFilterPolicy::new(16);
        let keys: Vec<Vec<u8>> = (0..10000).map(|i| format!("key{i}").into_bytes()).collect();
        let filter = policy.create_filter(&keys);

        let mut hits = 0;
        for i in 0..10000 {
            let probe = format!("absent{i}").into_bytes();
            if policy.key_may_match(&probe, &filter) {
                hits += 1;
            }
        }
        let rate = hits as f64 / 10000.0;
        assert!(rate < 0.02, "false positive rate too high: {rate}");
    }

    #[test]
    fn test_empty_filter_rejects() {
        let policy = BloomFilterPolicy::new(10);
        let filter = policy.create_filter(&[]);
        assert!(!policy.key_may_match(b"anything", &filter));
    }

    #[test]
    fn test_filter_block_single_region() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.add_key(b"box");
        let block = builder.finish();

        let reader = FilterBlockReader::new(policy(), block).expect("parse");
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(reader.key_may_match(100, b"box"));
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn test_filter_block_partitioned_regions() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.start_block(2000);
        builder.add_key(b"bar");
        builder.start_block(3100);
        builder.add_key(b"box");
        builder.start_block(9000);
        builder.add_key(b"box");
        builder.add_key(b"hello");
        let block = builder.finish();

        let reader = FilterBlockReader::new(policy(), block).expect("parse");
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(2000, b"bar"));
        assert!(!reader.key_may_match(0, b"box"));
        assert!(!reader.key_may_match(3100, b"foo"));
        assert!(reader.key_may_match(9000, b"hello"));
        assert!(reader.key_may_match(9000, b"box"));
        assert!(!reader.key_may_match(4100, b"foo"));
    }

    #[test]
    fn test_filter_block_empty() {
        let builder = FilterBlockBuilder::new(policy());
        let block = builder.finish();
        let reader = FilterBlockReader::new(policy(), block).expect("parse");
        // Nothing covered: every probe is out of range and passes through.
        assert!(reader.key_may_match(0, b"foo"));
    }
}
