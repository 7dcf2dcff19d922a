//! Prefix-compressed key/value blocks.
//!
//! Keys within a block share prefixes with their predecessor. Every
//! `restart_interval` entries the compression resets and the full key is
//! stored; the offsets of these restart points form a trailer array that
//! supports binary search.
//!
//! ```text
//! entry:   u32 shared | u32 unshared | u32 value_len | key_delta | value
//! trailer: u32 restarts[n] | u32 n
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::{decode_fixed32, put_fixed32};
use crate::corruption;
use crate::error::Result;
use crate::iterator::Iter;
use crate::keys::Comparator;

const ENTRY_HEADER: usize = 12;

/// Accumulates sorted key/value pairs into an encoded block.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    interval: usize,
    counter: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(interval: usize) -> BlockBuilder {
        debug_assert!(interval >= 1);
        BlockBuilder {
            buffer: Vec::new(),
            restarts: vec![0],
            interval,
            counter: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in comparator order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        if self.counter == self.interval {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            self.last_key.clear();
        }

        let shared = shared_prefix_len(&self.last_key, key);
        let unshared = key.len() - shared;

        put_fixed32(&mut self.buffer, shared as u32);
        put_fixed32(&mut self.buffer, unshared as u32);
        put_fixed32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart trailer and returns the encoded block.
    pub fn finish(&mut self) -> Vec<u8> {
        for restart in &self.restarts {
            put_fixed32(&mut self.buffer, *restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        std::mem::take(&mut self.buffer)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A decoded, immutable block.
pub struct Block {
    data: Vec<u8>,
    restarts: Vec<u32>,
    /// Offset where entry data ends and the restart trailer begins.
    limit: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return Err(corruption!("block too small for restart count"));
        }
        let count = decode_fixed32(&data[data.len() - 4..]) as usize;
        let trailer = count
            .checked_add(1)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| corruption!("block restart count overflows"))?;
        if data.len() < trailer {
            return Err(corruption!(
                "block too small for {count} restart offsets"
            ));
        }

        let limit = data.len() - trailer;
        let mut restarts = Vec::with_capacity(count);
        for i in 0..count {
            let offset = decode_fixed32(&data[limit + i * 4..]);
            if offset as usize > limit {
                return Err(corruption!("block restart offset out of range"));
            }
            restarts.push(offset);
        }
        if restarts.is_empty() {
            return Err(corruption!("block carries no restart points"));
        }

        Ok(Block {
            data,
            restarts,
            limit,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(self: &Arc<Self>, cmp: Arc<dyn Comparator>) -> BlockIter {
        BlockIter::new(Arc::clone(self), cmp)
    }
}

/// Cursor over one block. Maintains the current key incrementally as entries
/// are decoded against their predecessors.
pub struct BlockIter {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    /// Offset of the current entry.
    offset: usize,
    /// Offset just past the current entry; the next decode starts here.
    next_offset: usize,
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    valid: bool,
}

impl BlockIter {
    fn new(block: Arc<Block>, cmp: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            block,
            cmp,
            offset: 0,
            next_offset: 0,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            valid: false,
        }
    }

    /// Decodes the entry at `next_offset` against the current key. Returns
    /// false (leaving the iterator invalid) at the block limit or on a
    /// malformed entry.
    fn parse_next_entry(&mut self) -> bool {
        let offset = self.next_offset;
        if offset + ENTRY_HEADER > self.block.limit {
            self.valid = false;
            return false;
        }
        let data = &self.block.data;
        let shared = decode_fixed32(&data[offset..]) as usize;
        let unshared = decode_fixed32(&data[offset + 4..]) as usize;
        let value_len = decode_fixed32(&data[offset + 8..]) as usize;

        let key_start = offset + ENTRY_HEADER;
        let value_start = key_start + unshared;
        let entry_end = value_start + value_len;
        if shared > self.key.len() || entry_end > self.block.limit {
            // Malformed entry; the block is unreadable from here on.
            self.valid = false;
            return false;
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&data[key_start..value_start]);
        self.value_offset = value_start;
        self.value_len = value_len;
        self.offset = offset;
        self.next_offset = entry_end;
        self.valid = true;
        true
    }

    fn seek_to_restart(&mut self, index: usize) {
        self.key.clear();
        self.offset = self.block.restarts[index] as usize;
        self.next_offset = self.offset;
        self.valid = false;
    }

    /// Decodes the full key stored at a restart point without disturbing the
    /// iterator position.
    fn restart_key(&self, index: usize) -> Result<&[u8]> {
        let offset = self.block.restarts[index] as usize;
        let data = &self.block.data;
        if offset + ENTRY_HEADER > self.block.limit {
            return Err(corruption!("restart point out of range"));
        }
        let shared = decode_fixed32(&data[offset..]) as usize;
        let unshared = decode_fixed32(&data[offset + 4..]) as usize;
        if shared != 0 {
            return Err(corruption!("restart entry shares a prefix"));
        }
        let key_start = offset + ENTRY_HEADER;
        if key_start + unshared > self.block.limit {
            return Err(corruption!("restart key out of range"));
        }
        Ok(&data[key_start..key_start + unshared])
    }
}

impl Iter for BlockIter {
    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn next(&mut self) {
        if self.valid {
            self.parse_next_entry();
        }
    }

    fn prev(&mut self) {
        if !self.valid {
            return;
        }
        let target = self.offset;

        // Largest restart strictly before the current entry.
        let mut index = None;
        for (i, restart) in self.block.restarts.iter().enumerate() {
            if (*restart as usize) < target {
                index = Some(i);
            } else {
                break;
            }
        }
        let index = match index {
            Some(i) => i,
            None => {
                self.valid = false;
                return;
            }
        };

        self.seek_to_restart(index);
        // Walk forward to the entry immediately preceding the old position.
        while self.parse_next_entry() && self.next_offset < target {}
    }

    fn seek(&mut self, target: &[u8]) {
        // Binary-search restarts for the rightmost one whose key <= target.
        let mut left = 0;
        let mut right = self.block.restarts.len() - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.restart_key(mid) {
                Ok(key) => {
                    if self.cmp.compare(key, target) != Ordering::Greater {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                Err(_) => {
                    self.valid = false;
                    return;
                }
            }
        }

        self.seek_to_restart(left);
        // Linear scan to the first key >= target.
        while self.parse_next_entry() {
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn seek_to_first(&mut self) {
        self.seek_to_restart(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        self.seek_to_restart(self.block.restarts.len() - 1);
        while self.parse_next_entry() && self.next_offset < self.block.limit {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::BytewiseComparator;

    fn build(entries: &[(&[u8], &[u8])], interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(interval);
        for (k, v) in entries {
            builder.add(k, v);
        }
        Arc::new(Block::new(builder.finish()).expect("decode block"))
    }

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    #[test]
    fn test_roundtrip_with_shared_prefixes() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"apple", b"fruit"),
            (b"application", b"software"),
            (b"apply", b"verb"),
            (b"banana", b"fruit"),
            (b"band", b"music"),
        ];
        let block = build(&entries, 2);

        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        for (k, v) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), *k);
            assert_eq!(iter.value(), *v);
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_lands_on_first_key_at_or_after_target() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"bb", b"1"),
            (b"dd", b"2"),
            (b"ff", b"3"),
            (b"hh", b"4"),
        ];
        let block = build(&entries, 1);
        let mut iter = block.iter(cmp());

        iter.seek(b"dd");
        assert_eq!(iter.key(), b"dd");
        iter.seek(b"cc");
        assert_eq!(iter.key(), b"dd");
        iter.seek(b"aa");
        assert_eq!(iter.key(), b"bb");
        iter.seek(b"zz");
        assert!(!iter.valid());
    }

    #[test]
    fn test_prev_walks_backward() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"a", b"1"),
            (b"b", b"2"),
            (b"c", b"3"),
            (b"d", b"4"),
            (b"e", b"5"),
        ];
        let block = build(&entries, 2);
        let mut iter = block.iter(cmp());

        iter.seek_to_last();
        let mut backward = Vec::new();
        while iter.valid() {
            backward.push(iter.key().to_vec());
            iter.prev();
        }
        backward.reverse();
        let forward: Vec<Vec<u8>> = entries.iter().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(backward, forward);
    }

    #[test]
    fn test_random_sorted_pairs_roundtrip() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = (0..500)
            .map(|_| {
                let klen = rng.gen_range(1..24);
                let vlen = rng.gen_range(0..64);
                let key: Vec<u8> = (0..klen).map(|_| rng.gen_range(b'a'..=b'z')).collect();
                let value: Vec<u8> = (0..vlen).map(|_| rng.gen()).collect();
                (key, value)
            })
            .collect();
        entries.sort();
        entries.dedup_by(|a, b| a.0 == b.0);

        let mut builder = BlockBuilder::new(16);
        for (k, v) in &entries {
            builder.add(k, v);
        }
        let block = Arc::new(Block::new(builder.finish()).expect("decode"));

        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        for (k, v) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            assert_eq!(iter.value(), v.as_slice());
            iter.next();
        }
        assert!(!iter.valid());

        // Seeks land on the first entry >= target.
        for (k, v) in entries.iter().step_by(17) {
            iter.seek(k);
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            assert_eq!(iter.value(), v.as_slice());
        }
    }

    #[test]
    fn test_empty_block_has_no_entries() {
        let mut builder = BlockBuilder::new(16);
        let block = Arc::new(Block::new(builder.finish()).expect("decode"));
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
    }

    #[test]
    fn test_malformed_block_rejected() {
        assert!(Block::new(vec![]).is_err());
        assert!(Block::new(vec![0, 0]).is_err());
        // Restart count claims more offsets than the block holds.
        let mut data = Vec::new();
        put_fixed32(&mut data, 1000);
        assert!(Block::new(data).is_err());
    }

    #[test]
    fn test_size_estimate_tracks_trailer() {
        let mut builder = BlockBuilder::new(16);
        assert_eq!(builder.current_size_estimate(), 8);
        builder.add(b"key", b"value");
        let est = builder.current_size_estimate();
        assert_eq!(est, 12 + 3 + 5 + 8);
        let block = builder.finish();
        assert_eq!(block.len(), est);
    }
}
