//! Atomic groups of write operations.
//!
//! A batch is a single byte buffer in the log's record format, so the
//! writer coordinator can append it to the WAL without re-encoding:
//!
//! ```text
//! +---------+-----------+--------------------------------------+
//! | u64 seq | u32 count | (u8 type | lp(key) | [lp(value)])*   |
//! +---------+-----------+--------------------------------------+
//! ```
//!
//! Records are applied with sequence numbers `seq, seq + 1, ...` in the
//! order they were added.

use crate::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed, put_length_prefixed,
};
use crate::corruption;
use crate::error::Result;
use crate::keys::ValueType;
use crate::memtable::MemTable;

/// Byte offset where records begin: the sequence and count header.
pub const BATCH_HEADER: usize = 12;

/// Receives the replayed operations of a batch in order.
pub trait BatchHandler {
    fn put(&mut self, seq: u64, key: &[u8], value: &[u8]);
    fn delete(&mut self, seq: u64, key: &[u8]);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> WriteBatch {
        WriteBatch {
            rep: vec![0; BATCH_HEADER],
        }
    }

    /// Reconstructs a batch from its wire form (a WAL record).
    pub fn from_contents(contents: Vec<u8>) -> Result<WriteBatch> {
        if contents.len() < BATCH_HEADER {
            return Err(corruption!("write batch header truncated"));
        }
        Ok(WriteBatch { rep: contents })
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed(&mut self.rep, key);
        put_length_prefixed(&mut self.rep, value);
        self.set_count(self.count() + 1);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed(&mut self.rep, key);
        self.set_count(self.count() + 1);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER, 0);
    }

    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..])
    }

    pub fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    pub fn sequence(&self) -> u64 {
        decode_fixed64(&self.rep)
    }

    pub fn set_sequence(&mut self, seq: u64) {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
    }

    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    pub fn byte_size(&self) -> usize {
        self.rep.len()
    }

    /// Concatenates `other`'s records onto this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER..]);
    }

    /// Replays the records through `handler` with ascending sequence
    /// numbers starting at this batch's stored sequence.
    pub fn iterate(&self, handler: &mut dyn BatchHandler) -> Result<()> {
        let mut data = &self.rep[BATCH_HEADER..];
        let mut seq = self.sequence();
        let mut found = 0u32;

        while !data.is_empty() {
            let tag = data[0];
            data = &data[1..];
            match ValueType::from_u8(tag)? {
                ValueType::Value => {
                    let (key, rest) = get_length_prefixed(data)?;
                    let (value, rest) = get_length_prefixed(rest)?;
                    handler.put(seq, key, value);
                    data = rest;
                }
                ValueType::Deletion => {
                    let (key, rest) = get_length_prefixed(data)?;
                    handler.delete(seq, key);
                    data = rest;
                }
                ValueType::Seek => {
                    return Err(corruption!("unexpected record tag in write batch"));
                }
            }
            seq += 1;
            found += 1;
        }

        if found != self.count() {
            return Err(corruption!(
                "write batch count {} does not match records {found}",
                self.count()
            ));
        }
        Ok(())
    }

    /// Applies every record to the memtable.
    pub fn insert_into(&self, memtable: &MemTable) -> Result<()> {
        let mut inserter = MemTableInserter { memtable };
        self.iterate(&mut inserter)
    }
}

struct MemTableInserter<'a> {
    memtable: &'a MemTable,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, seq: u64, key: &[u8], value: &[u8]) {
        self.memtable.add(seq, ValueType::Value, key, value);
    }

    fn delete(&mut self, seq: u64, key: &[u8]) {
        self.memtable.add(seq, ValueType::Deletion, key, b"");
    }
}
