//! Version edits: the serialized deltas recorded in the manifest.
//!
//! An edit is a tag-then-payload stream. Applying the sequence of edits in
//! a manifest to an empty version reproduces the database's live file set.
//!
//! ```text
//! tag 0 LogNumber   u32
//! tag 1 FileNumber  u32
//! tag 2 CmpName     lp(name)
//! tag 3 Sequence    u64
//! tag 4 Files       u32 level | u32 number | u64 size | lp(min) | lp(max)
//! tag 5 Pointers    u32 level | lp(internal key)
//! tag 6 Deletes     u32 level | u32 number
//! ```

use crate::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed, put_fixed32, put_fixed64,
    put_length_prefixed,
};
use crate::config::MAX_LEVEL;
use crate::corruption;
use crate::error::Result;
use crate::keys::InternalKey;

use super::version::FileMetaData;

const TAG_LOG_NUMBER: u8 = 0;
const TAG_FILE_NUMBER: u8 = 1;
const TAG_CMP_NAME: u8 = 2;
const TAG_SEQUENCE: u8 = 3;
const TAG_FILES: u8 = 4;
const TAG_POINTERS: u8 = 5;
const TAG_DELETES: u8 = 6;

/// One atomic change to the database's file structure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub new_files: Vec<(usize, FileMetaData)>,
    pub deleted_files: Vec<(usize, u64)>,
}

impl VersionEdit {
    pub fn new() -> VersionEdit {
        VersionEdit::default()
    }

    pub fn clear(&mut self) {
        *self = VersionEdit::default();
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator_name = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Records a file added at `level`. `smallest` and `largest` must be the
    /// extreme internal keys actually present in the file.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            FileMetaData::new(number, size, smallest, largest),
        ));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Some(number) = self.log_number {
            buf.push(TAG_LOG_NUMBER);
            put_fixed32(&mut buf, number as u32);
        }
        if let Some(number) = self.next_file_number {
            buf.push(TAG_FILE_NUMBER);
            put_fixed32(&mut buf, number as u32);
        }
        if let Some(name) = &self.comparator_name {
            buf.push(TAG_CMP_NAME);
            put_length_prefixed(&mut buf, name.as_bytes());
        }
        if let Some(seq) = self.last_sequence {
            buf.push(TAG_SEQUENCE);
            put_fixed64(&mut buf, seq);
        }
        for (level, meta) in &self.new_files {
            buf.push(TAG_FILES);
            put_fixed32(&mut buf, *level as u32);
            put_fixed32(&mut buf, meta.number as u32);
            put_fixed64(&mut buf, meta.size);
            put_length_prefixed(&mut buf, meta.smallest.encoded());
            put_length_prefixed(&mut buf, meta.largest.encoded());
        }
        for (level, number) in &self.deleted_files {
            buf.push(TAG_DELETES);
            put_fixed32(&mut buf, *level as u32);
            put_fixed32(&mut buf, *number as u32);
        }
        for (level, key) in &self.compact_pointers {
            buf.push(TAG_POINTERS);
            put_fixed32(&mut buf, *level as u32);
            put_length_prefixed(&mut buf, key.encoded());
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<VersionEdit> {
        let mut edit = VersionEdit::new();

        while !data.is_empty() {
            let tag = data[0];
            data = &data[1..];
            match tag {
                TAG_LOG_NUMBER => {
                    let number = read_fixed32(&mut data)?;
                    edit.log_number = Some(number as u64);
                }
                TAG_FILE_NUMBER => {
                    let number = read_fixed32(&mut data)?;
                    edit.next_file_number = Some(number as u64);
                }
                TAG_CMP_NAME => {
                    let (name, rest) = get_length_prefixed(data)?;
                    edit.comparator_name = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| corruption!("comparator name is not utf-8"))?,
                    );
                    data = rest;
                }
                TAG_SEQUENCE => {
                    if data.len() < 8 {
                        return Err(corruption!("version edit sequence truncated"));
                    }
                    edit.last_sequence = Some(decode_fixed64(data));
                    data = &data[8..];
                }
                TAG_FILES => {
                    let level = read_level(&mut data)?;
                    let number = read_fixed32(&mut data)? as u64;
                    if data.len() < 8 {
                        return Err(corruption!("version edit file size truncated"));
                    }
                    let size = decode_fixed64(data);
                    data = &data[8..];
                    let (smallest, rest) = get_length_prefixed(data)?;
                    let (largest, rest) = get_length_prefixed(rest)?;
                    edit.new_files.push((
                        level,
                        FileMetaData::new(
                            number,
                            size,
                            InternalKey::decode_from(smallest),
                            InternalKey::decode_from(largest),
                        ),
                    ));
                    data = rest;
                }
                TAG_DELETES => {
                    let level = read_level(&mut data)?;
                    let number = read_fixed32(&mut data)? as u64;
                    edit.deleted_files.push((level, number));
                }
                TAG_POINTERS => {
                    let level = read_level(&mut data)?;
                    let (key, rest) = get_length_prefixed(data)?;
                    edit.compact_pointers
                        .push((level, InternalKey::decode_from(key)));
                    data = rest;
                }
                other => return Err(corruption!("unknown version edit tag {other}")),
            }
        }
        Ok(edit)
    }
}

fn read_fixed32(data: &mut &[u8]) -> Result<u32> {
    if data.len() < 4 {
        return Err(corruption!("version edit field truncated"));
    }
    let value = decode_fixed32(data);
    *data = &data[4..];
    Ok(value)
}

fn read_level(data: &mut &[u8]) -> Result<usize> {
    let level = read_fixed32(data)? as usize;
    if level >= MAX_LEVEL {
        return Err(corruption!("version edit level {level} out of range"));
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ValueType;

    fn ikey(user: &str, seq: u64) -> InternalKey {
        InternalKey::new(user.as_bytes(), seq, ValueType::Value)
    }

    fn roundtrip(edit: &VersionEdit) -> VersionEdit {
        VersionEdit::decode(&edit.encode()).expect("decode")
    }

    #[test]
    fn test_empty_edit_roundtrip() {
        let edit = VersionEdit::new();
        assert_eq!(roundtrip(&edit), edit);
    }

    #[test]
    fn test_full_edit_roundtrip() {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("emberdb.BytewiseComparator");
        edit.set_log_number(12312312);
        edit.set_next_file_number(1231231223);
        edit.set_last_sequence(2349098567);
        for i in 0..100u64 {
            let level = (i as usize) % MAX_LEVEL;
            edit.add_file(
                level,
                700 + i,
                1048576 + i,
                ikey(&format!("file{i:03}-min"), 1000 + i),
                ikey(&format!("file{i:03}-max"), 2000 + i),
            );
            edit.delete_file(level, 300 + i);
            edit.set_compact_pointer(level, ikey(&format!("ptr{i:03}"), 3000 + i));
        }

        let decoded = roundtrip(&edit);
        assert_eq!(decoded.comparator_name, edit.comparator_name);
        assert_eq!(decoded.log_number, edit.log_number);
        assert_eq!(decoded.next_file_number, edit.next_file_number);
        assert_eq!(decoded.last_sequence, edit.last_sequence);
        assert_eq!(decoded.new_files, edit.new_files);
        assert_eq!(decoded.deleted_files, edit.deleted_files);
        assert_eq!(decoded.compact_pointers, edit.compact_pointers);
        assert_eq!(decoded, edit);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(VersionEdit::decode(&[99]).is_err());
    }

    #[test]
    fn test_decode_rejects_out_of_range_level() {
        let mut buf = Vec::new();
        buf.push(TAG_DELETES);
        put_fixed32(&mut buf, MAX_LEVEL as u32);
        put_fixed32(&mut buf, 1);
        assert!(VersionEdit::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_field() {
        let mut buf = Vec::new();
        buf.push(TAG_SEQUENCE);
        buf.extend_from_slice(&[1, 2, 3]);
        assert!(VersionEdit::decode(&buf).is_err());
    }
}
