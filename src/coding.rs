//! Fixed-width little-endian codecs and length-prefixed byte slices.
//!
//! Every integer the engine writes to disk is little-endian. A
//! length-prefixed slice is `u32 len | bytes`; it is the building brick of
//! memtable entries, batch records, and version-edit keys.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::Result;
use crate::corruption;

/// Appends a little-endian u32 to `dst`.
pub fn put_fixed32(dst: &mut Vec<u8>, value: u32) {
    dst.write_u32::<LittleEndian>(value).expect("vec write");
}

/// Appends a little-endian u64 to `dst`.
pub fn put_fixed64(dst: &mut Vec<u8>, value: u64) {
    dst.write_u64::<LittleEndian>(value).expect("vec write");
}

/// Decodes a little-endian u32 from the first four bytes of `src`.
pub fn decode_fixed32(src: &[u8]) -> u32 {
    LittleEndian::read_u32(src)
}

/// Decodes a little-endian u64 from the first eight bytes of `src`.
pub fn decode_fixed64(src: &[u8]) -> u64 {
    LittleEndian::read_u64(src)
}

/// Appends `u32 len | bytes` to `dst`.
pub fn put_length_prefixed(dst: &mut Vec<u8>, data: &[u8]) {
    put_fixed32(dst, data.len() as u32);
    dst.extend_from_slice(data);
}

/// Splits a length-prefixed slice off the front of `src`, returning the
/// slice and the remainder.
pub fn get_length_prefixed(src: &[u8]) -> Result<(&[u8], &[u8])> {
    if src.len() < 4 {
        return Err(corruption!("length prefix truncated"));
    }
    let len = decode_fixed32(src) as usize;
    if src.len() < 4 + len {
        return Err(corruption!("length-prefixed slice truncated: want {len} bytes"));
    }
    Ok((&src[4..4 + len], &src[4 + len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_roundtrip() {
        let mut buf = Vec::new();
        put_fixed32(&mut buf, 0xdead_beef);
        put_fixed64(&mut buf, 0x0123_4567_89ab_cdef);
        assert_eq!(buf.len(), 12);
        assert_eq!(decode_fixed32(&buf), 0xdead_beef);
        assert_eq!(decode_fixed64(&buf[4..]), 0x0123_4567_89ab_cdef);
        // Little-endian on the wire.
        assert_eq!(buf[0], 0xef);
        assert_eq!(buf[1], 0xbe);
    }

    #[test]
    fn test_length_prefixed_roundtrip() {
        let mut buf = Vec::new();
        put_length_prefixed(&mut buf, b"hello");
        put_length_prefixed(&mut buf, b"");
        put_length_prefixed(&mut buf, b"world");

        let (a, rest) = get_length_prefixed(&buf).unwrap();
        assert_eq!(a, b"hello");
        let (b, rest) = get_length_prefixed(rest).unwrap();
        assert_eq!(b, b"");
        let (c, rest) = get_length_prefixed(rest).unwrap();
        assert_eq!(c, b"world");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_length_prefixed_truncated() {
        let mut buf = Vec::new();
        put_length_prefixed(&mut buf, b"hello");
        assert!(get_length_prefixed(&buf[..3]).is_err());
        assert!(get_length_prefixed(&buf[..7]).is_err());
    }
}
