//! Low-level read/write helpers shared by the token decoders and the
//! message encoders.
//!
//! Every reader reports a short buffer as [`ProtocolError::Incomplete`] so
//! callers can tell "wait for more bytes" apart from corrupt input.

use bytes::{Buf, BufMut, Bytes};

use crate::error::ProtocolError;

/// Read `len` raw bytes.
pub fn read_bytes(src: &mut impl Buf, len: usize) -> Result<Bytes, ProtocolError> {
    ProtocolError::ensure(src.remaining(), len)?;
    Ok(src.copy_to_bytes(len))
}

/// Read a `u8`.
pub fn read_u8(src: &mut impl Buf) -> Result<u8, ProtocolError> {
    ProtocolError::ensure(src.remaining(), 1)?;
    Ok(src.get_u8())
}

/// Read a little-endian `u16`.
pub fn read_u16_le(src: &mut impl Buf) -> Result<u16, ProtocolError> {
    ProtocolError::ensure(src.remaining(), 2)?;
    Ok(src.get_u16_le())
}

/// Read a little-endian `u32`.
pub fn read_u32_le(src: &mut impl Buf) -> Result<u32, ProtocolError> {
    ProtocolError::ensure(src.remaining(), 4)?;
    Ok(src.get_u32_le())
}

/// Read a little-endian `u64`.
pub fn read_u64_le(src: &mut impl Buf) -> Result<u64, ProtocolError> {
    ProtocolError::ensure(src.remaining(), 8)?;
    Ok(src.get_u64_le())
}

/// Read a length-prefixed UTF-16LE string.
///
/// The format is: 1-byte length (in characters) followed by UTF-16LE bytes.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    let len = read_u8(src)? as usize;
    read_utf16_string(src, len)
}

/// Read a length-prefixed UTF-16LE string with 2-byte length.
///
/// The format is: 2-byte length (in characters) followed by UTF-16LE bytes.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    let len = read_u16_le(src)? as usize;
    read_utf16_string(src, len)
}

/// Read a UTF-16LE string of specified character length.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Result<String, ProtocolError> {
    ProtocolError::ensure(src.remaining(), char_count * 2)?;

    let mut chars = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        chars.push(src.get_u16_le());
    }

    String::from_utf16(&chars).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Write a length-prefixed UTF-16LE string (1-byte length).
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) {
    let chars: Vec<u16> = s.encode_utf16().collect();
    let len = chars.len().min(255) as u8;
    dst.put_u8(len);
    for &c in &chars[..len as usize] {
        dst.put_u16_le(c);
    }
}

/// Write a length-prefixed UTF-16LE string (2-byte length).
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) {
    let chars: Vec<u16> = s.encode_utf16().collect();
    let len = chars.len().min(65535) as u16;
    dst.put_u16_le(len);
    for &c in &chars[..len as usize] {
        dst.put_u16_le(c);
    }
}

/// Write a UTF-16LE string without length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for c in s.encode_utf16() {
        dst.put_u16_le(c);
    }
}

/// Calculate the byte length of a UTF-16 encoded string.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_b_varchar_roundtrip() {
        let original = "Hello, 世界!";
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, original);

        let mut cursor = buf.freeze();
        assert_eq!(read_b_varchar(&mut cursor).unwrap(), original);
    }

    #[test]
    fn test_us_varchar_roundtrip() {
        let original = "column αβγ";
        let mut buf = BytesMut::new();
        write_us_varchar(&mut buf, original);

        let mut cursor = buf.freeze();
        assert_eq!(read_us_varchar(&mut cursor).unwrap(), original);
    }

    #[test]
    fn test_short_string_is_incomplete() {
        // Claims 3 characters, carries one.
        let mut cursor: &[u8] = &[0x03, b'a', 0x00];
        let err = read_b_varchar(&mut cursor).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Incomplete {
                needed: 6,
                available: 2
            }
        );
    }

    #[test]
    fn test_invalid_utf16_is_fatal() {
        // Lone low surrogate.
        let mut cursor: &[u8] = &[0x01, 0x00, 0xDC];
        let err = read_b_varchar(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::StringEncoding(_)));
    }

    #[test]
    fn test_fixed_width_readers() {
        let mut cursor: &[u8] = &[0x01, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00];
        assert_eq!(read_u8(&mut cursor).unwrap(), 1);
        assert_eq!(read_u16_le(&mut cursor).unwrap(), 2);
        assert_eq!(read_u32_le(&mut cursor).unwrap(), 3);
        assert!(read_u64_le(&mut cursor).unwrap_err().is_incomplete());
    }

    #[test]
    fn test_utf16_byte_len() {
        assert_eq!(utf16_byte_len("Hello"), 10);
        assert_eq!(utf16_byte_len("世界"), 4);
    }
}
