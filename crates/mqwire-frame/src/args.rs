//! Method argument primitives.
//!
//! All integers are big-endian. A shortstr is a `u8` length followed by
//! UTF-8 bytes; a longstr is a `u32` length followed by raw bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FrameError, Result};

pub(crate) fn take_u8(src: &mut &[u8], context: &'static str) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(FrameError::Malformed { context });
    }
    Ok(src.get_u8())
}

pub(crate) fn take_u16(src: &mut &[u8], context: &'static str) -> Result<u16> {
    if src.remaining() < 2 {
        return Err(FrameError::Malformed { context });
    }
    Ok(src.get_u16())
}

pub(crate) fn take_u32(src: &mut &[u8], context: &'static str) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(FrameError::Malformed { context });
    }
    Ok(src.get_u32())
}

pub(crate) fn take_u64(src: &mut &[u8], context: &'static str) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(FrameError::Malformed { context });
    }
    Ok(src.get_u64())
}

pub(crate) fn take_shortstr(src: &mut &[u8], context: &'static str) -> Result<String> {
    let len = take_u8(src, context)? as usize;
    if src.remaining() < len {
        return Err(FrameError::Malformed { context });
    }
    let raw = src[..len].to_vec();
    src.advance(len);
    String::from_utf8(raw).map_err(|_| FrameError::Malformed { context })
}

pub(crate) fn take_longstr(src: &mut &[u8], context: &'static str) -> Result<Vec<u8>> {
    let len = take_u32(src, context)? as usize;
    if src.remaining() < len {
        return Err(FrameError::Malformed { context });
    }
    let raw = src[..len].to_vec();
    src.advance(len);
    Ok(raw)
}

pub(crate) fn put_shortstr(dst: &mut BytesMut, value: &str) -> Result<()> {
    if value.len() > u8::MAX as usize {
        return Err(FrameError::Malformed {
            context: "shortstr longer than 255 bytes",
        });
    }
    dst.put_u8(value.len() as u8);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_longstr(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortstr_roundtrip() {
        let mut buf = BytesMut::new();
        put_shortstr(&mut buf, "hello").unwrap();

        let mut src: &[u8] = &buf;
        assert_eq!(take_shortstr(&mut src, "test").unwrap(), "hello");
        assert!(src.is_empty());
    }

    #[test]
    fn shortstr_rejects_oversized() {
        let mut buf = BytesMut::new();
        let long = "x".repeat(300);
        assert!(put_shortstr(&mut buf, &long).is_err());
    }

    #[test]
    fn longstr_roundtrip() {
        let mut buf = BytesMut::new();
        put_longstr(&mut buf, b"opaque bytes");

        let mut src: &[u8] = &buf;
        assert_eq!(take_longstr(&mut src, "test").unwrap(), b"opaque bytes");
    }

    #[test]
    fn truncated_input_is_malformed() {
        let mut src: &[u8] = &[5, b'a', b'b'];
        assert!(matches!(
            take_shortstr(&mut src, "test"),
            Err(FrameError::Malformed { .. })
        ));

        let mut src: &[u8] = &[0, 0];
        assert!(matches!(
            take_u32(&mut src, "test"),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn shortstr_rejects_invalid_utf8() {
        let mut src: &[u8] = &[2, 0xFF, 0xFE];
        assert!(matches!(
            take_shortstr(&mut src, "test"),
            Err(FrameError::Malformed { .. })
        ));
    }
}
