#![forbid(unsafe_code)]
//! Encoding and buffer utilities shared across page layouts and log records.

pub mod ord {
    //! Order-preserving encoders for numeric keys.

    const U64_LEN: usize = core::mem::size_of::<u64>();
    const SIGN_BIT: u64 = 1 << 63;

    /// Big-endian encoding for lexicographic order preservation.
    pub fn put_u64_be(dst: &mut [u8], v: u64) {
        assert!(dst.len() >= U64_LEN, "destination too small");
        dst[..U64_LEN].copy_from_slice(&v.to_be_bytes());
    }

    /// Decodes a u64 from big-endian byte order.
    pub fn get_u64_be(src: &[u8]) -> u64 {
        super::be::u64_at(src, 0)
    }

    /// Encodes a signed i64 with order preservation (flip sign bit for sorting).
    pub fn put_i64_be(dst: &mut [u8], v: i64) {
        put_u64_be(dst, (v as u64) ^ SIGN_BIT);
    }

    /// Decodes a signed i64 with order preservation.
    pub fn get_i64_be(src: &[u8]) -> i64 {
        (get_u64_be(src) ^ SIGN_BIT) as i64
    }

    /// Returns the order-preserving key bytes for a u64.
    pub fn u64_key(v: u64) -> [u8; U64_LEN] {
        v.to_be_bytes()
    }
}

pub mod be {
    //! Fixed-offset big-endian field access for page layouts.
    //!
    //! Offsets are layout constants, so an out-of-range access is a layout bug
    //! and panics.

    /// Reads a big-endian u16 at `off`.
    #[inline]
    pub fn u16_at(src: &[u8], off: usize) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&src[off..off + 2]);
        u16::from_be_bytes(raw)
    }

    /// Reads a big-endian u32 at `off`.
    #[inline]
    pub fn u32_at(src: &[u8], off: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&src[off..off + 4]);
        u32::from_be_bytes(raw)
    }

    /// Reads a big-endian u64 at `off`.
    #[inline]
    pub fn u64_at(src: &[u8], off: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&src[off..off + 8]);
        u64::from_be_bytes(raw)
    }

    /// Writes a big-endian u16 at `off`.
    #[inline]
    pub fn put_u16(dst: &mut [u8], off: usize, v: u16) {
        dst[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u32 at `off`.
    #[inline]
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u64 at `off`.
    #[inline]
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }
}

pub mod buf {
    //! Slice-backed reader and growable writer for variable-length payloads.

    use core::fmt;

    use crate::types::{Result, StrataError};

    /// A cursor for reading bytes from a slice with offset tracking.
    ///
    /// Unlike the fixed-offset helpers every read is checked, since payloads
    /// come from disk and may be torn.
    pub struct Reader<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Reader<'a> {
        /// Creates a new reader starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(StrataError::Corruption("payload offset overflow"))?;
            if end > self.buf.len() {
                return Err(StrataError::Corruption("payload truncated"));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            Ok(super::be::u16_at(self.take(2)?, 0))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            Ok(super::be::u32_at(self.take(4)?, 0))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            Ok(super::be::u64_at(self.take(8)?, 0))
        }

        /// Reads a u32 length prefix followed by that many bytes.
        pub fn bytes(&mut self) -> Result<&'a [u8]> {
            let len = self.u32()? as usize;
            self.take(len)
        }

        /// Reads an optional length-prefixed byte string (flag byte first).
        pub fn opt_bytes(&mut self) -> Result<Option<&'a [u8]>> {
            match self.u8()? {
                0 => Ok(None),
                1 => self.bytes().map(Some),
                _ => Err(StrataError::Corruption("invalid option flag")),
            }
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Fails unless the whole buffer was consumed.
        pub fn finish(&self) -> Result<()> {
            if self.remaining() != 0 {
                return Err(StrataError::Corruption("trailing bytes in payload"));
            }
            Ok(())
        }
    }

    impl<'a> fmt::Debug for Reader<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Reader")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }

    /// Appends a u32 length prefix and the bytes.
    pub fn put_bytes(dst: &mut Vec<u8>, bytes: &[u8]) {
        dst.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        dst.extend_from_slice(bytes);
    }

    /// Appends an optional byte string with a presence flag.
    pub fn put_opt_bytes(dst: &mut Vec<u8>, bytes: Option<&[u8]>) {
        match bytes {
            Some(bytes) => {
                dst.push(1);
                put_bytes(dst, bytes);
            }
            None => dst.push(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{be, buf, ord};
    use crate::types::StrataError;
    use proptest::prelude::*;

    #[test]
    fn fixed_fields_roundtrip() {
        let mut page = [0u8; 32];
        be::put_u16(&mut page, 2, 0xBEEF);
        be::put_u32(&mut page, 4, 0xDEAD_BEEF);
        be::put_u64(&mut page, 8, u64::MAX - 7);
        assert_eq!(be::u16_at(&page, 2), 0xBEEF);
        assert_eq!(be::u32_at(&page, 4), 0xDEAD_BEEF);
        assert_eq!(be::u64_at(&page, 8), u64::MAX - 7);
    }

    #[test]
    fn reader_reports_truncation() {
        let mut payload = Vec::new();
        buf::put_bytes(&mut payload, b"hello");
        payload.truncate(payload.len() - 1);
        let mut reader = buf::Reader::new(&payload);
        assert!(matches!(reader.bytes(), Err(StrataError::Corruption(_))));
    }

    #[test]
    fn reader_decodes_optional_bytes() {
        let mut payload = Vec::new();
        buf::put_opt_bytes(&mut payload, Some(b"v"));
        buf::put_opt_bytes(&mut payload, None);
        let mut reader = buf::Reader::new(&payload);
        assert_eq!(reader.opt_bytes().unwrap(), Some(&b"v"[..]));
        assert_eq!(reader.opt_bytes().unwrap(), None);
        reader.finish().unwrap();
    }

    proptest! {
        #[test]
        fn order_preserving_i64_prop(xs in proptest::collection::vec(any::<i64>(), 1..64)) {
            let mut encoded: Vec<[u8; 8]> = xs
                .iter()
                .map(|&v| {
                    let mut buf = [0u8; 8];
                    ord::put_i64_be(&mut buf, v);
                    buf
                })
                .collect();
            encoded.sort();
            let decoded: Vec<i64> = encoded.iter().map(|buf| ord::get_i64_be(buf)).collect();
            let mut expected = xs.clone();
            expected.sort();
            prop_assert_eq!(decoded, expected);
        }
    }
}
