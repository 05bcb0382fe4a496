//! Self-describing binary framing used for every serialized entity.
//!
//! Every persisted blob (tree, commit, large-blob index, metadata records)
//! is produced by a [`Writer`] and parsed by a [`Reader`]. All integers are
//! little-endian. Each primitive is preceded by a one-byte tag so a reader
//! can validate the shape of what it is decoding instead of trusting the
//! writer blindly; a mismatched tag is treated as corruption, not a panic.

use crate::error::OriError;
use crate::error::OriResult;
use crate::hash::HashedId;

const TAG_U8: u8 = 0x01;
const TAG_U32: u8 = 0x02;
const TAG_U64: u8 = 0x03;
const TAG_HASH: u8 = 0x04;
const TAG_PSTR: u8 = 0x05;
const TAG_LPSTR: u8 = 0x06;

/// Appends tagged primitives to an in-memory buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(TAG_U8);
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.push(TAG_U32);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.push(TAG_U64);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_hash(&mut self, v: &HashedId) {
        self.buf.push(TAG_HASH);
        self.buf.extend_from_slice(v.as_bytes());
    }

    /// A short string, length-prefixed by a u16 (max 65535 bytes).
    pub fn write_pstr(&mut self, v: &str) {
        self.write_pstr_bytes(v.as_bytes());
    }

    /// Same framing as [`Self::write_pstr`] but for raw bytes that need not
    /// be valid UTF-8 (used to embed a nested typed-stream blob, e.g. a
    /// serialized [`crate::tree::AttrMap`], inside a pstr field).
    pub fn write_pstr_bytes(&mut self, v: &[u8]) {
        self.buf.push(TAG_PSTR);
        let len: u16 = v.len().try_into().expect("pstr longer than u16::MAX bytes");
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(v);
    }

    /// A long string/blob, length-prefixed by a u32.
    pub fn write_lpstr(&mut self, v: &[u8]) {
        self.buf.push(TAG_LPSTR);
        let len: u32 = v.len().try_into().expect("lpstr longer than u32::MAX bytes");
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(v);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Parses tagged primitives out of an in-memory buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> OriResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(OriError::corruption("typed stream truncated"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn expect_tag(&mut self, expected: u8) -> OriResult<()> {
        let tag = *self
            .take(1)?
            .first()
            .ok_or_else(|| OriError::corruption("typed stream truncated"))?;
        if tag != expected {
            return Err(OriError::corruption(format!(
                "typed stream tag mismatch: expected {expected:#04x}, found {tag:#04x}"
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> OriResult<u8> {
        self.expect_tag(TAG_U8)?;
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> OriResult<u32> {
        self.expect_tag(TAG_U32)?;
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> OriResult<u64> {
        self.expect_tag(TAG_U64)?;
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_hash(&mut self) -> OriResult<HashedId> {
        self.expect_tag(TAG_HASH)?;
        let bytes: [u8; crate::hash::HASH_LEN] = self.take(crate::hash::HASH_LEN)?.try_into().unwrap();
        Ok(HashedId::from_bytes(bytes))
    }

    pub fn read_pstr(&mut self) -> OriResult<String> {
        let bytes = self.read_pstr_bytes()?;
        String::from_utf8(bytes).map_err(|e| OriError::corruption(format!("invalid utf-8 in pstr: {e}")))
    }

    /// Same framing as [`Self::read_pstr`] but returns the raw bytes
    /// without requiring valid UTF-8.
    pub fn read_pstr_bytes(&mut self) -> OriResult<Vec<u8>> {
        self.expect_tag(TAG_PSTR)?;
        let len_bytes: [u8; 2] = self.take(2)?.try_into().unwrap();
        let len = u16::from_le_bytes(len_bytes) as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_lpstr(&mut self) -> OriResult<Vec<u8>> {
        self.expect_tag(TAG_LPSTR)?;
        let len_bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        let len = u32::from_le_bytes(len_bytes) as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_primitive() {
        let mut w = Writer::new();
        w.write_u8(7);
        w.write_u32(0xdead_beef);
        w.write_u64(0x0123_4567_89ab_cdef);
        let id = HashedId::of(b"x");
        w.write_hash(&id);
        w.write_pstr("hello");
        w.write_lpstr(b"a longer blob of bytes");
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(r.read_hash().unwrap(), id);
        assert_eq!(r.read_pstr().unwrap(), "hello");
        assert_eq!(r.read_lpstr().unwrap(), b"a longer blob of bytes");
        assert!(r.is_empty());
    }

    #[test]
    fn tag_mismatch_is_corruption() {
        let mut w = Writer::new();
        w.write_u32(1);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.read_u64(), Err(OriError::Corruption(_))));
    }

    #[test]
    fn truncated_stream_is_corruption() {
        let mut w = Writer::new();
        w.write_pstr("hello");
        let mut bytes = w.into_bytes();
        bytes.truncate(bytes.len() - 2);
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.read_pstr(), Err(OriError::Corruption(_))));
    }

    #[test]
    fn empty_string_round_trips() {
        let mut w = Writer::new();
        w.write_pstr("");
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_pstr().unwrap(), "");
    }
}
