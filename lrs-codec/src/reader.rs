//! Checked fixed-endian reads and writes over a byte slice.
//!
//! `bytes::Buf` panics when the buffer runs short; wire parsing must fail
//! with [`Error::ErrShortBuffer`] instead, so the protocol crates read
//! through this cursor.

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub struct BytesReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BytesReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::ErrShortBuffer);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// RTMP message stream ids are the lone little-endian field on the wire.
    pub fn read_u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut v = [0u8; 8];
        v.copy_from_slice(b);
        Ok(u64::from_be_bytes(v))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_string(&mut self, n: usize) -> Result<String> {
        let b = self.take(n)?;
        Ok(String::from_utf8(b.to_vec())?)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }
}

/// Growable big-endian writer mirroring [`BytesReader`].
#[derive(Default)]
pub struct BytesWriter {
    buf: BytesMut,
}

impl BytesWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_u24(&mut self, v: u32) {
        self.buf.put_uint(v as u64, 3);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_u64(v.to_bits());
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.put_slice(b);
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_scalars() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a];
        let mut r = BytesReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16().unwrap(), 0x0203);
        assert_eq!(r.read_u24().unwrap(), 0x040506);
        assert_eq!(r.read_u32_le().unwrap(), 0x0a090807);
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn test_short_read_does_not_consume() {
        let data = [0x01, 0x02];
        let mut r = BytesReader::new(&data);
        assert_eq!(r.read_u32(), Err(Error::ErrShortBuffer));
        assert_eq!(r.remaining(), 2);
        assert_eq!(r.read_u16().unwrap(), 0x0102);
    }

    #[test]
    fn test_writer_round_trip() {
        let mut w = BytesWriter::new();
        w.write_u24(0xFFFFFF);
        w.write_u32_le(7);
        w.write_f64(1.5);
        let b = w.finish();
        let mut r = BytesReader::new(&b);
        assert_eq!(r.read_u24().unwrap(), 0xFFFFFF);
        assert_eq!(r.read_u32_le().unwrap(), 7);
        assert_eq!(r.read_f64().unwrap(), 1.5);
    }
}
