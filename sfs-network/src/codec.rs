//! Order-aware field codec.
//!
//! Every field is written and read individually in the sender's declared
//! byte order, so a receiver of the other endianness swaps each field as it
//! decodes it rather than swapping a raw struct image.

use bytes::{BufMut, Bytes, BytesMut};
use sfs_core::{Result, SFS_MAGIC, ShareError};

/// Byte order declared by a message's magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    #[inline]
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// Identify the sender's order from the first four header bytes.
    pub fn detect(magic: [u8; 4]) -> Result<Self> {
        if u32::from_le_bytes(magic) == SFS_MAGIC {
            Ok(Self::Little)
        } else if u32::from_be_bytes(magic) == SFS_MAGIC {
            Ok(Self::Big)
        } else {
            Err(ShareError::InvalidMagic(u32::from_le_bytes(magic)))
        }
    }

    /// True when this order differs from the local machine's.
    #[inline]
    #[must_use]
    pub fn is_swapped(self) -> bool {
        self != Self::native()
    }
}

pub struct WireWriter {
    buf: BytesMut,
    order: ByteOrder,
}

impl WireWriter {
    #[must_use]
    pub fn new(order: ByteOrder) -> Self {
        Self::with_capacity(order, 64)
    }

    #[must_use]
    pub fn with_capacity(order: ByteOrder, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            order,
        }
    }

    #[inline]
    #[must_use]
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn put_u16(&mut self, v: u16) {
        match self.order {
            ByteOrder::Little => self.buf.put_u16_le(v),
            ByteOrder::Big => self.buf.put_u16(v),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        match self.order {
            ByteOrder::Little => self.buf.put_u32_le(v),
            ByteOrder::Big => self.buf.put_u32(v),
        }
    }

    pub fn put_i32(&mut self, v: i32) {
        match self.order {
            ByteOrder::Little => self.buf.put_i32_le(v),
            ByteOrder::Big => self.buf.put_i32(v),
        }
    }

    pub fn put_u64(&mut self, v: u64) {
        match self.order {
            ByteOrder::Little => self.buf.put_u64_le(v),
            ByteOrder::Big => self.buf.put_u64(v),
        }
    }

    pub fn put_i64(&mut self, v: i64) {
        match self.order {
            ByteOrder::Little => self.buf.put_i64_le(v),
            ByteOrder::Big => self.buf.put_i64(v),
        }
    }

    /// Length-prefixed (u32) byte string.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.put_slice(v);
    }

    /// Length-prefixed (u16) UTF-8 string.
    pub fn put_str(&mut self, v: &str) {
        let len = v.len().min(usize::from(u16::MAX));
        self.put_u16(len as u16);
        self.buf.put_slice(&v.as_bytes()[..len]);
    }

    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> WireReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self { buf, pos: 0, order }
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ShareError::Protocol(format!(
                "Truncated payload: need {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let raw = self.take_array::<2>()?;
        Ok(match self.order {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let raw = self.take_array::<4>()?;
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        })
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let raw = self.take_array::<4>()?;
        Ok(match self.order {
            ByteOrder::Little => i32::from_le_bytes(raw),
            ByteOrder::Big => i32::from_be_bytes(raw),
        })
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let raw = self.take_array::<8>()?;
        Ok(match self.order {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        })
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let raw = self.take_array::<8>()?;
        Ok(match self.order {
            ByteOrder::Little => i64::from_le_bytes(raw),
            ByteOrder::Big => i64::from_be_bytes(raw),
        })
    }

    pub fn get_bytes(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = usize::from(self.get_u16()?);
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| ShareError::Protocol(format!("Invalid UTF-8 in name: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_order() {
        assert_eq!(
            ByteOrder::detect(SFS_MAGIC.to_le_bytes()).unwrap(),
            ByteOrder::Little
        );
        assert_eq!(
            ByteOrder::detect(SFS_MAGIC.to_be_bytes()).unwrap(),
            ByteOrder::Big
        );
        assert!(ByteOrder::detect([0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn test_big_endian_layout() {
        let mut w = WireWriter::new(ByteOrder::Big);
        w.put_u32(0x0a0b_0c0d);
        assert_eq!(&w.finish()[..], &[0x0a, 0x0b, 0x0c, 0x0d]);
    }

    #[test]
    fn test_fields_read_back_in_either_order() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let mut w = WireWriter::new(order);
            w.put_u16(0xbeef);
            w.put_i32(-7);
            w.put_u64(u64::MAX - 1);
            w.put_str("lost+found");
            w.put_bytes(b"acl");
            let bytes = w.finish();

            let mut r = WireReader::new(&bytes, order);
            assert_eq!(r.get_u16().unwrap(), 0xbeef);
            assert_eq!(r.get_i32().unwrap(), -7);
            assert_eq!(r.get_u64().unwrap(), u64::MAX - 1);
            assert_eq!(r.get_str().unwrap(), "lost+found");
            assert_eq!(&r.get_bytes().unwrap()[..], b"acl");
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut r = WireReader::new(&[1, 2], ByteOrder::Little);
        assert!(r.get_u32().is_err());
    }
}
