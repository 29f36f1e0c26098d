use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// A positioned read over a borrowed byte range.
///
/// All reads are bounds-checked and advance the position; running past the
/// end yields [Error::Truncated] instead of panicking, so a malformed image
/// can never take the process down. The position itself may be moved
/// anywhere (including past the end) with [seek](Cursor::seek) and
/// [skip](Cursor::skip) -- only reads validate it.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[inline]
    pub fn skip(&mut self, n: usize) {
        self.pos = self.pos.saturating_add(n);
    }

    #[inline]
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::Truncated(self.pos))?;
        let bytes = self.data.get(self.pos..end).ok_or(Error::Truncated(self.pos))?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Read a ULEB128 into a 64-bit word.
    pub fn uleb128(&mut self) -> Result<u64> {
        let mut res = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            let low = (byte & 0x7f) as u64;
            if shift >= 64 || low << shift >> shift != low {
                return Err(Error::MalformedLeb128(self.pos));
            }
            res |= low << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(res);
            }
        }
    }

    /// Read a SLEB128 into a 64-bit word.
    pub fn sleb128(&mut self) -> Result<i64> {
        let mut res = 0i64;
        let mut shift = 0u32;
        let mut byte;
        loop {
            byte = self.u8()?;
            if shift >= 64 {
                return Err(Error::MalformedLeb128(self.pos));
            }
            res |= (((byte & 0x7f) as u64) << shift) as i64;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        // sign extend negative numbers
        if byte & 0x40 != 0 && shift < 64 {
            res |= (u64::MAX << shift) as i64;
        }
        Ok(res)
    }
}
