//! Bounded byte access for the codec: a reading cursor over borrowed bytes and a minimal
//! writing sink.

use crate::prelude::*;

/// A bounded, position-tracking reader over a byte slice.
///
/// Every read either consumes exactly what was asked for or fails without moving the cursor.
#[derive(Copy, Clone, Debug)]
pub struct ByteCursor<'a> {
    raw: &'a [u8],
    pos: usize,
}
impl<'a> ByteCursor<'a> {
    #[inline]
    pub fn new(raw: &'a [u8]) -> ByteCursor<'a> {
        ByteCursor { raw, pos: 0 }
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.raw.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Get the remaining unread bytes.
    #[inline]
    pub fn unread(&self) -> &'a [u8] {
        &self.raw[self.pos..]
    }

    /// Look at the next byte without consuming it.
    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.raw.get(self.pos).copied()
    }

    /// Consume exactly `n` bytes.
    ///
    /// Fails with [`ErrorKind::TruncatedFile`](crate::ErrorKind::TruncatedFile) if fewer than
    /// `n` bytes remain.
    #[inline]
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self
            .unread()
            .split_checked(n)
            .ok_or(err_truncated!("not enough bytes left"))?;
        self.pos += n;
        Ok(bytes)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Read a big-endian integer.
    #[inline]
    pub fn read_int<T: IntRead>(&mut self) -> Result<T> {
        T::read(self)
    }

    /// Skip `n` bytes, failing like `read_bytes` when the input is too short.
    #[inline]
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }
}

pub(crate) trait SplitChecked: Sized {
    fn split_checked(&self, at: usize) -> Option<Self>;
}
impl<'a> SplitChecked for &'a [u8] {
    #[inline]
    fn split_checked(&self, at: usize) -> Option<&'a [u8]> {
        if at > self.len() {
            None
        } else {
            Some(&self[..at])
        }
    }
}

/// Destination for encoded bytes.
pub trait Write {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
}

impl Write for Vec<u8> {
    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.extend_from_slice(buf);
        Ok(())
    }
}

/// Counts bytes instead of storing them, to size chunks before encoding them.
pub(crate) struct WriteCounter(pub u64);
impl Write for WriteCounter {
    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.0 += buf.len() as u64;
        Ok(())
    }
}
