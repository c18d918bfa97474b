//! Bit-granular read/write cursor over an owned byte buffer.
//!
//! Bits are stored most-significant first: bit position 0 is the high bit of
//! byte 0. Multi-bit fields are written big-endian, so a 32-bit field written
//! at a byte boundary is identical to `u32::to_be_bytes`.
//!
//! The buffer tracks three positions, always ordered
//! `alloc_len >= len >= pos`:
//!
//! - `alloc_len` - capacity in bits (the backing `Vec` length times eight)
//! - `len` - bits that hold written data
//! - `pos` - the cursor used by both reads and writes

use std::fmt;

use thiserror::Error;

/// Smallest capacity allocated on first write.
const MIN_ALLOC_BITS: usize = 128;

/// Widest field accepted by [`BitBuffer::put_bits`] and [`BitBuffer::get_bits`].
pub const MAX_FIELD_BITS: u32 = 64;

/// Failures of bit buffer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitBufferError {
    /// Write attempted on a buffer constructed read-only.
    #[error("write to read-only bitbuffer")]
    ReadOnly,

    /// Field width outside `0..=64`.
    #[error("bit width {0} outside 0..=64")]
    InvalidWidth(u32),

    /// Read past the written length.
    #[error("read of {requested} bits with only {available} remaining")]
    Underflow { requested: usize, available: usize },

    /// Cursor moved past the written length.
    #[error("position {pos} after buffer end {len}")]
    OutOfRange { pos: usize, len: usize },
}

/// A packed bit cursor.
#[derive(Clone, Default)]
pub struct BitBuffer {
    buf: Vec<u8>,
    len: usize,
    pos: usize,
    read_only: bool,
}

impl BitBuffer {
    /// Create an empty, writable buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writable buffer holding `bytes`, cursor at the start.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let buf = bytes.into();
        let len = buf.len() * 8;
        Self {
            buf,
            len,
            pos: 0,
            read_only: false,
        }
    }

    /// Create a read-only buffer over a copy of `bytes`. Every write fails.
    pub fn from_bytes_ro(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            read_only: true,
            ..Self::from_bytes(bytes)
        }
    }

    /// Cursor position in bits.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Written length in bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity in bits.
    pub fn alloc_len(&self) -> usize {
        self.buf.len() * 8
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Bits between the cursor and the written length.
    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    /// The written bytes; a trailing partial byte is zero padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len.div_ceil(8)]
    }

    /// Consume the buffer, returning the written bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.buf.truncate(self.len.div_ceil(8));
        self.buf
    }

    /// Write the low `bits` bits of `value` at the cursor and advance it.
    ///
    /// Grows the backing storage by doubling when the write passes the
    /// current capacity.
    pub fn put_bits(&mut self, bits: u32, value: i64) -> Result<(), BitBufferError> {
        self.check_writable()?;
        check_width(bits)?;
        if bits == 0 {
            return Ok(());
        }

        let width = bits as usize;
        self.reserve(self.pos + width);

        let raw = value as u64;
        if self.pos % 8 == 0 && width % 8 == 0 {
            let start = self.pos / 8;
            let count = width / 8;
            for i in 0..count {
                let shift = (count - 1 - i) * 8;
                self.buf[start + i] = (raw >> shift) as u8;
            }
        } else {
            for i in (0..width).rev() {
                let bit = (raw >> i) & 1 == 1;
                self.set_bit(self.pos + (width - 1 - i), bit);
            }
        }

        self.advance_write(width);
        Ok(())
    }

    /// Write `bits` bits at `offset`, restoring the cursor afterwards.
    pub fn put_bits_at(&mut self, bits: u32, value: i64, offset: usize) -> Result<(), BitBufferError> {
        let previous = self.pos;
        self.goto(offset)?;
        self.put_bits(bits, value)?;
        self.goto(previous)
    }

    /// Read `bits` bits at the cursor and advance it.
    ///
    /// Fields narrower than 64 bits are zero-extended; a 64-bit field is
    /// returned as the raw two's-complement pattern.
    pub fn get_bits(&mut self, bits: u32) -> Result<i64, BitBufferError> {
        check_width(bits)?;
        let width = bits as usize;
        if width > self.remaining() {
            return Err(BitBufferError::Underflow {
                requested: width,
                available: self.remaining(),
            });
        }

        let mut raw: u64 = 0;
        if self.pos % 8 == 0 && width % 8 == 0 {
            let start = self.pos / 8;
            for byte in &self.buf[start..start + width / 8] {
                raw = (raw << 8) | u64::from(*byte);
            }
        } else {
            for i in 0..width {
                raw = (raw << 1) | u64::from(self.bit(self.pos + i));
            }
        }

        self.pos += width;
        Ok(raw as i64)
    }

    /// Write raw bytes at the cursor.
    pub fn put_data(&mut self, data: &[u8]) -> Result<(), BitBufferError> {
        self.check_writable()?;
        if self.pos % 8 != 0 {
            for byte in data {
                self.put_bits(8, i64::from(*byte))?;
            }
            return Ok(());
        }

        let width = data.len() * 8;
        self.reserve(self.pos + width);
        let start = self.pos / 8;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.advance_write(width);
        Ok(())
    }

    /// Read `len` raw bytes at the cursor.
    pub fn get_data(&mut self, len: usize) -> Result<Vec<u8>, BitBufferError> {
        let width = len.checked_mul(8).unwrap_or(usize::MAX);
        if width > self.remaining() {
            return Err(BitBufferError::Underflow {
                requested: width,
                available: self.remaining(),
            });
        }

        if self.pos % 8 == 0 {
            let start = self.pos / 8;
            let out = self.buf[start..start + len].to_vec();
            self.pos += width;
            return Ok(out);
        }

        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.get_bits(8)? as u8);
        }
        Ok(out)
    }

    /// Move the cursor to the next byte boundary.
    ///
    /// On a writable buffer, aligning past the end zero-pads the written
    /// length; a read-only buffer refuses instead.
    pub fn align(&mut self) -> Result<(), BitBufferError> {
        let aligned = (self.pos + 7) & !7;
        if aligned > self.len {
            if self.read_only {
                return Err(BitBufferError::OutOfRange {
                    pos: aligned,
                    len: self.len,
                });
            }
            self.reserve(aligned);
            self.len = aligned;
        }
        self.pos = aligned;
        Ok(())
    }

    /// Move the cursor to an absolute bit position within the written length.
    pub fn goto(&mut self, pos: usize) -> Result<(), BitBufferError> {
        if pos > self.len {
            return Err(BitBufferError::OutOfRange { pos, len: self.len });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Move the cursor to the end of the written data.
    pub fn end(&mut self) {
        self.pos = self.len;
    }

    fn check_writable(&self) -> Result<(), BitBufferError> {
        if self.read_only {
            Err(BitBufferError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn reserve(&mut self, needed_bits: usize) {
        let alloc = self.alloc_len();
        if needed_bits <= alloc {
            return;
        }
        let mut next = (alloc * 2).max(MIN_ALLOC_BITS);
        while next < needed_bits {
            next *= 2;
        }
        self.buf.resize(next.div_ceil(8), 0);
    }

    fn advance_write(&mut self, width: usize) {
        self.pos += width;
        if self.pos > self.len {
            self.len = self.pos;
        }
    }

    fn bit(&self, pos: usize) -> u8 {
        (self.buf[pos / 8] >> (7 - (pos % 8))) & 1
    }

    fn set_bit(&mut self, pos: usize, bit: bool) {
        let mask = 1u8 << (7 - (pos % 8));
        if bit {
            self.buf[pos / 8] |= mask;
        } else {
            self.buf[pos / 8] &= !mask;
        }
    }
}

fn check_width(bits: u32) -> Result<(), BitBufferError> {
    if bits > MAX_FIELD_BITS {
        Err(BitBufferError::InvalidWidth(bits))
    } else {
        Ok(())
    }
}

impl PartialEq for BitBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitBuffer")
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("alloc_len", &self.alloc_len())
            .field("read_only", &self.read_only)
            .finish()
    }
}
