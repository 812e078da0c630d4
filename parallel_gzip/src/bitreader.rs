//! Bit-granular reader over a positional byte source.
//!
//! DEFLATE packs bits LSB-first within each byte and block boundaries land on
//! arbitrary bit positions, so everything downstream works in bit offsets.
//! The reader keeps a 64-bit cache refilled from an internal byte buffer;
//! up to [`MAX_READ_BITS`] bits can be fetched in a single call, which is what
//! lets the precode validator grab a whole dynamic-block prelude at once.

use crate::error::{Error, Result};
use crate::source::SharedSource;

/// Maximum bits a single `read`/`peek` can return. 57 = 64 - 7: after
/// discarding up to 7 alignment bits the cache still holds a full request.
pub const MAX_READ_BITS: u32 = 57;

/// Internal byte buffer size. Larger than the I/O block size so that refills
/// amortize, small enough to stay cache-friendly per worker thread.
const BUFFER_SIZE: usize = 128 * 1024;

pub struct BitReader {
    source: SharedSource,
    /// Window of the source: bytes `[buffer_offset, buffer_offset + buffer.len())`.
    buffer: Vec<u8>,
    buffer_offset: u64,
    /// Next byte in `buffer` to feed into the bit cache.
    buffer_pos: usize,
    /// Bit cache; the next stream bit is the least significant one.
    bits: u64,
    bit_count: u32,
}

impl BitReader {
    pub fn new(source: SharedSource) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            buffer_offset: 0,
            buffer_pos: 0,
            bits: 0,
            bit_count: 0,
        }
    }

    pub fn source(&self) -> &SharedSource {
        &self.source
    }

    /// Current position in bits from the start of the source.
    pub fn tell(&self) -> u64 {
        (self.buffer_offset + self.buffer_pos as u64) * 8 - self.bit_count as u64
    }

    /// Moves to an absolute bit offset. Seeking past the end is permitted;
    /// the subsequent read will fail.
    pub fn seek(&mut self, bit_offset: u64) -> Result<()> {
        let byte_offset = bit_offset / 8;
        let within = bit_offset % 8;

        self.bits = 0;
        self.bit_count = 0;
        if byte_offset >= self.buffer_offset
            && byte_offset < self.buffer_offset + self.buffer.len() as u64
        {
            self.buffer_pos = (byte_offset - self.buffer_offset) as usize;
        } else {
            self.buffer.clear();
            self.buffer_offset = byte_offset;
            self.buffer_pos = 0;
        }

        if within > 0 {
            self.read(within as u32)?;
        }
        Ok(())
    }

    /// Reads the next `count` bits (`count <= 57`), LSB-first.
    pub fn read(&mut self, count: u32) -> Result<u64> {
        debug_assert!(count <= MAX_READ_BITS);
        if !self.fill(count)? {
            return Err(Error::UnexpectedEof);
        }
        let result = self.bits & mask(count);
        self.bits >>= count;
        self.bit_count -= count;
        Ok(result)
    }

    /// Returns the next `count` bits without advancing, or `None` when fewer
    /// bits remain in the source. Callers that can cope with short input
    /// (Huffman fast paths near the end of the file) fall back to bitwise
    /// reads on `None`.
    pub fn peek(&mut self, count: u32) -> Result<Option<u64>> {
        debug_assert!(count <= MAX_READ_BITS);
        if !self.fill(count)? {
            return Ok(None);
        }
        Ok(Some(self.bits & mask(count)))
    }

    /// Consumes `count` bits previously obtained through [`Self::peek`].
    pub fn seek_after_peek(&mut self, count: u32) {
        debug_assert!(count <= self.bit_count);
        self.bits >>= count;
        self.bit_count -= count;
    }

    /// Reads whole bytes. Requires the current position to be byte-aligned
    /// (uncompressed DEFLATE blocks are, after their padding).
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        debug_assert!(self.tell() % 8 == 0);
        let mut done = 0;

        // Drain whatever the bit cache still holds.
        while self.bit_count >= 8 && done < out.len() {
            out[done] = (self.bits & 0xFF) as u8;
            self.bits >>= 8;
            self.bit_count -= 8;
            done += 1;
        }

        while done < out.len() {
            if self.buffer_pos == self.buffer.len() && !self.refill_buffer()? {
                return Err(Error::UnexpectedEof);
            }
            let available = self.buffer.len() - self.buffer_pos;
            let n = available.min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + n]);
            self.buffer_pos += n;
            done += n;
        }
        Ok(())
    }

    /// Ensures at least `count` bits are cached. Returns false if the source
    /// ended first; I/O failures propagate as errors.
    fn fill(&mut self, count: u32) -> Result<bool> {
        while self.bit_count < count {
            if self.buffer_pos == self.buffer.len() && !self.refill_buffer()? {
                return Ok(false);
            }
            let byte = self.buffer[self.buffer_pos];
            self.buffer_pos += 1;
            self.bits |= (byte as u64) << self.bit_count;
            self.bit_count += 8;
        }
        Ok(true)
    }

    /// Loads the next buffer window. Returns false at end of source.
    fn refill_buffer(&mut self) -> Result<bool> {
        self.buffer_offset += self.buffer.len() as u64;
        self.buffer_pos = 0;
        self.buffer.resize(BUFFER_SIZE, 0);
        let n = self
            .source
            .read_at(self.buffer_offset, &mut self.buffer)
            .map_err(Error::from)?;
        self.buffer.truncate(n);
        Ok(n > 0)
    }
}

#[inline]
fn mask(count: u32) -> u64 {
    if count == 0 {
        0
    } else {
        u64::MAX >> (64 - count)
    }
}
