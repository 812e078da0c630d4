//! DEFLATE block decoder (RFC 1951).
//!
//! Invalid data is the *common* case here: the block finder probes candidate
//! bit offsets that are mostly garbage, so every malformed construct returns
//! an error value instead of panicking, and allocations are reused across
//! blocks.
//!
//! The decoder is generic over its window symbol:
//! - [`Block<u8>`] decodes with a known (or empty) initial window and emits
//!   plain bytes,
//! - [`Block<u16>`] decodes *without* an initial window. The 32 KiB that
//!   would precede the chunk are pre-filled with marker values
//!   `MARKER_BASE + k`, so back-references into the unknown region emit
//!   markers that the resolver later replaces with real bytes.

use crate::bitreader::BitReader;
use crate::error::{DeflateError, Result};
use crate::huffman::{CanonicalCode, DistanceTable, LitLenTable};
use crate::precode;
use std::sync::LazyLock;

/// DEFLATE back-references reach at most 32 KiB into the past.
pub const MAX_WINDOW_SIZE: usize = 32 * 1024;
/// Longest back-reference run.
pub const MAX_RUN_LENGTH: usize = 258;

/// Marker values start here: `MARKER_BASE + k` stands for byte `k` of the
/// unknown initial window, `k` counting from its oldest byte.
pub const MARKER_BASE: u16 = 256;

const MAX_LITLEN_SYMBOLS: usize = 286;
const MAX_DISTANCE_SYMBOLS: usize = 30;

/// Order in which the precode transmits code lengths for its 19 symbols.
const PRECODE_ALPHABET_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    Uncompressed,
    FixedHuffman,
    DynamicHuffman,
}

/// The fixed literal/length code of RFC 1951 §3.2.6, built once per process.
static FIXED_LITLEN: LazyLock<LitLenTable> = LazyLock::new(|| {
    let mut lengths = vec![8u8; 288];
    lengths[144..256].fill(9);
    lengths[256..280].fill(7);
    LitLenTable::from_lengths(&lengths).expect("fixed Huffman code is canonical")
});

/// Window cell type: `u8` for normal decoding, `u16` for marker decoding.
pub trait WindowSymbol: Copy + Default + Send + 'static {
    /// Ring size. The marker ring holds the 32 Ki marker cells plus 32 Ki of
    /// fresh output; the byte ring additionally fits a whole stored block
    /// without wrapping mid-copy.
    const RING_SIZE: usize;
    /// Decoded bytes the pre-filled ring represents. The marker ring counts
    /// as a full virtual window so distance checks pass uniformly.
    const INITIAL_DECODED: u64;

    fn from_byte(byte: u8) -> Self;
    fn fill_initial(ring: &mut [Self]);
}

impl WindowSymbol for u8 {
    const RING_SIZE: usize = 4 * MAX_WINDOW_SIZE;
    const INITIAL_DECODED: u64 = 0;

    fn from_byte(byte: u8) -> Self {
        byte
    }

    fn fill_initial(_ring: &mut [Self]) {}
}

impl WindowSymbol for u16 {
    const RING_SIZE: usize = 2 * MAX_WINDOW_SIZE;
    const INITIAL_DECODED: u64 = MAX_WINDOW_SIZE as u64;

    fn from_byte(byte: u8) -> Self {
        byte as u16
    }

    fn fill_initial(ring: &mut [Self]) {
        let start = Self::RING_SIZE - MAX_WINDOW_SIZE;
        for k in 0..MAX_WINDOW_SIZE {
            ring[start + k] = MARKER_BASE + k as u16;
        }
    }
}

/// Decoder state for one DEFLATE block at a time; reused across the blocks of
/// a chunk to keep the window and table allocations warm.
pub struct Block<S: WindowSymbol> {
    is_last: bool,
    compression_type: CompressionType,
    uncompressed_size: u16,
    at_end_of_block: bool,

    window: Box<[S]>,
    /// Next write index into `window`; everything before it (modulo the ring)
    /// is decoded history.
    window_position: usize,
    /// Total symbols ever appended, including the virtual initial window.
    /// Back-references must not reach further back than this.
    decoded: u64,

    litlen: Option<LitLenTable>,
    distance: Option<DistanceTable>,
    /// Second symbol cached by the double-literal lookup.
    pending: u16,
    /// Scratch for the dynamic header's code-length sequences.
    lengths: Vec<u8>,
}

impl<S: WindowSymbol> Default for Block<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: WindowSymbol> Block<S> {
    pub fn new() -> Self {
        let mut window = vec![S::default(); S::RING_SIZE].into_boxed_slice();
        S::fill_initial(&mut window);
        Self {
            is_last: false,
            compression_type: CompressionType::Uncompressed,
            uncompressed_size: 0,
            at_end_of_block: true,
            window,
            window_position: 0,
            decoded: S::INITIAL_DECODED,
            litlen: None,
            distance: None,
            pending: LitLenTable::fresh_pending(),
            lengths: Vec::new(),
        }
    }

    pub fn eob(&self) -> bool {
        self.at_end_of_block
    }

    pub fn eos(&self) -> bool {
        self.at_end_of_block && self.is_last
    }

    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    /// Reads and validates a block header, leaving the reader at the start
    /// of the body. With `treat_last_as_error`, final blocks are rejected
    /// up front: candidate probing ignores them, which filters half of all
    /// random offsets before any Huffman work.
    pub fn read_header(&mut self, reader: &mut BitReader, treat_last_as_error: bool) -> Result<()> {
        self.is_last = reader.read(1)? == 1;
        if treat_last_as_error && self.is_last {
            return Err(DeflateError::UnexpectedFinalBlock.into());
        }

        match reader.read(2)? {
            0b00 => {
                self.compression_type = CompressionType::Uncompressed;
                let padding_bits = (8 - reader.tell() % 8) % 8;
                if padding_bits > 0 && reader.read(padding_bits as u32)? != 0 {
                    return Err(DeflateError::NonZeroPadding.into());
                }
                let size = reader.read(16)? as u16;
                let negated = reader.read(16)? as u16;
                if size != !negated {
                    return Err(DeflateError::LengthChecksumMismatch.into());
                }
                self.uncompressed_size = size;
            }
            0b01 => self.compression_type = CompressionType::FixedHuffman,
            0b10 => {
                self.compression_type = CompressionType::DynamicHuffman;
                self.read_dynamic_header(reader)?;
            }
            _ => return Err(DeflateError::ReservedBlockType.into()),
        }

        self.at_end_of_block = false;
        self.pending = LitLenTable::fresh_pending();
        Ok(())
    }

    /// Parses HLIT/HDIST/HCLEN, the precode, and both code-length sequences,
    /// then builds the two Huffman tables.
    fn read_dynamic_header(&mut self, reader: &mut BitReader) -> Result<()> {
        let literal_count = 257 + reader.read(5)? as usize;
        if literal_count > MAX_LITLEN_SYMBOLS {
            return Err(DeflateError::ExceededLiteralRange.into());
        }
        let distance_count = 1 + reader.read(5)? as usize;
        if distance_count > MAX_DISTANCE_SYMBOLS {
            return Err(DeflateError::ExceededDistanceRange.into());
        }
        let precode_count = reader.read(4)?;

        // Histogram pre-check over the whole precode in one peek. Close to
        // the end of the input the peek may come up short; the canonical
        // builder below then does the full validation on its own.
        if let Some(precode_bits) = reader.peek(precode::MAX_PRECODE_COUNT * precode::PRECODE_BITS)?
        {
            precode::check_precode(precode_count, precode_bits)?;
        }

        let mut precode_lengths = [0u8; 19];
        for i in 0..(4 + precode_count as usize) {
            precode_lengths[PRECODE_ALPHABET_ORDER[i]] = reader.read(precode::PRECODE_BITS)? as u8;
        }
        let precode = CanonicalCode::from_lengths(&precode_lengths)?;
        if precode.is_empty() {
            return Err(DeflateError::EmptyAlphabet.into());
        }

        // Code lengths for both alphabets form one sequence with run-length
        // instructions 16/17/18.
        let total = literal_count + distance_count;
        self.lengths.clear();
        self.lengths.resize(total, 0);
        let mut i = 0;
        while i < total {
            let code = precode.decode(reader)?;
            match code {
                0..=15 => {
                    self.lengths[i] = code as u8;
                    i += 1;
                }
                16 => {
                    if i == 0 {
                        return Err(DeflateError::InvalidCodeLengthRepeat.into());
                    }
                    let previous = self.lengths[i - 1];
                    let repeat = 3 + reader.read(2)? as usize;
                    if i + repeat > total {
                        return Err(DeflateError::ExceededLiteralRange.into());
                    }
                    self.lengths[i..i + repeat].fill(previous);
                    i += repeat;
                }
                17 => i += 3 + reader.read(3)? as usize,
                18 => i += 11 + reader.read(7)? as usize,
                _ => return Err(DeflateError::InvalidHuffmanCode.into()),
            }
            if i > total {
                return Err(DeflateError::ExceededLiteralRange.into());
            }
        }

        self.distance = Some(DistanceTable::from_lengths(
            &self.lengths[literal_count..total],
        )?);
        self.litlen = Some(LitLenTable::from_lengths(&self.lengths[..literal_count])?);
        Ok(())
    }

    /// Decodes up to `max` symbols of the current block body into `out`,
    /// stopping exactly at the end of the block. Returns the number of
    /// symbols appended; check [`Self::eob`] rather than the count to detect
    /// the block end. Uncompressed blocks may overshoot `max` (they are
    /// emitted in one piece, at most 64 KiB).
    pub fn read(&mut self, reader: &mut BitReader, max: usize, out: &mut Vec<S>) -> Result<usize> {
        if self.at_end_of_block {
            return Ok(0);
        }

        if self.compression_type == CompressionType::Uncompressed {
            return self.read_stored(reader, out);
        }

        let litlen = match self.compression_type {
            CompressionType::FixedHuffman => &*FIXED_LITLEN,
            CompressionType::DynamicHuffman => self
                .litlen
                .as_ref()
                .expect("dynamic header read before body"),
            CompressionType::Uncompressed => unreachable!(),
        };
        let fixed_distance = self.compression_type == CompressionType::FixedHuffman;

        // Cap so that one maximal run cannot lap the ring within this call.
        let max = max.min(self.window.len() - MAX_RUN_LENGTH);
        let mut produced = 0usize;

        while produced < max {
            let symbol = litlen.decode(reader, &mut self.pending)?;

            if symbol < 256 {
                let value = S::from_byte(symbol as u8);
                self.window[self.window_position] = value;
                self.window_position = (self.window_position + 1) % self.window.len();
                out.push(value);
                produced += 1;
                continue;
            }
            if symbol == 256 {
                self.at_end_of_block = true;
                break;
            }
            if symbol > 285 {
                return Err(DeflateError::InvalidHuffmanCode.into());
            }

            let length = read_length(symbol, reader)?;
            let distance = if fixed_distance {
                let raw = (reader.read(5)? as u8).reverse_bits() >> 3;
                decode_distance(raw as u16, reader)?
            } else {
                let symbol = self
                    .distance
                    .as_ref()
                    .expect("dynamic header read before body")
                    .decode(reader)?;
                decode_distance(symbol, reader)?
            };

            if distance as u64 > self.decoded + produced as u64 {
                return Err(DeflateError::ExceededWindowRange.into());
            }

            // Byte-at-a-time copy: self-overlapping references (distance <
            // length) must see the bytes appended earlier in the same run.
            let ring = self.window.len();
            let mut from = (self.window_position + ring - distance as usize) % ring;
            for _ in 0..length {
                let value = self.window[from];
                from = (from + 1) % ring;
                self.window[self.window_position] = value;
                self.window_position = (self.window_position + 1) % ring;
                out.push(value);
            }
            produced += length as usize;
        }

        self.decoded += produced as u64;
        Ok(produced)
    }

    /// Copies an uncompressed block body. The bit reader is byte-aligned
    /// here because the header consumed the padding.
    fn read_stored(&mut self, reader: &mut BitReader, out: &mut Vec<S>) -> Result<usize> {
        let size = self.uncompressed_size as usize;
        let mut copied = 0usize;
        let mut chunk = [0u8; 4096];
        while copied < size {
            let n = chunk.len().min(size - copied);
            reader.read_bytes(&mut chunk[..n])?;
            for &byte in &chunk[..n] {
                let value = S::from_byte(byte);
                self.window[self.window_position] = value;
                self.window_position = (self.window_position + 1) % self.window.len();
                out.push(value);
            }
            copied += n;
        }
        self.at_end_of_block = true;
        self.decoded += size as u64;
        Ok(size)
    }
}

impl Block<u8> {
    /// Installs the final bytes preceding this chunk, enabling
    /// back-references into them. `window` holds at most 32 KiB, oldest
    /// first. Must be called before any block is decoded.
    pub fn set_initial_window(&mut self, window: &[u8]) {
        debug_assert!(window.len() <= MAX_WINDOW_SIZE);
        debug_assert_eq!(self.decoded, 0);
        self.window[..window.len()].copy_from_slice(window);
        self.window_position = window.len();
        self.decoded = window.len() as u64;
    }
}

/// Length for litlen symbols 257..=285, extra bits included.
fn read_length(symbol: u16, reader: &mut BitReader) -> Result<u16> {
    Ok(match symbol {
        257..=264 => symbol - 254,
        265..=284 => {
            let index = symbol - 261;
            let extra_bits = (index / 4) as u32;
            let base = 3 + (1 << (extra_bits + 2)) + ((index % 4) << extra_bits);
            base + reader.read(extra_bits)? as u16
        }
        285 => 258,
        _ => return Err(DeflateError::InvalidHuffmanCode.into()),
    })
}

/// Distance for distance symbols 0..=29, extra bits included.
fn decode_distance(symbol: u16, reader: &mut BitReader) -> Result<u16> {
    match symbol {
        0..=3 => Ok(symbol + 1),
        4..=29 => {
            let extra_bits = ((symbol - 2) / 2) as u32;
            let base = 1 + (1u16 << (extra_bits + 1)) + ((symbol % 2) << extra_bits);
            Ok(base + reader.read(extra_bits)? as u16)
        }
        _ => Err(DeflateError::ExceededDistanceRange.into()),
    }
}
