//! Chunk decoding: a contiguous run of DEFLATE blocks decoded speculatively
//! from a candidate bit offset.
//!
//! A chunk decoded *with* an initial window produces plain bytes; decoded
//! *without* one it produces 16-bit cells mixing bytes and marker symbols,
//! to be resolved once the predecessor's window exists. Either way the chunk
//! records every inner block boundary (the split points for subchunks) and
//! every gzip footer it crosses.

use crate::bitreader::BitReader;
use crate::deflate::{Block, WindowSymbol};
use crate::error::{Error, Result};
use crate::gzip::{self, FileKind, StreamFooter};
use crate::source::SharedSource;
use crate::window::{resolve_markers, UsedWindowSymbols};
use std::sync::atomic::{AtomicBool, Ordering};

/// A block entry point inside a chunk. `decoded_offset` is relative to the
/// chunk's first decoded byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBoundary {
    pub bit_offset: u64,
    pub decoded_offset: u64,
}

/// A gzip member footer crossed while decoding, with the decoded offset
/// (relative to the chunk) of the member's last byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub decoded_offset: u64,
    pub footer: StreamFooter,
}

/// Decoded chunk contents: bytes, or bytes-and-markers awaiting resolution.
pub enum ChunkPayload {
    Bytes(Vec<u8>),
    Markers(Vec<u16>),
}

impl ChunkPayload {
    pub fn len(&self) -> usize {
        match self {
            ChunkPayload::Bytes(data) => data.len(),
            ChunkPayload::Markers(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The unit of parallel work: decoded output of a block-aligned run of
/// compressed bits.
pub struct ChunkData {
    pub start_bits: u64,
    pub end_bits: u64,
    pub payload: ChunkPayload,
    /// Inner block boundaries, strictly between chunk start and end,
    /// strictly increasing.
    pub block_boundaries: Vec<BlockBoundary>,
    pub footers: Vec<ChunkFooter>,
    /// True when the chunk consumed the end of the final gzip member.
    pub ends_stream: bool,
}

/// Subchunk descriptor produced by splitting a chunk on block boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subchunk {
    pub bit_offset: u64,
    pub decoded_offset: u64,
    pub bit_size: u64,
    pub decoded_size: u64,
}

impl ChunkData {
    pub fn decoded_size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// True until the marker payload has been resolved against the
    /// predecessor window. Chunks in this state must never reach the
    /// consumer.
    pub fn needs_resolution(&self) -> bool {
        matches!(self.payload, ChunkPayload::Markers(_))
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            ChunkPayload::Bytes(data) => Some(data),
            ChunkPayload::Markers(_) => None,
        }
    }

    /// Resolves marker symbols against the predecessor window, recording
    /// which window positions were read. Already-resolved chunks pass
    /// through unchanged (the operation is idempotent).
    pub fn resolve(self, window: &[u8]) -> Result<(ChunkData, UsedWindowSymbols)> {
        let mut used = UsedWindowSymbols::new();
        let payload = match self.payload {
            ChunkPayload::Bytes(data) => ChunkPayload::Bytes(data),
            ChunkPayload::Markers(data) => {
                let mut bytes = Vec::new();
                resolve_markers(&data, window, &mut bytes, &mut used)?;
                ChunkPayload::Bytes(bytes)
            }
        };
        Ok((
            ChunkData {
                payload,
                ..self
            },
            used,
        ))
    }

    /// Splits the chunk into subchunks of roughly `target` decoded bytes.
    /// Cuts happen only on block boundaries: a boundary becomes a cut when
    /// keeping the next region would push the running subchunk past the
    /// target. Concatenating the subchunks reproduces the chunk exactly.
    pub fn subchunks(&self, target: u64) -> Vec<Subchunk> {
        let total = self.decoded_size();
        if total == 0 && self.block_boundaries.is_empty() {
            return Vec::new();
        }

        let mut result = Vec::new();
        let mut start_bits = self.start_bits;
        let mut start_decoded = 0u64;

        for (index, boundary) in self.block_boundaries.iter().enumerate() {
            if boundary.decoded_offset <= start_decoded || boundary.decoded_offset >= total {
                continue;
            }
            let next_stop = self
                .block_boundaries
                .get(index + 1)
                .map(|next| next.decoded_offset)
                .unwrap_or(total);
            if next_stop - start_decoded > target {
                result.push(Subchunk {
                    bit_offset: start_bits,
                    decoded_offset: start_decoded,
                    bit_size: boundary.bit_offset - start_bits,
                    decoded_size: boundary.decoded_offset - start_decoded,
                });
                start_bits = boundary.bit_offset;
                start_decoded = boundary.decoded_offset;
            }
        }

        result.push(Subchunk {
            bit_offset: start_bits,
            decoded_offset: start_decoded,
            bit_size: self.end_bits - start_bits,
            decoded_size: total - start_decoded,
        });
        result
    }
}

/// Knobs of a single chunk decode.
#[derive(Clone)]
pub struct ChunkConfig {
    /// Stop at the first block boundary once this many bytes are decoded.
    /// When a `stop_at_bits` offset is given this acts as a hard cap against
    /// degenerate compression ratios.
    pub target_decoded_size: u64,
    /// Framing around the DEFLATE stream(s).
    pub file_kind: FileKind,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_decoded_size: 4 * 1024 * 1024,
            file_kind: FileKind::Gzip,
        }
    }
}

/// Cancellation is polled at block boundaries and between decode slices of
/// this many bytes within a block.
const CANCEL_CHECK_INTERVAL: usize = 64 * 1024;

/// Decodes one chunk starting at `start_bits`.
///
/// With `initial_window` the decode is *committed*: back-references resolve
/// immediately and the payload is plain bytes. Without it the decode is
/// *speculative*: references into the unknown past produce marker symbols,
/// and structural errors merely disqualify the candidate offset.
pub fn decode_chunk(
    source: &SharedSource,
    start_bits: u64,
    stop_at_bits: Option<u64>,
    initial_window: Option<&[u8]>,
    decoded_size_hint: Option<u64>,
    config: &ChunkConfig,
    cancel: &AtomicBool,
) -> Result<ChunkData> {
    let mut reader = BitReader::new(source.clone());
    reader.seek(start_bits)?;

    match initial_window {
        Some(window) => {
            let mut block = Block::<u8>::new();
            block.set_initial_window(window);
            decode_loop(
                &mut block,
                &mut reader,
                start_bits,
                stop_at_bits,
                decoded_size_hint,
                config,
                cancel,
            )
            .map(|(data, boundaries, footers, end_bits, ends_stream)| ChunkData {
                start_bits,
                end_bits,
                payload: ChunkPayload::Bytes(data),
                block_boundaries: boundaries,
                footers,
                ends_stream,
            })
        }
        None => {
            let mut block = Block::<u16>::new();
            decode_loop(
                &mut block,
                &mut reader,
                start_bits,
                stop_at_bits,
                decoded_size_hint,
                config,
                cancel,
            )
            .map(|(data, boundaries, footers, end_bits, ends_stream)| ChunkData {
                start_bits,
                end_bits,
                payload: ChunkPayload::Markers(data),
                block_boundaries: boundaries,
                footers,
                ends_stream,
            })
        }
    }
}

type LoopResult<S> = (Vec<S>, Vec<BlockBoundary>, Vec<ChunkFooter>, u64, bool);

fn decode_loop<S: WindowSymbol>(
    block: &mut Block<S>,
    reader: &mut BitReader,
    start_bits: u64,
    stop_at_bits: Option<u64>,
    decoded_size_hint: Option<u64>,
    config: &ChunkConfig,
    cancel: &AtomicBool,
) -> Result<LoopResult<S>> {
    let reserve = decoded_size_hint
        .unwrap_or(config.target_decoded_size)
        .min(64 * 1024 * 1024) as usize;
    let mut out: Vec<S> = Vec::with_capacity(reserve);
    let mut boundaries = Vec::new();
    let mut footers = Vec::new();
    let mut ends_stream = false;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        block.read_header(reader, false)?;
        while !block.eob() {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            block.read(reader, CANCEL_CHECK_INTERVAL, &mut out)?;
        }

        if block.eos() {
            match config.file_kind {
                FileKind::RawDeflate => {
                    ends_stream = true;
                    break;
                }
                FileKind::Gzip | FileKind::Bgzf => {
                    let footer = gzip::read_footer(reader)?;
                    footers.push(ChunkFooter {
                        decoded_offset: out.len() as u64,
                        footer,
                    });
                    if reader.peek(8)?.is_none() {
                        ends_stream = true;
                        break;
                    }
                    gzip::read_header(reader)?;
                }
            }
        }

        // Preferred stop: the block boundary that coincides with the next
        // chunk's planned start. The decoded-size budget acts as the cap;
        // with a planned stop it only guards against degenerate ratios.
        let position = reader.tell();
        let budget_met = out.len() as u64 >= config.target_decoded_size;
        let planned_stop = stop_at_bits.is_some_and(|stop| position >= stop);
        if planned_stop || budget_met {
            break;
        }
        boundaries.push(BlockBoundary {
            bit_offset: position,
            decoded_offset: out.len() as u64,
        });
    }

    debug_assert!(reader.tell() > start_bits);
    Ok((out, boundaries, footers, reader.tell(), ends_stream))
}

/// Accelerated chunk decode through the zlib wrapper, usable when the
/// initial window is known *and* the chunk spans whole gzip members with a
/// byte-aligned start (BGZF records, index entries). The wrapper is fed
/// exactly the member bytes; when it has consumed them all without reporting
/// stream end, one trailing zero-byte read forces it to swallow the final
/// end-of-block symbol, which some inflaters only do when asked for more
/// output.
pub fn decode_chunk_with_zlib_wrapper(
    source: &SharedSource,
    start_bits: u64,
    end_bits: u64,
    decoded_size_hint: Option<u64>,
) -> Result<ChunkData> {
    if start_bits % 8 != 0 || end_bits % 8 != 0 || end_bits <= start_bits {
        return Err(Error::InvalidFormat(
            "zlib wrapper requires byte-aligned member ranges",
        ));
    }

    let mut reader = BitReader::new(source.clone());
    reader.seek(start_bits)?;

    let mut out: Vec<u8> = Vec::with_capacity(decoded_size_hint.unwrap_or(0) as usize);
    let mut boundaries = Vec::new();
    let mut footers = Vec::new();

    loop {
        // One gzip member per iteration; `reader` sits at its first block.
        let member_start_byte = reader.tell() / 8;
        let end_byte = end_bits / 8;
        let mut compressed = vec![0u8; (end_byte - member_start_byte) as usize];
        crate::source::read_exact_at(source.as_ref(), member_start_byte, &mut compressed)?;

        let mut inflate = flate2::Decompress::new(false);
        let mut status = flate2::Status::Ok;
        while status != flate2::Status::StreamEnd {
            out.reserve(64 * 1024);
            status = inflate
                .decompress_vec(
                    &compressed[inflate.total_in() as usize..],
                    &mut out,
                    flate2::FlushDecompress::None,
                )
                .map_err(|_| Error::InvalidDeflate(crate::error::DeflateError::InvalidHuffmanCode))?;
            if status == flate2::Status::StreamEnd {
                break;
            }
            if inflate.total_in() as usize == compressed.len() {
                // Trailing zero-byte read: forces consumption of the final
                // end-of-block symbol.
                out.reserve(1024);
                status = inflate
                    .decompress_vec(&[], &mut out, flate2::FlushDecompress::Finish)
                    .map_err(|_| {
                        Error::InvalidDeflate(crate::error::DeflateError::InvalidHuffmanCode)
                    })?;
                if status != flate2::Status::StreamEnd {
                    return Err(Error::UnexpectedEof);
                }
                break;
            }
        }

        // Position after the member's final block, then footer.
        let deflate_end_bits = (member_start_byte + inflate.total_in()) * 8;
        reader.seek(deflate_end_bits)?;
        let footer = gzip::read_footer(&mut reader)?;
        footers.push(ChunkFooter {
            decoded_offset: out.len() as u64,
            footer,
        });

        if reader.tell() >= end_bits {
            break;
        }
        gzip::read_header(&mut reader)?;
        boundaries.push(BlockBoundary {
            bit_offset: reader.tell(),
            decoded_offset: out.len() as u64,
        });
    }

    let ends_stream = match source.size() {
        Some(size) => reader.tell() >= size * 8,
        None => false,
    };

    Ok(ChunkData {
        start_bits,
        end_bits: reader.tell(),
        payload: ChunkPayload::Bytes(out),
        block_boundaries: boundaries,
        footers,
        ends_stream,
    })
}
