//! Generic DEFLATE block finder.
//!
//! Works on arbitrary gzip streams by probing bit offsets for dynamic-Huffman
//! block headers. A 13-bit lookup table prunes most offsets in one step: it
//! maps the peeked bits to the distance to the next offset whose visible
//! prefix could still be a non-final dynamic block header (final bit clear,
//! BTYPE = 0b10, HLIT <= 29, HDIST <= 29). Surviving offsets go through the
//! precode validator and full Huffman construction via `read_header`, which
//! is selective enough that decoding candidates speculatively is worthwhile.
//!
//! Stored and fixed-Huffman blocks are not found by this finder; they are
//! reached by sequential decoding from the preceding candidate.

use crate::bitreader::BitReader;
use crate::deflate::Block;
use crate::error::Result;
use crate::gzip::{self, FileKind};
use crate::source::SharedSource;

/// Peeked bits per probe: 1 final + 2 type + 5 HLIT + 5 HDIST.
const CACHED_BITS: u32 = 13;

/// Could a dynamic-block header start at bit 0 of `bits`, given that only
/// `visible` bits are trustworthy?
const fn matches_prefix(bits: u32, visible: u32) -> bool {
    if visible >= 1 && bits & 1 != 0 {
        return false; // final block
    }
    if visible >= 2 && (bits >> 1) & 1 != 0 {
        return false; // BTYPE low bit
    }
    if visible >= 3 && (bits >> 2) & 1 != 1 {
        return false; // BTYPE high bit
    }
    // HLIT is bits 3..=7 LSB-first; 257 + HLIT <= 286 excludes 30 and 31,
    // i.e. the four high bits must not all be set.
    if visible >= 8 && (bits >> 4) & 0xF == 0xF {
        return false;
    }
    // Same bound for HDIST in bits 8..=12: 1 + HDIST <= 30.
    if visible >= 13 && (bits >> 9) & 0xF == 0xF {
        return false;
    }
    true
}

const fn build_skip_lut() -> [u8; 1 << CACHED_BITS] {
    let mut lut = [0u8; 1 << CACHED_BITS];
    let mut bits = 0usize;
    while bits < lut.len() {
        let mut skip = 0u8;
        while skip < CACHED_BITS as u8 {
            if matches_prefix((bits >> skip) as u32, CACHED_BITS - skip as u32) {
                break;
            }
            skip += 1;
        }
        lut[bits] = skip;
        bits += 1;
    }
    lut
}

/// Distance in bits to the next offset worth probing; 0 means "probe here".
static NEXT_CANDIDATE_LUT: [u8; 1 << CACHED_BITS] = build_skip_lut();

pub struct DynamicFinder {
    scan: BitReader,
    probe: BitReader,
    /// Reused across probes; `read_header` rebuilds its tables each time.
    block: Block<u16>,
    /// The post-header offset of the first block, emitted before scanning.
    first_candidate: Option<u64>,
    /// Next bit offset the scan position corresponds to.
    offset: u64,
    exhausted: bool,
}

impl DynamicFinder {
    pub fn new(source: SharedSource, kind: FileKind) -> Result<Self> {
        let mut scan = BitReader::new(source.clone());
        let first = match kind {
            FileKind::RawDeflate => 0,
            FileKind::Gzip | FileKind::Bgzf => {
                gzip::read_header(&mut scan)?;
                scan.tell()
            }
        };
        scan.seek(first + 1)?;
        Ok(Self {
            scan,
            probe: BitReader::new(source),
            block: Block::new(),
            first_candidate: Some(first),
            offset: first + 1,
            exhausted: false,
        })
    }

    pub fn next(&mut self) -> Result<Option<u64>> {
        if let Some(first) = self.first_candidate.take() {
            return Ok(Some(first));
        }

        while !self.exhausted {
            let peeked = match self.scan.peek(CACHED_BITS)? {
                Some(bits) => bits,
                None => {
                    // Fewer than 13 bits left: no block fits behind them.
                    self.exhausted = true;
                    break;
                }
            };

            let skip = NEXT_CANDIDATE_LUT[peeked as usize] as u32;
            if skip > 0 {
                self.scan.seek_after_peek(skip);
                self.offset += skip as u64;
                continue;
            }

            let candidate = self.offset;
            self.scan.seek_after_peek(1);
            self.offset += 1;

            // Full verification: precode validation plus construction of
            // both Huffman tables. Rejections are expected and local.
            self.probe.seek(candidate)?;
            match self.block.read_header(&mut self.probe, true) {
                Ok(()) => return Ok(Some(candidate)),
                Err(error) if error.is_speculation_failure() => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::test_support::{base64_bytes, gzip_compress};
    use std::sync::Arc;

    #[test]
    fn skip_lut_spot_checks() {
        // All-zero bits: final bit clear, BTYPE bits demand 0b10, so bit 2
        // must be 1; zero fails at visible>=3 but a 1-bit shift could still
        // match once fewer bits are visible... the first offset where the
        // prefix check passes is what the LUT stores.
        assert!(matches_prefix(0b100, 13 - 10));
        assert_eq!(NEXT_CANDIDATE_LUT[0b0_0000_0000_0100], 0);
        // Final bit set: shift by one.
        assert_ne!(NEXT_CANDIDATE_LUT[0b0_0000_0000_0101], 0);
        // HLIT = 31 (bits 3..=7 all ones) is filtered.
        assert_ne!(NEXT_CANDIDATE_LUT[0b0_0000_1111_1100], 0);
        // HLIT = 29 passes.
        assert_eq!(NEXT_CANDIDATE_LUT[0b0_0000_1110_1100], 0);
        // HDIST = 30 (binary 11110, bits 9..=12 set) is filtered.
        assert_ne!(NEXT_CANDIDATE_LUT[0b1_1110_0000_0100], 0);
    }

    #[test]
    fn finds_the_first_block_behind_the_header() {
        let compressed = gzip_compress(&base64_bytes(100_000, 1));
        let source = Arc::new(MemorySource::new(compressed.clone()));
        let mut finder = DynamicFinder::new(source, FileKind::Gzip).unwrap();

        // First candidate is the header end; flate2 writes a 10-byte header.
        assert_eq!(finder.next().unwrap(), Some(80));
    }

    #[test]
    fn candidates_are_strictly_increasing_and_cover_real_blocks() {
        // Large base64 data compresses into several dynamic blocks.
        let compressed = gzip_compress(&base64_bytes(300_000, 7));
        let source = Arc::new(MemorySource::new(compressed.clone()));
        let mut finder = DynamicFinder::new(source, FileKind::Gzip).unwrap();

        let mut offsets = Vec::new();
        while let Some(offset) = finder.next().unwrap() {
            offsets.push(offset);
        }
        assert!(offsets.len() >= 2, "expected several block candidates");
        assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));

        // Every candidate must decode as a valid dynamic block header.
        let source = Arc::new(MemorySource::new(compressed));
        let mut probe = BitReader::new(source);
        let mut block = Block::<u16>::new();
        for &offset in &offsets[1..] {
            probe.seek(offset).unwrap();
            block.read_header(&mut probe, false).unwrap();
        }
    }
}
