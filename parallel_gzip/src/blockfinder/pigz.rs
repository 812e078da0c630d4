//! pigz flush-marker block finder.
//!
//! pigz terminates each parallel compression chunk with an empty stored
//! block: bits `000` (non-final, stored), zero padding to the byte boundary,
//! then `LEN`/`NLEN` as `00 00 FF FF`. That 35-bit signature always leaves
//! the four magic bytes byte-aligned, so the scan is a plain substring search
//! over the raw file, verified by checking that the three header bits and
//! padding in the preceding byte are zero. The published candidate is the bit
//! offset right after the marker, where the next block starts.
//!
//! Buffers are scanned in parallel slices with a small overlap so markers
//! straddling any boundary are still found.

use crate::bitreader::BitReader;
use crate::error::Result;
use crate::gzip;
use crate::source::SharedSource;
use memchr::memmem;
use rayon::prelude::*;
use std::collections::VecDeque;

/// `LEN`/`NLEN` of an empty stored block.
const MAGIC: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Bytes kept between scan rounds so signatures crossing a read boundary are
/// seen whole (needle plus the verification byte, rounded up).
const CARRY: usize = 7;

/// Read size per scan round.
const DEFAULT_SCAN_BUFFER: usize = 4 * 1024 * 1024;
/// Parallel slice granularity within one round.
const SCAN_SLICE: usize = 1024 * 1024;

pub struct PigzFinder {
    source: SharedSource,
    file_size: Option<u64>,
    scan_buffer_size: usize,
    /// Next byte offset to read from the source.
    file_position: u64,
    /// Tail of the previous round, absolute offset of its first byte.
    carry: Vec<u8>,
    carry_base: u64,
    /// Candidates found but not yet returned.
    queue: VecDeque<u64>,
    /// Post-header offset of the first block; emitted before any marker.
    first_candidate: Option<u64>,
    /// Byte offset of the first block, for filtering markers inside the
    /// header region.
    first_block_byte: u64,
    exhausted: bool,
}

impl PigzFinder {
    pub fn new(source: SharedSource) -> Result<Self> {
        Self::with_buffer_size(source, DEFAULT_SCAN_BUFFER)
    }

    /// `scan_buffer_size` is exposed for boundary tests.
    pub(crate) fn with_buffer_size(source: SharedSource, scan_buffer_size: usize) -> Result<Self> {
        let mut reader = BitReader::new(source.clone());
        gzip::read_header(&mut reader)?;
        let first = reader.tell();
        debug_assert_eq!(first % 8, 0);
        let file_size = source.size();
        Ok(Self {
            source,
            file_size,
            scan_buffer_size,
            file_position: 0,
            carry: Vec::new(),
            carry_base: 0,
            queue: VecDeque::new(),
            first_candidate: Some(first),
            first_block_byte: first / 8,
            exhausted: false,
        })
    }

    pub fn next(&mut self) -> Result<Option<u64>> {
        if let Some(first) = self.first_candidate.take() {
            return Ok(Some(first));
        }
        loop {
            if let Some(candidate) = self.queue.pop_front() {
                return Ok(Some(candidate));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.scan_round()?;
        }
    }

    /// Reads the next buffer's worth and scans carry + fresh bytes.
    fn scan_round(&mut self) -> Result<()> {
        let mut fresh = vec![0u8; self.scan_buffer_size];
        let mut filled = 0usize;
        while filled < fresh.len() {
            let n = self
                .source
                .read_at(self.file_position + filled as u64, &mut fresh[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        fresh.truncate(filled);
        if fresh.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        let mut window = std::mem::take(&mut self.carry);
        let window_base = if window.is_empty() {
            self.file_position
        } else {
            self.carry_base
        };
        let carry_length = window.len();
        window.extend_from_slice(&fresh);
        self.file_position += filled as u64;

        let positions = scan_window(&window);
        for position in positions {
            // Skip matches fully inside the carried bytes (already emitted)
            // and matches without the verification byte in front.
            if position + MAGIC.len() <= carry_length || position == 0 {
                continue;
            }
            // The three block-header bits and the padding before LEN must
            // all be zero somewhere in the preceding byte; the top three
            // bits being zero is the necessary condition for any alignment.
            if window[position - 1] & 0b1110_0000 != 0 {
                continue;
            }
            let marker_end = window_base + (position + MAGIC.len()) as u64;
            if marker_end <= self.first_block_byte {
                continue;
            }
            // A marker at the very end of the file precedes no block.
            if let Some(size) = self.file_size {
                if marker_end >= size {
                    continue;
                }
            }
            self.queue.push_back(marker_end * 8);
        }

        let keep = window.len().min(CARRY);
        self.carry_base = window_base + (window.len() - keep) as u64;
        self.carry = window[window.len() - keep..].to_vec();
        if filled < self.scan_buffer_size {
            // Short read: the source is drained.
            self.exhausted = true;
        }
        Ok(())
    }
}

/// All magic positions in `window`, ascending. Large windows are scanned in
/// parallel slices with overlap; each match is attributed to the slice its
/// first byte falls into.
fn scan_window(window: &[u8]) -> Vec<usize> {
    let finder = memmem::Finder::new(&MAGIC);
    if window.len() <= SCAN_SLICE {
        return finder.find_iter(window).collect();
    }

    let slice_count = window.len().div_ceil(SCAN_SLICE);
    let per_slice: Vec<Vec<usize>> = (0..slice_count)
        .into_par_iter()
        .map(|index| {
            let start = index * SCAN_SLICE;
            let end = ((index + 1) * SCAN_SLICE).min(window.len());
            let scan_end = (end + MAGIC.len() - 1).min(window.len());
            finder
                .find_iter(&window[start..scan_end])
                .map(|m| start + m)
                .filter(|&position| position < end)
                .collect()
        })
        .collect();
    per_slice.concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::test_support::{base64_bytes, pigz_like_compress};
    use std::sync::Arc;

    fn finder_over(bytes: Vec<u8>, buffer: usize) -> PigzFinder {
        PigzFinder::with_buffer_size(Arc::new(MemorySource::new(bytes)), buffer).unwrap()
    }

    fn collect(finder: &mut PigzFinder) -> Vec<u64> {
        let mut offsets = Vec::new();
        while let Some(offset) = finder.next().unwrap() {
            offsets.push(offset);
        }
        offsets
    }

    #[test]
    fn finds_flush_markers() {
        let data = base64_bytes(500_000, 3);
        let compressed = pigz_like_compress(&data, 100_000);
        let mut finder = finder_over(compressed.clone(), DEFAULT_SCAN_BUFFER);
        let offsets = collect(&mut finder);

        // Header end plus one marker per flushed piece (the final flush may
        // coincide with the stream end and is then filtered).
        assert!(offsets.len() >= 5, "got {offsets:?}");
        assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(offsets[0], 80);

        // Each marker candidate is preceded by the 00 00 FF FF magic.
        for &offset in &offsets[1..] {
            assert_eq!(offset % 8, 0);
            let end = (offset / 8) as usize;
            assert_eq!(&compressed[end - 4..end], &MAGIC);
        }
    }

    #[test]
    fn markers_on_buffer_boundaries_are_found() {
        let data = base64_bytes(300_000, 11);
        let compressed = pigz_like_compress(&data, 50_000);
        let expected = collect(&mut finder_over(compressed.clone(), DEFAULT_SCAN_BUFFER));

        // Tiny scan buffers force every marker across a read boundary at
        // some buffer size.
        for buffer in [64, 127, 1024, 4096] {
            let offsets = collect(&mut finder_over(compressed.clone(), buffer));
            assert_eq!(offsets, expected, "buffer size {buffer}");
        }
    }

    #[test]
    fn no_markers_in_plain_gzip() {
        let compressed = crate::test_support::gzip_compress(&base64_bytes(100_000, 5));
        let mut finder = finder_over(compressed, DEFAULT_SCAN_BUFFER);
        let offsets = collect(&mut finder);
        // Overwhelmingly the header candidate only; incompressible data may
        // rarely contain the magic by chance, but never before the header
        // end.
        assert_eq!(offsets[0], 80);
        assert!(offsets.iter().all(|&offset| offset >= 80));
    }
}
