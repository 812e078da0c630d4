//! Confirmed chunk boundaries: the bidirectional map between compressed bit
//! offsets and decoded byte offsets.
//!
//! Entries are appended as chunks are *resolved* (window-confirmed), so the
//! map grows strictly in stream order even though workers finish out of
//! order. Seeks binary-search the decoded axis.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    pub index: usize,
    pub encoded_bit_offset: u64,
    pub decoded_offset: u64,
}

#[derive(Default)]
pub struct BlockMap {
    /// `(encoded bit offset, decoded offset)` of each confirmed chunk start.
    chunks: Vec<(u64, u64)>,
    /// Set once the final chunk has been confirmed.
    end: Option<(u64, u64)>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Registers the next confirmed chunk start. Offsets must be strictly
    /// monotone; the first chunk may start at decoded offset 0 only.
    pub fn push(&mut self, encoded_bit_offset: u64, decoded_offset: u64) {
        if let Some(&(last_encoded, last_decoded)) = self.chunks.last() {
            debug_assert!(encoded_bit_offset > last_encoded);
            debug_assert!(decoded_offset >= last_decoded);
        } else {
            debug_assert_eq!(decoded_offset, 0);
        }
        self.chunks.push((encoded_bit_offset, decoded_offset));
    }

    /// Marks the stream as fully mapped, recording the end offsets.
    pub fn finalize(&mut self, encoded_end_bits: u64, total_decoded: u64) {
        self.end = Some((encoded_end_bits, total_decoded));
    }

    pub fn is_finalized(&self) -> bool {
        self.end.is_some()
    }

    /// Total decoded size, known once finalized.
    pub fn total_decoded(&self) -> Option<u64> {
        self.end.map(|(_, decoded)| decoded)
    }

    /// Bit offset just past the final block, known once finalized.
    pub fn end_bits(&self) -> Option<u64> {
        self.end.map(|(bits, _)| bits)
    }

    pub fn get(&self, index: usize) -> Option<ChunkEntry> {
        self.chunks
            .get(index)
            .map(|&(encoded_bit_offset, decoded_offset)| ChunkEntry {
                index,
                encoded_bit_offset,
                decoded_offset,
            })
    }

    /// Decoded size of chunk `index`, when its successor (or the end) is
    /// known.
    pub fn decoded_size_of(&self, index: usize) -> Option<u64> {
        let start = self.chunks.get(index)?.1;
        match self.chunks.get(index + 1) {
            Some(&(_, next)) => Some(next - start),
            None => self.end.map(|(_, total)| total - start),
        }
    }

    /// The confirmed chunk containing `decoded_offset`, if mapped already.
    /// For offsets past the last confirmed start, the last chunk is returned
    /// only while the map is not finalized or the offset is in range.
    pub fn find(&self, decoded_offset: u64) -> Option<ChunkEntry> {
        if let Some((_, total)) = self.end {
            if decoded_offset >= total {
                return None;
            }
        }
        // First chunk whose decoded start is beyond the target, minus one.
        let upper = self
            .chunks
            .partition_point(|&(_, decoded)| decoded <= decoded_offset);
        if upper == 0 {
            return None;
        }
        self.get(upper - 1)
    }

    /// All confirmed chunk starts, for diagnostics and index export.
    pub fn entries(&self) -> impl Iterator<Item = ChunkEntry> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .map(|(index, &(encoded_bit_offset, decoded_offset))| ChunkEntry {
                index,
                encoded_bit_offset,
                decoded_offset,
            })
    }
}
