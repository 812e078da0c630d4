//! Decoded windows and marker resolution.
//!
//! A window is the up-to-32 KiB of decoded output preceding some decoded
//! offset, oldest byte first. Windows are immutable once produced, shared via
//! `Arc`, and handed from each chunk to its successor. Stored windows can be
//! zlib-compressed, and positions the successor never reads may be zeroed
//! first (sparse form) to make that compression nearly free.

use crate::deflate::{MARKER_BASE, MAX_WINDOW_SIZE};
use crate::error::{DeflateError, Error, Result};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Bit set over the 32 Ki virtual window positions: which predecessor-window
/// bytes a resolved chunk actually read.
#[derive(Clone)]
pub struct UsedWindowSymbols {
    bits: Box<[u64; MAX_WINDOW_SIZE / 64]>,
}

impl Default for UsedWindowSymbols {
    fn default() -> Self {
        Self::new()
    }
}

impl UsedWindowSymbols {
    pub fn new() -> Self {
        Self {
            bits: Box::new([0u64; MAX_WINDOW_SIZE / 64]),
        }
    }

    #[inline]
    pub fn mark(&mut self, position: usize) {
        self.bits[position / 64] |= 1 << (position % 64);
    }

    #[inline]
    pub fn is_marked(&self, position: usize) -> bool {
        self.bits[position / 64] & (1 << (position % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }
}

/// Immutable window contents in one of the storage forms.
pub struct Window {
    storage: WindowStorage,
}

enum WindowStorage {
    Raw(Vec<u8>),
    Zlib {
        compressed: Vec<u8>,
        uncompressed_size: usize,
    },
}

impl Window {
    /// Wraps raw window bytes (at most 32 KiB, oldest first).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        debug_assert!(bytes.len() <= MAX_WINDOW_SIZE);
        Self {
            storage: WindowStorage::Raw(bytes),
        }
    }

    /// Wraps an already zlib-compressed window.
    pub fn from_zlib(compressed: Vec<u8>, uncompressed_size: usize) -> Self {
        Self {
            storage: WindowStorage::Zlib {
                compressed,
                uncompressed_size,
            },
        }
    }

    /// The window of a chunk boundary: the last 32 KiB of
    /// `previous ++ chunk_data`, where `previous` is the window preceding the
    /// chunk and `chunk_data` its decoded bytes.
    pub fn at_end_of(previous: &[u8], chunk_data: &[u8]) -> Self {
        if chunk_data.len() >= MAX_WINDOW_SIZE {
            return Self::from_bytes(chunk_data[chunk_data.len() - MAX_WINDOW_SIZE..].to_vec());
        }
        let from_previous = (MAX_WINDOW_SIZE - chunk_data.len()).min(previous.len());
        let mut bytes = Vec::with_capacity(from_previous + chunk_data.len());
        bytes.extend_from_slice(&previous[previous.len() - from_previous..]);
        bytes.extend_from_slice(chunk_data);
        Self::from_bytes(bytes)
    }

    pub fn uncompressed_size(&self) -> usize {
        match &self.storage {
            WindowStorage::Raw(bytes) => bytes.len(),
            WindowStorage::Zlib {
                uncompressed_size, ..
            } => *uncompressed_size,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.storage, WindowStorage::Zlib { .. })
    }

    /// Stored bytes in their on-disk form (raw or zlib), for serialization.
    pub fn payload(&self) -> &[u8] {
        match &self.storage {
            WindowStorage::Raw(bytes) => bytes,
            WindowStorage::Zlib { compressed, .. } => compressed,
        }
    }

    /// Window bytes, decompressing when stored in zlib form.
    pub fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        match &self.storage {
            WindowStorage::Raw(bytes) => Ok(Cow::Borrowed(bytes)),
            WindowStorage::Zlib {
                compressed,
                uncompressed_size,
            } => {
                let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
                let mut bytes = Vec::with_capacity(*uncompressed_size);
                std::io::Read::read_to_end(&mut decoder, &mut bytes).map_err(Error::from)?;
                if bytes.len() != *uncompressed_size {
                    return Err(Error::InvalidFormat("stored window size mismatch"));
                }
                Ok(Cow::Owned(bytes))
            }
        }
    }

    /// Zlib-compressed copy of this window.
    pub fn compressed(&self) -> Result<Window> {
        let bytes = self.bytes()?;
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&bytes).map_err(Error::from)?;
        let compressed = encoder.finish().map_err(Error::from)?;
        Ok(Window::from_zlib(compressed, bytes.len()))
    }

    /// Copy with every position the successor never reads zeroed out, then
    /// zlib-compressed. Purely an optimization: zeroed positions are exactly
    /// those the used-symbols map proves unread, so resolution results do
    /// not change.
    pub fn sparsified(&self, used: &UsedWindowSymbols) -> Result<Window> {
        let bytes = self.bytes()?;
        let offset = MAX_WINDOW_SIZE - bytes.len();
        let mut sparse = bytes.into_owned();
        for (position, byte) in sparse.iter_mut().enumerate() {
            if !used.is_marked(position + offset) {
                *byte = 0;
            }
        }
        Window::from_bytes(sparse).compressed()
    }
}

/// Replaces marker symbols with bytes from the predecessor window.
///
/// `window` is the predecessor window, oldest first; when shorter than
/// 32 KiB it occupies the *tail* of the virtual marker space (the stream
/// started less than 32 KiB before the chunk). Every resolved window
/// position is recorded in `used`.
///
/// The mapping is a pure function of its inputs, so running it twice, or on
/// subchunk slices in any order, produces identical bytes.
pub fn resolve_markers(
    data: &[u16],
    window: &[u8],
    out: &mut Vec<u8>,
    used: &mut UsedWindowSymbols,
) -> Result<()> {
    let offset = MAX_WINDOW_SIZE - window.len();
    out.reserve(data.len());
    for &value in data {
        if value < MARKER_BASE {
            out.push(value as u8);
        } else {
            let position = (value - MARKER_BASE) as usize;
            if position >= MAX_WINDOW_SIZE || position < offset {
                // Back-reference reaching before the start of the stream.
                return Err(DeflateError::ExceededWindowRange.into());
            }
            used.mark(position);
            out.push(window[position - offset]);
        }
    }
    Ok(())
}

/// Shared map from decoded offset to the window preceding it.
///
/// Workers resolve chunks out of order, so the map is mutex-protected; the
/// windows themselves are immutable and shared by `Arc`.
#[derive(Default)]
pub struct WindowMap {
    windows: Mutex<HashMap<u64, Arc<Window>>>,
}

impl WindowMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, decoded_offset: u64, window: Arc<Window>) {
        self.windows.lock().unwrap().insert(decoded_offset, window);
    }

    pub fn get(&self, decoded_offset: u64) -> Option<Arc<Window>> {
        self.windows.lock().unwrap().get(&decoded_offset).cloned()
    }

    pub fn contains(&self, decoded_offset: u64) -> bool {
        self.windows.lock().unwrap().contains_key(&decoded_offset)
    }

    /// Replaces a stored window, e.g. with its sparse form once the
    /// successor's used-symbols map is known.
    pub fn replace(&self, decoded_offset: u64, window: Arc<Window>) {
        self.windows.lock().unwrap().insert(decoded_offset, window);
    }

    /// Releases windows no longer reachable: everything strictly before
    /// `decoded_offset`.
    pub fn release_before(&self, decoded_offset: u64) {
        self.windows
            .lock()
            .unwrap()
            .retain(|&offset, _| offset >= decoded_offset);
    }

    /// All windows ordered by decoded offset, for index export.
    pub fn sorted(&self) -> Vec<(u64, Arc<Window>)> {
        let mut entries: Vec<_> = self
            .windows
            .lock()
            .unwrap()
            .iter()
            .map(|(&offset, window)| (offset, window.clone()))
            .collect();
        entries.sort_by_key(|&(offset, _)| offset);
        entries
    }

    pub fn len(&self) -> usize {
        self.windows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_bytes_and_markers() {
        let window: Vec<u8> = (0..=255).cycle().take(MAX_WINDOW_SIZE).map(|v| v as u8).collect();
        let data = vec![
            b'a' as u16,
            MARKER_BASE,                             // oldest window byte
            MARKER_BASE + 255,
            b'z' as u16,
            MARKER_BASE + (MAX_WINDOW_SIZE as u16 - 1), // newest window byte
        ];
        let mut out = Vec::new();
        let mut used = UsedWindowSymbols::new();
        resolve_markers(&data, &window, &mut out, &mut used).unwrap();
        assert_eq!(
            out,
            vec![b'a', window[0], window[255], b'z', window[MAX_WINDOW_SIZE - 1]]
        );
        assert_eq!(used.count(), 3);
        assert!(used.is_marked(0));
        assert!(used.is_marked(255));
        assert!(used.is_marked(MAX_WINDOW_SIZE - 1));
    }

    #[test]
    fn short_window_occupies_the_tail() {
        let window = vec![10u8, 20, 30];
        let offset = (MAX_WINDOW_SIZE - 3) as u16;
        let data = vec![MARKER_BASE + offset, MARKER_BASE + offset + 2];
        let mut out = Vec::new();
        let mut used = UsedWindowSymbols::new();
        resolve_markers(&data, &window, &mut out, &mut used).unwrap();
        assert_eq!(out, vec![10, 30]);

        // A marker before the window start is corrupt input.
        let mut out = Vec::new();
        assert!(resolve_markers(
            &[MARKER_BASE + offset - 1],
            &window,
            &mut out,
            &mut used
        )
        .is_err());
    }

    #[test]
    fn resolution_is_idempotent_and_splittable() {
        let window: Vec<u8> = (0..MAX_WINDOW_SIZE).map(|i| (i * 7) as u8).collect();
        let data: Vec<u16> = (0..1000)
            .map(|i| {
                if i % 3 == 0 {
                    MARKER_BASE + ((i * 37) % MAX_WINDOW_SIZE) as u16
                } else {
                    (i % 256) as u16
                }
            })
            .collect();

        let mut whole = Vec::new();
        let mut used = UsedWindowSymbols::new();
        resolve_markers(&data, &window, &mut whole, &mut used).unwrap();

        // Split resolution commutes with concatenation.
        let mut pieces = Vec::new();
        let mut used_split = UsedWindowSymbols::new();
        for part in data.chunks(123) {
            resolve_markers(part, &window, &mut pieces, &mut used_split).unwrap();
        }
        assert_eq!(whole, pieces);
        assert_eq!(used.count(), used_split.count());
    }

    #[test]
    fn zeroing_unused_positions_preserves_resolution() {
        let window: Vec<u8> = (0..MAX_WINDOW_SIZE).map(|i| (i * 13 + 1) as u8).collect();
        let data: Vec<u16> = (0..512)
            .map(|i| MARKER_BASE + ((i * 101) % MAX_WINDOW_SIZE) as u16)
            .collect();

        let mut expected = Vec::new();
        let mut used = UsedWindowSymbols::new();
        resolve_markers(&data, &window, &mut expected, &mut used).unwrap();

        let sparse = Window::from_bytes(window).sparsified(&used).unwrap();
        assert!(sparse.is_compressed());
        let sparse_bytes = sparse.bytes().unwrap();
        let mut actual = Vec::new();
        let mut used_again = UsedWindowSymbols::new();
        resolve_markers(&data, &sparse_bytes, &mut actual, &mut used_again).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn compressed_window_roundtrip() {
        let bytes: Vec<u8> = (0..MAX_WINDOW_SIZE).map(|i| (i % 251) as u8).collect();
        let window = Window::from_bytes(bytes.clone());
        let compressed = window.compressed().unwrap();
        assert!(compressed.is_compressed());
        assert_eq!(compressed.uncompressed_size(), bytes.len());
        assert_eq!(compressed.bytes().unwrap().as_ref(), bytes.as_slice());
    }

    #[test]
    fn window_at_end_composes_previous_and_chunk() {
        let previous: Vec<u8> = vec![1; MAX_WINDOW_SIZE];
        let chunk: Vec<u8> = vec![2; 100];
        let window = Window::at_end_of(&previous, &chunk);
        let bytes = window.bytes().unwrap();
        assert_eq!(bytes.len(), MAX_WINDOW_SIZE);
        assert!(bytes[..MAX_WINDOW_SIZE - 100].iter().all(|&b| b == 1));
        assert!(bytes[MAX_WINDOW_SIZE - 100..].iter().all(|&b| b == 2));

        let big_chunk: Vec<u8> = (0..MAX_WINDOW_SIZE + 5).map(|i| i as u8).collect();
        let window = Window::at_end_of(&previous, &big_chunk);
        assert_eq!(
            window.bytes().unwrap().as_ref(),
            &big_chunk[big_chunk.len() - MAX_WINDOW_SIZE..]
        );

        // Early in the stream both parts may be short.
        let window = Window::at_end_of(&[1, 2, 3], &[4, 5]);
        assert_eq!(window.bytes().unwrap().as_ref(), &[1, 2, 3, 4, 5]);
    }
}
