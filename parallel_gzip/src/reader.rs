//! `ParallelGzipReader`: the `std::io::Read + Seek` facade over the chunk
//! fetcher.
//!
//! The consumer sees strictly ordered bytes; everything parallel happens
//! behind [`crate::fetcher::ChunkFetcher`]. Per-stream CRC32/ISIZE checks run
//! over the delivered bytes and trip *before* a corrupt stream's final byte
//! crosses a `read` call boundary; bytes already decoded stay delivered and
//! the error is raised on the next call.

use crate::chunk::ChunkData;
use crate::error::{Error, Result};
use crate::fetcher::{ChunkFetcher, FetchStatistics, FetcherOptions};
use crate::gzip::{self, FileKind};
use crate::index::{GzipIndex, IndexRecord};
use crate::source::{MemorySource, SharedSource};
use crate::window::Window;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// Reader configuration; plain data, filled in by the CLI or defaulted.
#[derive(Clone)]
pub struct ReaderOptions {
    /// Worker threads; 0 means all available cores.
    pub parallelization: usize,
    /// Compressed spacing between chunks, bytes.
    pub chunk_size: u64,
    /// Verify CRC32 and ISIZE of every gzip member (sequential reads only;
    /// seeking disables verification for the rest of the session).
    pub verify_crc: bool,
    /// Keep per-chunk windows so an index can be exported afterwards.
    pub keep_index_windows: bool,
    pub finder: crate::blockfinder::FinderChoice,
    pub pinning: crate::threadpool::ThreadPinning,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            parallelization: 0,
            chunk_size: 4 * 1024 * 1024,
            verify_crc: true,
            keep_index_windows: false,
            finder: crate::blockfinder::FinderChoice::Auto,
            pinning: crate::threadpool::ThreadPinning::new(),
        }
    }
}

struct CurrentChunk {
    chunk: Arc<ChunkData>,
    decoded_start: u64,
    index: usize,
}

pub struct ParallelGzipReader {
    fetcher: ChunkFetcher,
    current: Option<CurrentChunk>,
    /// Consumer cursor in decoded bytes.
    position: u64,

    /// CRC state is only meaningful while reads stay sequential from the
    /// start; any seek turns verification off for good.
    crc_active: bool,
    hasher: crc32fast::Hasher,
    /// Decoded offset where the current gzip member started.
    stream_start: u64,

    failed: Option<Error>,
}

impl ParallelGzipReader {
    /// Memory-maps a file and auto-detects gzip vs BGZF framing.
    pub fn open<P: AsRef<Path>>(path: P, options: ReaderOptions) -> Result<Self> {
        let source: SharedSource = Arc::new(MemorySource::map_file(path)?);
        Self::new(source, options)
    }

    /// Auto-detects the container format from the source's first bytes.
    pub fn new(source: SharedSource, options: ReaderOptions) -> Result<Self> {
        let kind = gzip::detect(source.as_ref())?;
        Self::with_kind(source, kind, options)
    }

    pub fn with_kind(source: SharedSource, kind: FileKind, options: ReaderOptions) -> Result<Self> {
        let parallelization = if options.parallelization == 0 {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
        } else {
            options.parallelization
        };
        let fetcher = ChunkFetcher::new(
            source,
            kind,
            FetcherOptions {
                parallelization,
                chunk_size: options.chunk_size,
                pinning: options.pinning.clone(),
                keep_windows: options.keep_index_windows,
                finder: options.finder,
                ..FetcherOptions::default()
            },
        )?;
        Ok(Self {
            fetcher,
            current: None,
            position: 0,
            crc_active: options.verify_crc,
            hasher: crc32fast::Hasher::new(),
            stream_start: 0,
            failed: None,
        })
    }

    /// Total decoded size, known once the stream end has been reached (or an
    /// index was imported).
    pub fn total_size(&self) -> Option<u64> {
        self.fetcher.block_map().total_decoded()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn statistics(&self) -> FetchStatistics {
        self.fetcher.statistics()
    }

    /// Clears a latched error; subsequent reads continue at the current
    /// position.
    pub fn clear_error(&mut self) {
        self.failed = None;
    }

    /// Decodes the rest of the stream so the block map is complete.
    fn run_to_end(&mut self) -> Result<u64> {
        while self.fetcher.block_map().total_decoded().is_none() {
            let index = self.fetcher.block_map().len();
            self.fetcher.get(index)?;
        }
        Ok(self.fetcher.block_map().total_decoded().unwrap())
    }

    /// Exports the seek-point index of the fully decoded stream. Requires
    /// `keep_index_windows`; drives decoding to the end first.
    pub fn export_index(&mut self) -> Result<GzipIndex> {
        let total_decoded = self.run_to_end()?;
        let block_map = self.fetcher.block_map();
        let mut records = Vec::with_capacity(block_map.len());
        for entry in block_map.entries() {
            let window = if entry.index == 0 {
                None
            } else {
                let stored = self
                    .fetcher
                    .windows()
                    .get(entry.decoded_offset)
                    .ok_or(Error::InvalidFormat(
                        "windows were not retained; enable keep_index_windows",
                    ))?;
                // Store compressed; sparse windows are already compressed.
                Some(if stored.is_compressed() {
                    Window::from_zlib(stored.payload().to_vec(), stored.uncompressed_size())
                } else {
                    Window::from_bytes(stored.payload().to_vec()).compressed()?
                })
            };
            records.push(IndexRecord {
                bit_offset: entry.encoded_bit_offset,
                decoded_offset: entry.decoded_offset,
                window,
            });
        }

        Ok(GzipIndex {
            records,
            end_bits: self.fetcher.block_map().end_bits().unwrap_or(0),
            total_decoded,
        })
    }

    /// Imports a seek-point index, enabling random access without a prior
    /// sequential scan. Must be called before any read.
    pub fn import_index(&mut self, index: GzipIndex) -> Result<()> {
        let entries = index
            .records
            .into_iter()
            .map(|record| (record.bit_offset, record.decoded_offset, record.window))
            .collect();
        self.fetcher
            .seed_from_index(entries, index.end_bits, index.total_decoded)
    }

    /// Feeds upcoming bytes through the CRC state. Returns how many of the
    /// `n` bytes may be delivered; fewer means a member checksum failed at
    /// that boundary and the error has been latched.
    fn advance_crc(&mut self, bytes: &[u8], chunk: &ChunkData, chunk_start: u64) -> usize {
        if !self.crc_active {
            return bytes.len();
        }

        let mut delivered = 0usize;
        let from = self.position;
        for footer in &chunk.footers {
            let boundary = chunk_start + footer.decoded_offset;
            if boundary <= from {
                continue;
            }
            let upto = (boundary - from) as usize;
            if upto > bytes.len() {
                break;
            }
            self.hasher.update(&bytes[delivered..upto]);
            let computed = std::mem::take(&mut self.hasher).finalize();
            let expected_size = (boundary - self.stream_start) as u32;
            self.stream_start = boundary;
            if computed != footer.footer.crc32 {
                self.failed = Some(Error::CrcMismatch {
                    stored: footer.footer.crc32,
                    computed,
                });
                return upto;
            }
            if expected_size != footer.footer.isize {
                self.failed = Some(Error::CrcMismatch {
                    stored: footer.footer.isize,
                    computed: expected_size,
                });
                return upto;
            }
            delivered = upto;
        }
        self.hasher.update(&bytes[delivered..]);
        bytes.len()
    }

    fn read_decoded(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if let Some(total) = self.fetcher.block_map().total_decoded() {
                if self.position >= total {
                    return Ok(0);
                }
            }

            let covering = match &self.current {
                Some(current)
                    if self.position >= current.decoded_start
                        && self.position
                            < current.decoded_start + current.chunk.decoded_size() =>
                {
                    Some((current.chunk.clone(), current.decoded_start))
                }
                _ => None,
            };
            if let Some((chunk, chunk_start)) = covering {
                let offset = (self.position - chunk_start) as usize;
                let data = chunk.bytes().expect("resolved chunk");
                let n = buf.len().min(data.len() - offset);
                let allowed = self.advance_crc(&data[offset..offset + n], &chunk, chunk_start);
                let n = n.min(allowed);
                if n == 0 {
                    // CRC failed exactly at the cursor.
                    return Err(self.failed.clone().expect("latched error"));
                }
                buf[..n].copy_from_slice(&data[offset..offset + n]);
                self.position += n as u64;
                self.fetcher.set_consumed(self.position);
                return Ok(n);
            }

            // Load the chunk containing the cursor.
            let index = match &self.current {
                Some(current)
                    if self.position >= current.decoded_start + current.chunk.decoded_size() =>
                {
                    current.index + 1
                }
                _ => match self.fetcher.block_map().find(self.position) {
                    Some(entry) => entry.index,
                    None => self.fetcher.block_map().len(),
                },
            };
            let chunk = self.fetcher.get(index)?;
            let decoded_start = self
                .fetcher
                .block_map()
                .get(index)
                .expect("fetched chunk is mapped")
                .decoded_offset;
            self.current = Some(CurrentChunk {
                chunk,
                decoded_start,
                index,
            });
        }
    }
}

impl Read for ParallelGzipReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(error) = &self.failed {
            return Err(error.clone().into());
        }
        match self.read_decoded(buf) {
            Ok(n) => Ok(n),
            Err(error) => {
                self.failed = Some(error.clone());
                Err(error.into())
            }
        }
    }
}

impl Seek for ParallelGzipReader {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let new_position = match target {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                let base = self.position as i64;
                (base + delta).max(0) as u64
            }
            SeekFrom::End(delta) => {
                let total = self.run_to_end().map_err(io::Error::from)?;
                ((total as i64) + delta).max(0) as u64
            }
        };

        if new_position != self.position {
            // Ordered delivery is broken; member checksums can no longer be
            // verified.
            self.crc_active = false;
            self.position = new_position;
        }
        Ok(self.position)
    }
}

/// Decompresses a whole file with default options; the simplest entry point
/// and the one the tests lean on.
pub fn parallel_gzip_cat<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let mut reader = ParallelGzipReader::open(path, ReaderOptions::default())?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out).map_err(Error::from)?;
    Ok(out)
}
