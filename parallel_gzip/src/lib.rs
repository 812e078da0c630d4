//! High-performance parallel gzip / DEFLATE decompression library.
//!
//! This library decompresses gzip, BGZF, and raw DEFLATE streams using all
//! available CPU cores, even though DEFLATE is an inherently sequential
//! format: every block may reference the previous 32 KiB of *decoded* output
//! and block boundaries fall on arbitrary bit positions.
//!
//! # Architecture
//!
//! The decoder runs a multi-stage pipeline:
//!
//! 1. **Block finding**: candidate block entry points are located without
//!    decoding the stream prefix — by walking record headers (BGZF), by
//!    searching for flush markers (pigz), or by probing bit offsets with a
//!    precode filter (arbitrary gzip).
//! 2. **Speculative decoding**: a worker pool decodes chunks starting at the
//!    candidates. Chunks whose 32 KiB starting window is still unknown are
//!    decoded into 16-bit cells where back-references into the unknown past
//!    yield *marker symbols* instead of bytes.
//! 3. **Resolution and reordering**: once a chunk's predecessor is done, its
//!    markers are replaced using the predecessor's final window, and the
//!    chunk enters the ordered chain delivered to the consumer.
//!
//! # Quick start
//!
//! The easiest way in is [`ParallelGzipReader`]:
//!
//! ```no_run
//! use parallel_gzip::{ParallelGzipReader, ReaderOptions};
//! use std::io::Read;
//!
//! let mut reader =
//!     ParallelGzipReader::open("file.gz", ReaderOptions::default()).unwrap();
//! let mut data = Vec::new();
//! reader.read_to_end(&mut data).unwrap();
//! ```
//!
//! Or, for whole files, the one-liner:
//!
//! ```no_run
//! let data = parallel_gzip::parallel_gzip_cat("file.gz").unwrap();
//! ```
//!
//! # Random access
//!
//! [`ParallelGzipReader`] implements `Seek`. Seeking forward decodes up to
//! the target; seeking backward re-reads from cache or re-decodes. With an
//! exported seek index ([`ParallelGzipReader::export_index`]) a later reader
//! can jump anywhere immediately ([`ParallelGzipReader::import_index`]).
//!
//! # Thread safety
//!
//! The reader itself is a single-consumer handle; the worker pool and all
//! shared state live behind it. The compressed source is read concurrently
//! through positional reads, never through a shared cursor.

pub mod bitreader;
pub mod blockfinder;
pub mod blockmap;
pub mod cache;
pub mod chunk;
pub mod deflate;
pub mod error;
pub mod fetcher;
pub mod gzip;
pub mod huffman;
pub mod index;
pub mod precode;
pub mod reader;
pub mod source;
pub mod threadpool;
pub mod window;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{DeflateError, Error, Result};
pub use fetcher::{ChunkFetcher, FetchStatistics, FetcherOptions};
pub use gzip::FileKind;
pub use reader::{parallel_gzip_cat, ParallelGzipReader, ReaderOptions};
pub use source::{FileSource, MemorySource, SharedSource, SinglePassSource};
