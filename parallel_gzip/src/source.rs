//! Positional byte sources for the compressed input.
//!
//! The compressed file is read by many worker threads at once, so the input
//! is not modelled as a single cursor. Every reader owns its position and
//! issues positional reads against a shared, immutable [`Source`].
//!
//! Adapters:
//! - [`MemorySource`] wraps any `AsRef<[u8]>`, e.g. a `Vec<u8>` or an mmap.
//! - [`FileSource`] issues `pread`-style reads against a file.
//! - [`SinglePassSource`] adapts a non-seekable stream (a pipe) by buffering
//!   read-ahead in memory and releasing it once the consumer has passed.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

/// A shared, immutable byte source supporting concurrent positional reads.
pub trait Source: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at byte `offset`.
    /// Returns 0 only at (or past) the end of the source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Total size in bytes, when known up front.
    fn size(&self) -> Option<u64>;

    /// Hint that no reader will request positions before `offset` again.
    /// Buffering adapters drop the prefix; seekable sources ignore it.
    fn release_before(&self, _offset: u64) {}
}

/// Reads exactly `buf.len()` bytes at `offset` or fails with `UnexpectedEof`.
pub fn read_exact_at(source: &dyn Source, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = source.read_at(offset + done as u64, &mut buf[done..])?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        done += n;
    }
    Ok(())
}

/// In-memory source. The typical backing store is a memory map, which keeps
/// the file off the heap while still giving every thread zero-copy access.
pub struct MemorySource<T: AsRef<[u8]> + Send + Sync> {
    data: T,
}

impl<T: AsRef<[u8]> + Send + Sync> MemorySource<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

impl MemorySource<memmap2::Mmap> {
    /// Memory-maps a file read-only. The map stays valid for the lifetime of
    /// the source; no concurrent modification of the file is expected.
    pub fn map_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
        Ok(Self::new(mmap))
    }
}

impl<T: AsRef<[u8]> + Send + Sync> Source for MemorySource<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.as_ref();
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let offset = offset as usize;
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.as_ref().len() as u64)
    }
}

/// File-backed source using positional reads, so no shared cursor exists.
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Source for FileSource {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        // No positional read primitive; serialize seek+read on a clone.
        use std::io::{Seek, SeekFrom};
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// Growable buffer over a non-seekable stream.
///
/// Workers may request positions ahead of what has been pulled from the inner
/// reader; the buffer grows on demand. Positions before the release watermark
/// are gone for good: out-of-order chunk completion tolerates this because the
/// fetcher keeps the watermark `2 * parallelization + 1` chunks behind the
/// consumer cursor.
pub struct SinglePassSource<R: Read + Send> {
    inner: Mutex<SinglePassInner<R>>,
}

struct SinglePassInner<R: Read + Send> {
    reader: Option<R>,
    /// Bytes `[base_offset, base_offset + buffer.len())` of the stream.
    buffer: Vec<u8>,
    base_offset: u64,
    total_read: u64,
}

impl<R: Read + Send> SinglePassSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: Mutex::new(SinglePassInner {
                reader: Some(reader),
                buffer: Vec::new(),
                base_offset: 0,
                total_read: 0,
            }),
        }
    }

    /// Drops buffered bytes before `offset`. Reads before the new watermark
    /// will fail; the caller must guarantee no reader needs them anymore.
    pub fn release_before(&self, offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        if offset <= inner.base_offset {
            return;
        }
        let drop_count = (offset - inner.base_offset).min(inner.buffer.len() as u64) as usize;
        inner.buffer.drain(..drop_count);
        inner.base_offset += drop_count as u64;
    }
}

impl<R: Read + Send> Source for SinglePassSource<R> {
    fn release_before(&self, offset: u64) {
        SinglePassSource::release_before(self, offset);
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if offset < inner.base_offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "position was already released from the single-pass buffer",
            ));
        }

        // Pull from the inner reader until the requested range is buffered
        // or the stream ends.
        let needed_end = offset + buf.len() as u64;
        while inner.total_read < needed_end {
            let mut chunk = [0u8; 128 * 1024];
            let reader = match inner.reader.as_mut() {
                Some(reader) => reader,
                None => break,
            };
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                inner.reader = None;
                break;
            }
            inner.buffer.extend_from_slice(&chunk[..n]);
            inner.total_read += n as u64;
        }

        if offset >= inner.total_read {
            return Ok(0);
        }
        let start = (offset - inner.base_offset) as usize;
        let n = buf.len().min(inner.buffer.len() - start);
        buf[..n].copy_from_slice(&inner.buffer[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> Option<u64> {
        None
    }
}

/// Type-erased shared source handle used throughout the crate.
pub type SharedSource = Arc<dyn Source>;
