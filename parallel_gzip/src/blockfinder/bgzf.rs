//! BGZF block finder.
//!
//! BGZF files carry the compressed size of every record in a "BC" extra
//! field, so finding block boundaries is a linear walk over the record
//! headers; nothing speculative about it. Candidates point at the first bit
//! of each record's DEFLATE stream, i.e. right after the 18-byte header.

use crate::error::{Error, Result};
use crate::gzip;
use crate::source::SharedSource;

pub struct BgzfFinder {
    source: SharedSource,
    /// Byte offset of the next record header; `None` once exhausted.
    next_record: Option<u64>,
}

impl BgzfFinder {
    pub fn new(source: SharedSource) -> Result<Self> {
        let mut header = [0u8; gzip::BGZF_HEADER_SIZE];
        crate::source::read_exact_at(source.as_ref(), 0, &mut header)?;
        if !gzip::is_bgzf_header(&header) {
            return Err(Error::InvalidFormat("not a BGZF stream"));
        }
        Ok(Self {
            source,
            next_record: Some(0),
        })
    }

    pub fn next(&mut self) -> Result<Option<u64>> {
        let record_offset = match self.next_record {
            Some(offset) => offset,
            None => return Ok(None),
        };

        let mut header = [0u8; gzip::BGZF_HEADER_SIZE];
        if crate::source::read_exact_at(self.source.as_ref(), record_offset, &mut header).is_err()
        {
            // Clean end of file after the previous record.
            self.next_record = None;
            return Ok(None);
        }
        if !gzip::is_bgzf_header(&header) {
            self.next_record = None;
            return Err(Error::InvalidFormat("malformed BGZF record header"));
        }

        let record_size = gzip::bgzf_record_size(&header) as u64;

        // The terminating empty record decodes to nothing; the predecessor
        // chunk consumes it while draining the stream, so it is not a
        // candidate of its own.
        if record_size == gzip::BGZF_EOF_BLOCK.len() as u64 {
            let mut block = [0u8; 28];
            if crate::source::read_exact_at(self.source.as_ref(), record_offset, &mut block).is_ok()
                && block == gzip::BGZF_EOF_BLOCK
            {
                self.next_record = None;
                return Ok(None);
            }
        }

        self.next_record = Some(record_offset + record_size);
        if let Some(size) = self.source.size() {
            if record_offset + record_size >= size {
                self.next_record = None;
            }
        }

        Ok(Some((record_offset + gzip::BGZF_HEADER_SIZE as u64) * 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::test_support::bgzf_compress;
    use std::sync::Arc;

    #[test]
    fn walks_record_headers() {
        let data = vec![7u8; 200_000];
        let (compressed, record_sizes) = bgzf_compress(&data, 60_000);
        assert!(record_sizes.len() >= 4);

        let source = Arc::new(MemorySource::new(compressed));
        let mut finder = BgzfFinder::new(source).unwrap();

        let mut expected_offset = 0u64;
        for &record_size in &record_sizes {
            let candidate = finder.next().unwrap().unwrap();
            assert_eq!(candidate, (expected_offset + 18) * 8);
            expected_offset += record_size as u64;
        }
        // The EOF record terminates the walk without a candidate.
        assert_eq!(finder.next().unwrap(), None);
        assert_eq!(finder.next().unwrap(), None);
    }

    #[test]
    fn rejects_non_bgzf_input() {
        let source = Arc::new(MemorySource::new(vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0, 0xff, 0, 0, 0, 0, 0, 0, 0, 0]));
        assert!(BgzfFinder::new(source).is_err());
    }

    #[test]
    fn lone_eof_block_yields_no_candidates() {
        let source = Arc::new(MemorySource::new(crate::gzip::BGZF_EOF_BLOCK.to_vec()));
        let mut finder = BgzfFinder::new(source).unwrap();
        assert_eq!(finder.next().unwrap(), None);
    }
}
