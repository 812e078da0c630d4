//! gzip and BGZF framing (RFC 1952, SAMv1 §4.1).
//!
//! Headers are parsed through the bit reader so that stream boundaries
//! crossed mid-chunk keep exact bit positions. BGZF detection works on raw
//! header bytes because the BGZF finder walks records without bit-level work.

use crate::bitreader::BitReader;
use crate::error::{Error, Result};
use crate::source::{read_exact_at, Source};

/// Gzip member trailer: CRC32 and length (mod 2^32) of the uncompressed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFooter {
    pub crc32: u32,
    pub isize: u32,
}

/// Fixed 18-byte BGZF header: gzip header with FEXTRA and the "BC" subfield
/// carrying the compressed record size.
pub const BGZF_HEADER_SIZE: usize = 18;

/// The 28-byte empty BGZF record every well-formed BGZF file ends with.
pub const BGZF_EOF_BLOCK: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const FLAG_FTEXT: u64 = 1 << 0;
const FLAG_FHCRC: u64 = 1 << 1;
const FLAG_FEXTRA: u64 = 1 << 2;
const FLAG_FNAME: u64 = 1 << 3;
const FLAG_FCOMMENT: u64 = 1 << 4;

/// Parses a gzip member header, leaving the reader at the first bit of the
/// DEFLATE stream. The reader must be byte-aligned.
pub fn read_header(reader: &mut BitReader) -> Result<()> {
    debug_assert_eq!(reader.tell() % 8, 0);

    if reader.read(8)? != 0x1f || reader.read(8)? != 0x8b {
        return Err(Error::InvalidFormat("missing gzip magic bytes"));
    }
    if reader.read(8)? != 0x08 {
        return Err(Error::InvalidFormat("unsupported compression method"));
    }
    let flags = reader.read(8)?;
    if flags & 0b1110_0000 != 0 {
        return Err(Error::InvalidFormat("reserved header flag bits set"));
    }
    let _ = flags & FLAG_FTEXT;
    reader.read(32)?; // MTIME
    reader.read(8)?; // XFL
    reader.read(8)?; // OS

    if flags & FLAG_FEXTRA != 0 {
        let extra_length = reader.read(16)?;
        for _ in 0..extra_length {
            reader.read(8)?;
        }
    }
    if flags & FLAG_FNAME != 0 {
        while reader.read(8)? != 0 {}
    }
    if flags & FLAG_FCOMMENT != 0 {
        while reader.read(8)? != 0 {}
    }
    if flags & FLAG_FHCRC != 0 {
        reader.read(16)?;
    }
    Ok(())
}

/// Parses the 8-byte member footer that follows the final block. Skips the
/// bit padding up to the next byte boundary first; its content is
/// unspecified, so it is not validated.
pub fn read_footer(reader: &mut BitReader) -> Result<StreamFooter> {
    let padding = (8 - reader.tell() % 8) % 8;
    if padding > 0 {
        reader.read(padding as u32)?;
    }
    let crc32 = reader.read(32)? as u32;
    let isize = reader.read(32)? as u32;
    Ok(StreamFooter { crc32, isize })
}

/// True when the 18 bytes look like a BGZF record header.
pub fn is_bgzf_header(header: &[u8]) -> bool {
    header.len() >= BGZF_HEADER_SIZE
        && header[0] == 0x1f
        && header[1] == 0x8b
        && header[2] == 0x08
        && header[3] & (1 << 2) != 0 // FEXTRA
        && header[10] == 0x06 // XLEN = 6
        && header[11] == 0x00
        && header[12] == b'B'
        && header[13] == b'C'
        && header[14] == 0x02 // subfield length = 2
        && header[15] == 0x00
}

/// Total compressed size of the BGZF record this header starts, including
/// the header and footer themselves.
pub fn bgzf_record_size(header: &[u8]) -> usize {
    debug_assert!(is_bgzf_header(header));
    (u16::from_le_bytes([header[16], header[17]]) as usize) + 1
}

/// Container format of a compressed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Gzip,
    Bgzf,
    /// Headerless RFC 1951 stream; never auto-detected, only explicit.
    RawDeflate,
}

/// Sniffs gzip vs BGZF from the first bytes of the source. BGZF wins when
/// both match (every BGZF file is also a gzip file) and, for sized sources,
/// when the terminating EOF record is present.
pub fn detect(source: &dyn Source) -> Result<FileKind> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    read_exact_at(source, 0, &mut header).map_err(Error::from)?;

    if is_bgzf_header(&header) {
        match source.size() {
            Some(size) if size >= BGZF_EOF_BLOCK.len() as u64 => {
                let mut footer = [0u8; 28];
                read_exact_at(source, size - footer.len() as u64, &mut footer)?;
                if footer == BGZF_EOF_BLOCK {
                    return Ok(FileKind::Bgzf);
                }
                // Header said BGZF but the file is not properly terminated;
                // the generic gzip path still decodes it.
            }
            _ => return Ok(FileKind::Bgzf),
        }
    }
    if header[0] == 0x1f && header[1] == 0x8b && header[2] == 0x08 {
        return Ok(FileKind::Gzip);
    }
    Err(Error::InvalidFormat("neither a gzip nor a BGZF header"))
}
