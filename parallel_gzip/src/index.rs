//! Seek-point index: `(compressed bit offset, decoded offset, window)`
//! records plus the stream totals.
//!
//! An exported index makes a later run skip the sequential marker phase
//! entirely: every chunk decodes committed from its recorded offset with its
//! recorded window. Windows are stored raw or zlib-compressed (sparse
//! windows are zeroed before compression, which makes them almost free).

use crate::error::{Error, Result};
use crate::window::Window;
use std::io::{Read, Write};

const MAGIC: &[u8; 8] = b"PGZIDX01";

pub struct IndexRecord {
    pub bit_offset: u64,
    pub decoded_offset: u64,
    /// The window preceding `decoded_offset`; absent only for the first
    /// record (nothing precedes the stream).
    pub window: Option<Window>,
}

pub struct GzipIndex {
    pub records: Vec<IndexRecord>,
    /// Bit offset just past the final block of the final member.
    pub end_bits: u64,
    pub total_decoded: u64,
}

const WINDOW_NONE: u8 = 0;
const WINDOW_RAW: u8 = 1;
const WINDOW_ZLIB: u8 = 2;

pub fn write_index<W: Write>(mut writer: W, index: &GzipIndex) -> Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&(index.records.len() as u32).to_le_bytes())?;
    writer.write_all(&index.end_bits.to_le_bytes())?;
    writer.write_all(&index.total_decoded.to_le_bytes())?;

    for record in &index.records {
        writer.write_all(&record.bit_offset.to_le_bytes())?;
        writer.write_all(&record.decoded_offset.to_le_bytes())?;
        match &record.window {
            None => writer.write_all(&[WINDOW_NONE])?,
            Some(window) if window.is_compressed() => {
                writer.write_all(&[WINDOW_ZLIB])?;
                writer.write_all(&(window.uncompressed_size() as u32).to_le_bytes())?;
                writer.write_all(&(window.payload().len() as u32).to_le_bytes())?;
                writer.write_all(window.payload())?;
            }
            Some(window) => {
                writer.write_all(&[WINDOW_RAW])?;
                writer.write_all(&(window.payload().len() as u32).to_le_bytes())?;
                writer.write_all(window.payload())?;
            }
        }
    }
    Ok(())
}

pub fn read_index<R: Read>(mut reader: R) -> Result<GzipIndex> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::InvalidFormat("not a gzip seek index"));
    }

    let record_count = read_u32(&mut reader)? as usize;
    let end_bits = read_u64(&mut reader)?;
    let total_decoded = read_u64(&mut reader)?;

    let mut records = Vec::with_capacity(record_count);
    let mut previous_offset = None;
    for _ in 0..record_count {
        let bit_offset = read_u64(&mut reader)?;
        let decoded_offset = read_u64(&mut reader)?;
        if let Some((previous_bits, previous_decoded)) = previous_offset {
            if bit_offset <= previous_bits || decoded_offset < previous_decoded {
                return Err(Error::InvalidFormat("index offsets not monotone"));
            }
        }
        previous_offset = Some((bit_offset, decoded_offset));

        let window = match read_u8(&mut reader)? {
            WINDOW_NONE => None,
            WINDOW_RAW => {
                let length = read_u32(&mut reader)? as usize;
                if length > crate::deflate::MAX_WINDOW_SIZE {
                    return Err(Error::InvalidFormat("index window exceeds 32 KiB"));
                }
                let mut bytes = vec![0u8; length];
                reader.read_exact(&mut bytes)?;
                Some(Window::from_bytes(bytes))
            }
            WINDOW_ZLIB => {
                let uncompressed_size = read_u32(&mut reader)? as usize;
                if uncompressed_size > crate::deflate::MAX_WINDOW_SIZE {
                    return Err(Error::InvalidFormat("index window exceeds 32 KiB"));
                }
                let length = read_u32(&mut reader)? as usize;
                let mut bytes = vec![0u8; length];
                reader.read_exact(&mut bytes)?;
                Some(Window::from_zlib(bytes, uncompressed_size))
            }
            _ => return Err(Error::InvalidFormat("unknown index window kind")),
        };
        records.push(IndexRecord {
            bit_offset,
            decoded_offset,
            window,
        });
    }

    Ok(GzipIndex {
        records,
        end_bits,
        total_decoded,
    })
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
