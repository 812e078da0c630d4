//! Generators for compressed test inputs, shared by the unit tests.

use crc32fast::Hasher;
use std::io::Write;

/// Plain single-member gzip via flate2.
pub fn gzip_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// One gzip member per input slice, concatenated.
pub fn multi_member_gzip(members: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for member in members {
        out.extend_from_slice(&gzip_compress(member));
    }
    out
}

/// Gzip stream with a pigz-style flush marker (empty stored block) after
/// every `flush_every` bytes. flate2's `flush()` issues a zlib sync flush,
/// which emits exactly the `00 00 FF FF` empty stored block pigz uses at its
/// parallel-chunk boundaries.
pub fn pigz_like_compress(data: &[u8], flush_every: usize) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    for piece in data.chunks(flush_every) {
        encoder.write_all(piece).unwrap();
        encoder.flush().unwrap();
    }
    encoder.finish().unwrap()
}

/// BGZF file: one fully flushed gzip member (with the "BC" size subfield) per
/// `segment_size` bytes of input, plus the fixed EOF record. Returns the
/// bytes and the compressed size of every record including the terminator.
pub fn bgzf_compress(data: &[u8], segment_size: usize) -> (Vec<u8>, Vec<usize>) {
    assert!(segment_size <= 65_000, "BGZF records are capped at 64 KiB");
    let mut out = Vec::new();
    let mut record_sizes = Vec::new();

    for segment in data.chunks(segment_size) {
        let mut deflate =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        deflate.write_all(segment).unwrap();
        let body = deflate.finish().unwrap();

        let record_size = 18 + body.len() + 8;
        assert!(record_size <= 65_536, "segment too large for one record");

        let mut header = [0u8; 18];
        header[0] = 0x1f;
        header[1] = 0x8b;
        header[2] = 0x08;
        header[3] = 0x04; // FEXTRA
        header[9] = 0xff; // unknown OS
        header[10] = 0x06; // XLEN
        header[12] = b'B';
        header[13] = b'C';
        header[14] = 0x02;
        header[16..18].copy_from_slice(&((record_size - 1) as u16).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);

        let mut hasher = Hasher::new();
        hasher.update(segment);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        out.extend_from_slice(&(segment.len() as u32).to_le_bytes());

        record_sizes.push(record_size);
    }

    out.extend_from_slice(&crate::gzip::BGZF_EOF_BLOCK);
    record_sizes.push(crate::gzip::BGZF_EOF_BLOCK.len());
    (out, record_sizes)
}

/// Deterministic pseudo-random bytes (no compressible structure).
pub fn random_bytes(length: usize, mut state: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(length);
    for _ in 0..length {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.push((state >> 56) as u8);
    }
    out
}

/// Base64-ish text: incompressible enough to force dynamic Huffman blocks,
/// structured enough to compress at all.
pub fn base64_bytes(length: usize, state: u64) -> Vec<u8> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    random_bytes(length, state)
        .into_iter()
        .map(|byte| ALPHABET[(byte & 63) as usize])
        .collect()
}

/// Reference decoder: gzip (possibly multi-member) via flate2.
pub fn reference_decode(compressed: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut decoder = flate2::read::MultiGzDecoder::new(compressed);
    std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
    out
}
