//! Canonical Huffman tables for the DEFLATE alphabets.
//!
//! Three consumers with different shapes:
//! - the precode (19 symbols, codes up to 7 bits) decodes bitwise through
//!   [`CanonicalCode`] directly,
//! - the distance alphabet uses a single-symbol lookup table keyed by the
//!   next 15 peeked bits,
//! - the literal/length alphabet uses [`LitLenTable`], which caches *two*
//!   symbols per lookup whenever both codes fit into the 15-bit key, so runs
//!   of short literal codes cost one table hit per two symbols.
//!
//! Tie-breaking is canonical: symbols are ordered by code length first, then
//! by their index in the input length sequence.

use crate::bitreader::BitReader;
use crate::error::{DeflateError, Result};

/// Longest DEFLATE Huffman code. Code lengths are transmitted as 4-bit-ish
/// values where 0 means "symbol absent".
pub const MAX_CODE_LENGTH: u32 = 15;

/// Lookup tables are keyed by this many peeked bits.
const LUT_BITS: u32 = MAX_CODE_LENGTH;

/// Bit position where the consumed-length is stored inside a LUT entry;
/// the low 10 bits hold the symbol.
const LENGTH_SHIFT: u32 = 10;
const SYMBOL_MASK: u16 = (1 << LENGTH_SHIFT) - 1;

/// Marker for "no second symbol cached".
const NONE_SYMBOL: u16 = u16::MAX;

/// A canonical Huffman code in count/offset form, decodable bit by bit.
///
/// This is the ground truth the lookup tables are generated from, and the
/// fallback decoder near the end of the input where a full 15-bit peek is no
/// longer possible.
#[derive(Clone, Default)]
pub struct CanonicalCode {
    min_length: u32,
    max_length: u32,
    /// Codes per length, `counts[length]`.
    counts: [u16; MAX_CODE_LENGTH as usize + 1],
    /// First canonical code value per length.
    first_codes: [u16; MAX_CODE_LENGTH as usize + 1],
    /// Start of each length's run inside `symbols`.
    offsets: [u16; MAX_CODE_LENGTH as usize + 1],
    /// Symbols sorted by length, then input order.
    symbols: Vec<u16>,
}

impl CanonicalCode {
    /// Builds the code from per-symbol code lengths (0 = absent).
    ///
    /// Fails on oversubscribed or bloating length sequences. Two degenerate
    /// forms pass: the empty alphabet (decoding then always fails) and a
    /// single one-bit code.
    pub fn from_lengths(lengths: &[u8]) -> std::result::Result<Self, DeflateError> {
        let mut counts = [0u16; MAX_CODE_LENGTH as usize + 1];
        let mut total = 0u32;
        for &length in lengths {
            debug_assert!(length as u32 <= MAX_CODE_LENGTH);
            if length > 0 {
                counts[length as usize] += 1;
                total += 1;
            }
        }

        if total == 0 {
            return Ok(Self::default());
        }

        // Walk the virtual tree level by level: each length must fit into the
        // leaves left unused by shorter codes.
        let mut unused: u32 = 2;
        for length in 1..=MAX_CODE_LENGTH as usize {
            let count = counts[length] as u32;
            if count > unused {
                return Err(DeflateError::OversubscribedAlphabet);
            }
            unused = (unused - count) * 2;
        }
        if total == 1 {
            if counts[1] != 1 {
                return Err(DeflateError::BloatingAlphabet);
            }
        } else if unused != 0 {
            return Err(DeflateError::BloatingAlphabet);
        }

        let min_length = (1..).find(|&length| counts[length as usize] > 0).unwrap();
        let max_length = (1..=MAX_CODE_LENGTH)
            .rev()
            .find(|&length| counts[length as usize] > 0)
            .unwrap();

        let mut first_codes = [0u16; MAX_CODE_LENGTH as usize + 1];
        let mut offsets = [0u16; MAX_CODE_LENGTH as usize + 1];
        let mut code = 0u32;
        let mut offset = 0u16;
        for length in 1..=MAX_CODE_LENGTH as usize {
            first_codes[length] = code as u16;
            offsets[length] = offset;
            code = (code + counts[length] as u32) << 1;
            offset += counts[length];
        }

        let mut symbols = vec![0u16; total as usize];
        let mut next = offsets;
        for (symbol, &length) in lengths.iter().enumerate() {
            if length > 0 {
                symbols[next[length as usize] as usize] = symbol as u16;
                next[length as usize] += 1;
            }
        }

        Ok(Self {
            min_length,
            max_length,
            counts,
            first_codes,
            offsets,
            symbols,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Decodes one symbol bit by bit. DEFLATE transmits each code MSB-first,
    /// so the accumulated value compares directly against the canonical
    /// first-code per length.
    pub fn decode(&self, reader: &mut BitReader) -> Result<u16> {
        let mut code = 0u32;
        for length in 1..=self.max_length {
            code = (code << 1) | reader.read(1)? as u32;
            if length >= self.min_length {
                let index = length as usize;
                let first = self.first_codes[index] as u32;
                if code < first + self.counts[index] as u32 {
                    let position = self.offsets[index] as u32 + (code - first);
                    return Ok(self.symbols[position as usize]);
                }
            }
        }
        Err(DeflateError::InvalidHuffmanCode.into())
    }

    /// Iterates `(symbol, length, bit-reversed code)` in canonical order.
    fn iter_codes(&self) -> impl Iterator<Item = (u16, u32, u16)> + '_ {
        let mut length = self.min_length;
        let mut within = 0u16;
        let counts = self.counts;
        let first_codes = self.first_codes;
        self.symbols.iter().map(move |&symbol| {
            while within >= counts[length as usize] {
                within = 0;
                length += 1;
            }
            let code = first_codes[length as usize] + within;
            within += 1;
            (symbol, length, reverse_bits(code, length))
        })
    }
}

/// Reverses the lowest `length` bits of `code`. The canonical code value is
/// MSB-first while the bit reader delivers LSB-first, so lookup keys use the
/// reversed form.
fn reverse_bits(code: u16, length: u32) -> u16 {
    code.reverse_bits() >> (16 - length)
}

/// Single-symbol lookup table for the distance alphabet.
pub struct DistanceTable {
    code: CanonicalCode,
    /// `symbol | length << LENGTH_SHIFT`; zero marks an unreachable pattern.
    lut: Vec<u16>,
}

impl DistanceTable {
    pub fn from_lengths(lengths: &[u8]) -> std::result::Result<Self, DeflateError> {
        let code = CanonicalCode::from_lengths(lengths)?;
        let mut lut = vec![0u16; 1 << LUT_BITS];
        for (symbol, length, reversed) in code.iter_codes() {
            let entry = symbol | (length << LENGTH_SHIFT) as u16;
            let stride = 1u32 << length;
            let mut index = reversed as u32;
            while index < lut.len() as u32 {
                lut[index as usize] = entry;
                index += stride;
            }
        }
        Ok(Self { code, lut })
    }

    pub fn decode(&self, reader: &mut BitReader) -> Result<u16> {
        match reader.peek(LUT_BITS)? {
            Some(bits) => {
                let entry = self.lut[bits as usize];
                let length = (entry >> LENGTH_SHIFT) as u32;
                if length == 0 {
                    return Err(DeflateError::InvalidHuffmanCode.into());
                }
                reader.seek_after_peek(length);
                Ok(entry & SYMBOL_MASK)
            }
            None => self.code.decode(reader),
        }
    }
}

/// Double-literal cached table for the literal/length alphabet.
///
/// Entry layout per 15-bit key: `[first | total_length << LENGTH_SHIFT,
/// second-or-NONE]`. Two symbols are cached only when the first one is a pure
/// literal; length symbols consume extra bits after their code, which the
/// merged key cannot represent.
pub struct LitLenTable {
    code: CanonicalCode,
    lut: Vec<u16>,
}

impl LitLenTable {
    pub fn from_lengths(lengths: &[u8]) -> std::result::Result<Self, DeflateError> {
        let code = CanonicalCode::from_lengths(lengths)?;
        if code.is_empty() {
            return Err(DeflateError::EmptyAlphabet);
        }
        let mut lut = vec![0u16; 2 << LUT_BITS];

        for (symbol, length, reversed) in code.iter_codes() {
            if symbol >= 256 || length + code.min_length > LUT_BITS {
                // Single-symbol entries for every filler-bit pattern.
                let entry = symbol | ((length << LENGTH_SHIFT) as u16);
                let stride = 1u32 << length;
                let mut index = reversed as u32;
                while index < (1 << LUT_BITS) {
                    lut[2 * index as usize] = entry;
                    lut[2 * index as usize + 1] = NONE_SYMBOL;
                    index += stride;
                }
                continue;
            }

            for (symbol2, length2, reversed2) in code.iter_codes() {
                let total = length + length2;
                if total > LUT_BITS {
                    // The second code is truncated by the key width; fall
                    // back to caching only the first symbol there.
                    let index = (((reversed2 as u32) << length) | reversed as u32)
                        & ((1 << LUT_BITS) - 1);
                    lut[2 * index as usize] = symbol | ((length << LENGTH_SHIFT) as u16);
                    lut[2 * index as usize + 1] = NONE_SYMBOL;
                } else {
                    let merged = ((reversed2 as u32) << length) | reversed as u32;
                    let entry = symbol | ((total << LENGTH_SHIFT) as u16);
                    let stride = 1u32 << total;
                    let mut index = merged;
                    while index < (1 << LUT_BITS) {
                        lut[2 * index as usize] = entry;
                        lut[2 * index as usize + 1] = symbol2;
                        index += stride;
                    }
                }
            }
        }

        Ok(Self { code, lut })
    }

    /// Decodes one symbol. A second symbol resolved by the same lookup is
    /// parked in `pending` and returned by the next call.
    pub fn decode(&self, reader: &mut BitReader, pending: &mut u16) -> Result<u16> {
        if *pending != NONE_SYMBOL {
            let symbol = *pending;
            *pending = NONE_SYMBOL;
            return Ok(symbol);
        }

        match reader.peek(LUT_BITS)? {
            Some(bits) => {
                let first = self.lut[2 * bits as usize];
                let length = (first >> LENGTH_SHIFT) as u32;
                if length == 0 {
                    return Err(DeflateError::InvalidHuffmanCode.into());
                }
                reader.seek_after_peek(length);
                *pending = self.lut[2 * bits as usize + 1];
                Ok(first & SYMBOL_MASK)
            }
            // Too close to the end of the source for a full peek; the gzip
            // footer normally guarantees enough trailing bits, so this only
            // triggers on raw deflate tails.
            None => self.code.decode(reader),
        }
    }

    /// Resets any cached second symbol, e.g. after a seek.
    pub fn fresh_pending() -> u16 {
        NONE_SYMBOL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use std::sync::Arc;

    fn reader_from_bits(bits: &[u8]) -> BitReader {
        // Packs a sequence of single bits LSB-first into bytes.
        let mut bytes = vec![0u8; (bits.len() + 7) / 8 + 8];
        for (i, &bit) in bits.iter().enumerate() {
            bytes[i / 8] |= bit << (i % 8);
        }
        BitReader::new(Arc::new(MemorySource::new(bytes)))
    }

    #[test]
    fn rejects_oversubscribed_lengths() {
        assert_eq!(
            CanonicalCode::from_lengths(&[1, 1, 1]).err(),
            Some(DeflateError::OversubscribedAlphabet)
        );
        assert_eq!(
            CanonicalCode::from_lengths(&[2, 2, 2, 2, 1]).err(),
            Some(DeflateError::OversubscribedAlphabet)
        );
    }

    #[test]
    fn rejects_bloating_lengths() {
        assert_eq!(
            CanonicalCode::from_lengths(&[1, 0, 0]).err(),
            None,
            "single one-bit code is a permitted degenerate form"
        );
        assert_eq!(
            CanonicalCode::from_lengths(&[2, 0, 0]).err(),
            Some(DeflateError::BloatingAlphabet)
        );
        assert_eq!(
            CanonicalCode::from_lengths(&[1, 2, 0]).err(),
            Some(DeflateError::BloatingAlphabet)
        );
    }

    #[test]
    fn empty_alphabet_builds_but_never_decodes() {
        let code = CanonicalCode::from_lengths(&[0, 0, 0, 0]).unwrap();
        assert!(code.is_empty());
        let mut reader = reader_from_bits(&[0, 1, 0, 1]);
        assert!(code.decode(&mut reader).is_err());
    }

    #[test]
    fn canonical_assignment_breaks_ties_by_symbol_index() {
        // Lengths: A=2, B=1, C=3, D=3 gives codes B=0, A=10, C=110, D=111.
        let code = CanonicalCode::from_lengths(&[2, 1, 3, 3]).unwrap();

        let mut reader = reader_from_bits(&[0, /*A*/ 1, 0, /*D*/ 1, 1, 1, /*C*/ 1, 1, 0]);
        assert_eq!(code.decode(&mut reader).unwrap(), 1);
        assert_eq!(code.decode(&mut reader).unwrap(), 0);
        assert_eq!(code.decode(&mut reader).unwrap(), 3);
        assert_eq!(code.decode(&mut reader).unwrap(), 2);
    }

    #[test]
    fn distance_table_matches_bitwise_decode() {
        let lengths = [3u8, 3, 3, 3, 3, 2, 4, 4];
        let table = DistanceTable::from_lengths(&lengths).unwrap();
        let code = CanonicalCode::from_lengths(&lengths).unwrap();

        // 64 random-ish bits; decode the same stream both ways.
        let bits: Vec<u8> = (0..64).map(|i| ((i * 7 + 3) % 5 == 0) as u8).collect();
        let mut fast = reader_from_bits(&bits);
        let mut slow = reader_from_bits(&bits);
        for _ in 0..8 {
            assert_eq!(
                table.decode(&mut fast).unwrap(),
                code.decode(&mut slow).unwrap()
            );
            assert_eq!(fast.tell(), slow.tell());
        }
    }

    #[test]
    fn litlen_table_decodes_pairs() {
        // Two-symbol alphabet with one-bit codes: every 15-bit key caches
        // two symbols at once.
        let mut lengths = vec![0u8; 257];
        lengths[65] = 1; // 'A'
        lengths[66] = 1; // 'B'
        // Keep the code complete; symbol 256 is absent in this toy alphabet.
        let table = LitLenTable::from_lengths(&lengths).unwrap();

        let mut reader = reader_from_bits(&[0, 1, 1, 0]);
        let mut pending = LitLenTable::fresh_pending();
        assert_eq!(table.decode(&mut reader, &mut pending).unwrap(), 65);
        // Second symbol must come from the pair cache without advancing.
        let position = reader.tell();
        assert_eq!(table.decode(&mut reader, &mut pending).unwrap(), 66);
        assert_eq!(reader.tell(), position);
        assert_eq!(table.decode(&mut reader, &mut pending).unwrap(), 66);
        assert_eq!(table.decode(&mut reader, &mut pending).unwrap(), 65);
    }

    #[test]
    fn litlen_table_matches_bitwise_decode_on_fixed_code() {
        let lengths = fixed_litlen_lengths();
        let table = LitLenTable::from_lengths(&lengths).unwrap();
        let code = CanonicalCode::from_lengths(&lengths).unwrap();

        let bits: Vec<u8> = (0..512).map(|i| ((i * 11 + 5) % 3 == 0) as u8).collect();
        let mut fast = reader_from_bits(&bits);
        let mut slow = reader_from_bits(&bits);
        let mut pending = LitLenTable::fresh_pending();
        let mut decoded = 0;
        while decoded < 20 {
            let expected = code.decode(&mut slow).unwrap();
            assert_eq!(table.decode(&mut fast, &mut pending).unwrap(), expected);
            decoded += 1;
            if pending != NONE_SYMBOL {
                // Consume the cached partner and re-sync the slow reader.
                let expected = code.decode(&mut slow).unwrap();
                assert_eq!(table.decode(&mut fast, &mut pending).unwrap(), expected);
                decoded += 1;
            }
            assert_eq!(fast.tell(), slow.tell());
        }
    }

    pub fn fixed_litlen_lengths() -> Vec<u8> {
        let mut lengths = vec![8u8; 288];
        lengths[144..256].fill(9);
        lengths[256..280].fill(7);
        lengths
    }
}
