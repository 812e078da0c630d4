//! Hot-path validation of dynamic-block precodes.
//!
//! The generic block finder probes millions of bit offsets per second; almost
//! all of them are garbage. Before any Huffman table is built, the 4-bit HCLEN
//! plus the following 57 bits of 3-bit code-length codes are checked against a
//! precomputed table of all code-length histograms that form a canonical
//! Huffman code.
//!
//! Representation: a histogram packed into one `u32` with variable-width bins,
//! sized to the maximum count each code length can reach in a *valid* code
//! (e.g. at most two 1-bit codes). Partial histograms for 4 symbols at a time
//! come from a lookup table and are summed with plain additions; carries
//! across bin boundaries are detected afterwards via carryless (xor) sums.
//! Overflow can only turn a valid histogram into an invalid-looking one,
//! never the reverse, except for a handful of maximal histograms whose
//! correct bin value does not fit its width; those are matched explicitly
//! before the overflow check.

use crate::error::{Error, Result};
use std::sync::LazyLock;

/// Each precode code length is transmitted as 3 bits.
pub const PRECODE_BITS: u32 = 3;
/// At most 19 code-length codes (HCLEN = 4..19).
pub const MAX_PRECODE_COUNT: u32 = 19;

/// Bin bit widths: `[non-zero count, count(1), count(2), …, count(7)]`.
const MEMBER_BIT_WIDTHS: [u32; 8] = [5, 1, 2, 3, 4, 5, 5, 4];

const fn member_offsets() -> [u32; 8] {
    let mut offsets = [0u32; 8];
    let mut sum = 0;
    let mut i = 0;
    while i < 8 {
        offsets[i] = sum;
        sum += MEMBER_BIT_WIDTHS[i];
        i += 1;
    }
    offsets
}

const MEMBER_OFFSETS: [u32; 8] = member_offsets();
/// First bit past the last bin; additions overflowing any bin spill here or
/// into the next bin's lowest bit.
const OVERFLOW_MEMBER_OFFSET: u32 = 29;

const fn lowest_member_bits_mask() -> u32 {
    let mut mask = 0u32;
    let mut i = 0;
    while i < 8 {
        mask |= 1 << MEMBER_OFFSETS[i];
        i += 1;
    }
    mask
}

/// Bits that must stay clear after summing partial histograms: the lowest bit
/// of every bin (a carry from the bin below) plus everything at and above the
/// overflow offset.
const OVERFLOW_BITS_MASK: u32 = lowest_member_bits_mask() | (!0u32 << OVERFLOW_MEMBER_OFFSET);

/// Histogram bits used for the validity lookup: all bins except the non-zero
/// count, 24 bits total.
const HISTOGRAM_LOOKUP_BITS: u32 = 24;

const fn increment_count(histogram: u32, value: usize) -> u32 {
    let old = (histogram >> MEMBER_OFFSETS[value]) & ((1 << MEMBER_BIT_WIDTHS[value]) - 1);
    let incremented = histogram + (1 << MEMBER_OFFSETS[value]);
    if old + 1 < (1 << MEMBER_BIT_WIDTHS[value]) {
        incremented
    } else {
        incremented | (1 << OVERFLOW_MEMBER_OFFSET)
    }
}

const fn histogram_of_4_precodes(values: u32) -> u32 {
    let mut histogram = 0u32;
    let mut i = 0;
    while i < 4 {
        let value = ((values >> (i * PRECODE_BITS)) & 0b111) as usize;
        if value > 0 {
            histogram = increment_count(histogram, value);
            histogram += 1; // non-zero count in the lowest bin
        }
        i += 1;
    }
    histogram
}

const fn build_partial_histogram_lut() -> [u32; 1 << (4 * PRECODE_BITS as usize)] {
    let mut lut = [0u32; 1 << (4 * PRECODE_BITS as usize)];
    let mut i = 0;
    while i < lut.len() {
        lut[i] = histogram_of_4_precodes(i as u32);
        i += 1;
    }
    lut
}

/// 12-bit chunk of four 3-bit code lengths -> packed partial histogram.
static PRECODE_X4_TO_HISTOGRAM: [u32; 4096] = build_partial_histogram_lut();

/// Packs a plain `counts[1..=7]` histogram into the 24-bit lookup image.
/// Returns `None` when a count does not fit its bin (the overflow specials).
fn pack_histogram(counts: &[u32; 8]) -> Option<u32> {
    let mut packed = 0u32;
    for depth in 1..8 {
        if counts[depth] >= 1 << MEMBER_BIT_WIDTHS[depth] {
            return None;
        }
        packed |= counts[depth] << (MEMBER_OFFSETS[depth] - MEMBER_BIT_WIDTHS[0]);
    }
    Some(packed)
}

/// Calls `visit` with every code-length histogram that forms a canonical
/// Huffman code over at most [`MAX_PRECODE_COUNT`] symbols: complete codes
/// plus the degenerate single one-bit code.
fn for_each_valid_histogram(visit: &mut dyn FnMut(&[u32; 8])) {
    fn recurse(depth: usize, unused: u32, total: u32, counts: &mut [u32; 8], visit: &mut dyn FnMut(&[u32; 8])) {
        if depth == 8 {
            let valid = if total == 1 {
                counts[1] == 1
            } else {
                total > 1 && unused == 0
            };
            if valid {
                visit(counts);
            }
            return;
        }
        let limit = unused.min(MAX_PRECODE_COUNT - total);
        for count in 0..=limit {
            counts[depth] = count;
            recurse(depth + 1, (unused - count) * 2, total + count, counts, visit);
        }
        counts[depth] = 0;
    }
    let mut counts = [0u32; 8];
    recurse(1, 2, 0, &mut counts, visit);
}

/// Bitset over the 24-bit histogram image: bit set <=> valid histogram.
static VALID_HISTOGRAMS: LazyLock<Box<[u64]>> = LazyLock::new(|| {
    let mut bitset = vec![0u64; (1usize << HISTOGRAM_LOOKUP_BITS) / 64].into_boxed_slice();
    for_each_valid_histogram(&mut |counts| {
        if let Some(packed) = pack_histogram(counts) {
            bitset[(packed / 64) as usize] |= 1 << (packed % 64);
        }
    });
    bitset
});

/// Valid histograms whose packed form overflows a bin, keyed by their
/// non-zero symbol count (which identifies each uniquely):
///
/// | non-zero | histogram            | overflowing bin |
/// |---------:|----------------------|-----------------|
/// |        1 | `1:1`                | none (kept for the fast accept path) |
/// |        2 | `1:2`                | count(1), 1 bit |
/// |        4 | `2:4`                | count(2), 2 bits |
/// |        8 | `3:8`                | count(3), 3 bits |
/// |       16 | `4:16`               | count(4), 4 bits |
/// |       19 | `1:1 2:1 3:1 7:16`   | count(7), 4 bits |
///
/// The table stores the 24-bit image that the overflowed *sum* produces, so a
/// straight comparison against the computed histogram matches exactly these
/// inputs. Every other entry holds `u32::MAX`, which no 24-bit image equals.
const OVERFLOW_SPECIAL_CASES: [u32; 32] = build_overflow_special_cases();

const fn overflowed_image(counts: [u32; 8]) -> u32 {
    // Plain additions, exactly like the summation in `check_precode`,
    // truncated to the 24 lookup bits.
    let mut sum = 0u32;
    let mut depth = 1;
    while depth < 8 {
        sum += counts[depth] << MEMBER_OFFSETS[depth];
        depth += 1;
    }
    (sum >> MEMBER_BIT_WIDTHS[0]) & ((1 << HISTOGRAM_LOOKUP_BITS) - 1)
}

const fn build_overflow_special_cases() -> [u32; 32] {
    let mut table = [u32::MAX; 32];
    table[1] = overflowed_image([0, 1, 0, 0, 0, 0, 0, 0]);
    table[2] = overflowed_image([0, 2, 0, 0, 0, 0, 0, 0]);
    table[4] = overflowed_image([0, 0, 4, 0, 0, 0, 0, 0]);
    table[8] = overflowed_image([0, 0, 0, 8, 0, 0, 0, 0]);
    table[16] = overflowed_image([0, 0, 0, 0, 16, 0, 0, 0]);
    table[19] = overflowed_image([0, 1, 1, 1, 0, 0, 0, 16]);
    table
}

/// Validates a dynamic-block precode given HCLEN (`next_4_bits`) and the
/// following 57 bits of code-length codes. `next_57_bits` may contain
/// arbitrary bits past the actual code-length codes; they are masked off.
///
/// Accepts every histogram a canonical Huffman constructor would accept and
/// rejects the overwhelming majority of garbage. False positives are fine
/// (the caller builds the real tables next); false negatives are not.
pub fn check_precode(next_4_bits: u64, next_57_bits: u64) -> Result<()> {
    let code_length_count = 4 + next_4_bits as u32;
    let precode_bits = next_57_bits & lowest_bits(code_length_count * PRECODE_BITS);

    let mut frequencies: u32 = 0;
    let mut overflows_in_sum: u32 = 0;
    let mut overflows_in_lut: u32 = 0;

    for chunk in 0..5 {
        let mut precode_chunk = (precode_bits >> (chunk * 4 * PRECODE_BITS)) as u32;
        if chunk != 4 {
            precode_chunk &= 0xFFF;
        }
        let partial = PRECODE_X4_TO_HISTOGRAM[precode_chunk as usize];

        // Carryless (xor) vs real sum: any differing bit saw a carry from a
        // lower bin. Masking is deferred to the final check.
        let carryless = frequencies ^ partial;
        frequencies = frequencies.wrapping_add(partial);
        overflows_in_sum |= carryless ^ frequencies;
        overflows_in_lut |= partial;
    }

    let histogram = (frequencies >> MEMBER_BIT_WIDTHS[0]) & lowest_bits(HISTOGRAM_LOOKUP_BITS) as u32;
    let non_zero_count = frequencies & lowest_bits(MEMBER_BIT_WIDTHS[0]) as u32;

    if OVERFLOW_SPECIAL_CASES[non_zero_count as usize] == histogram {
        return Ok(());
    }

    if overflows_in_sum & OVERFLOW_BITS_MASK != 0
        || overflows_in_lut & (!0u32 << OVERFLOW_MEMBER_OFFSET) != 0
    {
        return Err(Error::InvalidPrecode);
    }

    let word = VALID_HISTOGRAMS[(histogram / 64) as usize];
    if word & (1u64 << (histogram % 64)) == 0 {
        return Err(Error::InvalidPrecode);
    }
    Ok(())
}

#[inline]
const fn lowest_bits(count: u32) -> u64 {
    if count == 0 {
        0
    } else {
        u64::MAX >> (64 - count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeflateError;
    use crate::huffman::CanonicalCode;
    use rand::prelude::*;

    /// Packs a code-length vector into the `(next4, next57)` pair the
    /// validator consumes.
    fn encode_precode(lengths: &[u8]) -> (u64, u64) {
        assert!((4..=19).contains(&lengths.len()));
        let mut bits = 0u64;
        for (i, &length) in lengths.iter().enumerate() {
            assert!(length < 8);
            bits |= (length as u64) << (i as u32 * PRECODE_BITS);
        }
        ((lengths.len() - 4) as u64, bits)
    }

    /// Reference verdict: does a canonical Huffman code exist for these
    /// lengths? Matches the deflate rules the real table builder enforces.
    fn brute_force_valid(lengths: &[u8]) -> bool {
        match CanonicalCode::from_lengths(lengths) {
            Ok(code) => !code.is_empty(),
            Err(DeflateError::OversubscribedAlphabet | DeflateError::BloatingAlphabet) => false,
            Err(_) => false,
        }
    }

    #[test]
    fn accepts_simple_valid_precodes() {
        // Two 1-bit codes.
        let (a, b) = encode_precode(&[1, 1, 0, 0]);
        check_precode(a, b).unwrap();
        // Complete mixed code: 1/2 + 1/4 + 2/8 = 1.
        let (a, b) = encode_precode(&[1, 2, 3, 3]);
        check_precode(a, b).unwrap();
        // A realistic 19-symbol prelude: 2/4 + 3/8 + 2/16 = 1.
        let (a, b) = encode_precode(&[2, 0, 3, 0, 2, 3, 0, 4, 0, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0]);
        check_precode(a, b).unwrap();
    }

    #[test]
    fn rejects_simple_invalid_precodes() {
        // Empty alphabet.
        let (a, b) = encode_precode(&[0, 0, 0, 0]);
        assert_eq!(check_precode(a, b), Err(Error::InvalidPrecode));
        // Oversubscribed.
        let (a, b) = encode_precode(&[1, 1, 1, 0]);
        assert_eq!(check_precode(a, b), Err(Error::InvalidPrecode));
        // Bloating.
        let (a, b) = encode_precode(&[2, 2, 2, 0]);
        assert_eq!(check_precode(a, b), Err(Error::InvalidPrecode));
        // Single code longer than one bit.
        let (a, b) = encode_precode(&[0, 0, 3, 0]);
        assert_eq!(check_precode(a, b), Err(Error::InvalidPrecode));
    }

    #[test]
    fn bin_overflow_special_cases_are_accepted() {
        // Each histogram here overflows its packed bin and must be matched
        // by the explicit fixup table.
        let cases: &[&[u8]] = &[
            &[1, 1, 0, 0],
            &[2, 2, 2, 2],
            &[3; 8],
            &[4; 16],
            &[1, 2, 3, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7],
        ];
        for lengths in cases {
            let (a, b) = encode_precode(lengths);
            assert_eq!(check_precode(a, b), Ok(()), "lengths {lengths:?}");
        }

        // One-off variants of the maximal histogram must still be rejected.
        let (a, b) = encode_precode(&[1, 2, 3, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 6]);
        assert_eq!(check_precode(a, b), Err(Error::InvalidPrecode));
        let (a, b) = encode_precode(&[1, 2, 4, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7]);
        assert_eq!(check_precode(a, b), Err(Error::InvalidPrecode));
    }

    #[test]
    fn garbage_after_the_code_lengths_is_ignored() {
        let (a, b) = encode_precode(&[1, 1, 0, 0]);
        check_precode(a, b | (!0u64 << (4 * PRECODE_BITS))).unwrap();
    }

    #[test]
    fn never_rejects_a_valid_histogram_exhaustively() {
        // Every enumerated valid histogram, laid out as a concrete length
        // vector, must pass.
        let mut checked = 0usize;
        for_each_valid_histogram(&mut |counts| {
            let mut lengths = Vec::new();
            for depth in 1..8 {
                for _ in 0..counts[depth] {
                    lengths.push(depth as u8);
                }
            }
            while lengths.len() < 4 {
                lengths.push(0);
            }
            let (a, b) = encode_precode(&lengths);
            assert_eq!(check_precode(a, b), Ok(()), "histogram {counts:?}");
            checked += 1;
        });
        // Sanity: the enumeration covers the known count of valid precode
        // histograms.
        assert_eq!(checked, 1526);
    }

    #[test]
    fn matches_brute_force_on_random_vectors() {
        let mut rng = StdRng::seed_from_u64(0x9E3779B97F4A7C15);
        for _ in 0..20_000 {
            let count = rng.gen_range(4..=19);
            let mut lengths = vec![0u8; count];
            for length in lengths.iter_mut() {
                // Bias towards small lengths so valid codes appear often.
                *length = match rng.gen_range(0..10) {
                    0..=3 => 0,
                    4 => 1,
                    5 => 2,
                    6 => 3,
                    7 => rng.gen_range(4..8),
                    _ => rng.gen_range(0..8),
                };
            }
            let (a, b) = encode_precode(&lengths);
            let fast = check_precode(a, b).is_ok();
            let slow = brute_force_valid(&lengths);
            if slow {
                assert!(fast, "false negative for {lengths:?}");
            } else {
                assert!(!fast, "false positive for {lengths:?}");
            }
        }
    }
}
