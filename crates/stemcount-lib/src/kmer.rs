//! Integer k-mer keys, reverse complements and canonical roots
//!
//! A key packs a nucleotide string 2 bits per base, most significant base
//! first, into the low `2 * len` bits of a `u64`. Stems (the k-mer minus
//! its first and last base) are at most 32 bases long, so a stem always
//! fits one key.
//!
//! A stem's *root* is the smaller of the stem and its reverse complement
//! under integer ordering; the [`Orientation`] records which of the two
//! the stem was.

use crate::constants::key_mask;
use crate::encoding::{decode_base, BASE_CODES, EncodingError, INVALID_CODE};

/// A packed nucleotide string
pub type Key = u64;

/// Which of {stem, reverse complement of stem} equals the root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Orientation {
    /// The stem is its own root
    Forward = 0,
    /// The stem is the reverse complement of its root
    Reverse = 1,
}

impl Orientation {
    /// Build from the low bit of `bit`
    #[inline]
    pub const fn from_bit(bit: u8) -> Self {
        if bit & 1 == 0 {
            Orientation::Forward
        } else {
            Orientation::Reverse
        }
    }

    /// 0 for forward, 1 for reverse
    #[inline]
    pub const fn bit(self) -> u8 {
        self as u8
    }

    /// Index into a per-orientation array
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The opposite orientation
    #[inline]
    pub const fn flip(self) -> Self {
        match self {
            Orientation::Forward => Orientation::Reverse,
            Orientation::Reverse => Orientation::Forward,
        }
    }
}

/// Pack a pre-validated ACGT sequence into a key
///
/// Bytes outside the alphabet are not detected here; callers pass only
/// the ACGT spans produced by the read source.
#[inline]
pub fn encode(seq: &[u8]) -> Key {
    debug_assert!(seq.len() <= 32);
    seq.iter()
        .fold(0u64, |acc, &b| (acc << 2) | (BASE_CODES[b as usize] & 0b11) as u64)
}

/// Pack a sequence into a key, validating length and alphabet
///
/// # Errors
/// Returns an error on a length mismatch or a non-ACGT byte
pub fn try_encode(seq: &[u8], expected_len: usize) -> Result<Key, EncodingError> {
    if seq.len() != expected_len {
        return Err(EncodingError::LengthMismatch {
            expected: expected_len,
            actual: seq.len(),
        });
    }
    let mut key = 0u64;
    for (position, &base) in seq.iter().enumerate() {
        let code = BASE_CODES[base as usize];
        if code == INVALID_CODE {
            return Err(EncodingError::InvalidBase { base, position });
        }
        key = (key << 2) | code as u64;
    }
    Ok(key)
}

/// Append the bases of `key` to `out`
pub fn decode_into(key: Key, len: usize, out: &mut Vec<u8>) {
    out.reserve(len);
    for pos in 0..len {
        out.push(decode_base(base_at(key, len, pos)));
    }
}

/// Unpack a key of `len` bases into an uppercase string
pub fn decode(key: Key, len: usize) -> String {
    let mut out = Vec::with_capacity(len);
    decode_into(key, len, &mut out);
    // decode_base only yields ASCII letters
    out.into_iter().map(char::from).collect()
}

/// Code of the base at `pos` (0 = first base)
#[inline]
pub const fn base_at(key: Key, len: usize, pos: usize) -> u8 {
    ((key >> (2 * (len - 1 - pos))) & 0b11) as u8
}

/// Reverse complement of a key of `len` bases
///
/// Bit-parallel: complement every code, reverse the order of the 2-bit
/// groups, then drop the padding that the reversal moved to the bottom.
#[inline]
pub const fn reverse_complement(key: Key, len: usize) -> Key {
    let mut x = !key;
    x = ((x >> 2) & 0x3333_3333_3333_3333u64) | ((x & 0x3333_3333_3333_3333u64) << 2);
    x = ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0Fu64) | ((x & 0x0F0F_0F0F_0F0F_0F0Fu64) << 4);
    x = x.swap_bytes();
    (x >> (64 - 2 * len)) & key_mask(len)
}

/// Canonical root of a stem and the orientation of the stem relative to it
///
/// A palindromic stem (equal to its own reverse complement) is `Forward`.
#[inline]
pub const fn to_root(stem: Key, len: usize) -> (Key, Orientation) {
    let rc = reverse_complement(stem, len);
    if stem <= rc {
        (stem, Orientation::Forward)
    } else {
        (rc, Orientation::Reverse)
    }
}

/// The stem that a root represents in the given orientation
#[inline]
pub const fn from_root(root: Key, orientation: Orientation, len: usize) -> Key {
    match orientation {
        Orientation::Forward => root,
        Orientation::Reverse => reverse_complement(root, len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding;
    use proptest::prelude::*;

    #[test]
    fn test_encode_msb_first() {
        assert_eq!(encode(b"A"), 0);
        assert_eq!(encode(b"T"), 3);
        assert_eq!(encode(b"AC"), 0b0001);
        assert_eq!(encode(b"CA"), 0b0100);
        assert_eq!(encode(b"ACGT"), 0b00_01_10_11);
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode(0b00_01_10_11, 4), "ACGT");
        assert_eq!(decode(encode(b"GATTACA"), 7), "GATTACA");
        let all_t = key_mask(32);
        assert_eq!(decode(all_t, 32), "T".repeat(32));
    }

    #[test]
    fn test_try_encode_errors() {
        assert_eq!(
            try_encode(b"ACG", 4),
            Err(EncodingError::LengthMismatch { expected: 4, actual: 3 })
        );
        assert_eq!(
            try_encode(b"ACNT", 4),
            Err(EncodingError::InvalidBase { base: b'N', position: 2 })
        );
        assert_eq!(try_encode(b"acgt", 4), Ok(encode(b"ACGT")));
    }

    #[test]
    fn test_reverse_complement_small() {
        assert_eq!(reverse_complement(encode(b"AAAC"), 4), encode(b"GTTT"));
        assert_eq!(reverse_complement(encode(b"ACGT"), 4), encode(b"ACGT"));
        assert_eq!(reverse_complement(encode(b"A"), 1), encode(b"T"));
    }

    #[test]
    fn test_reverse_complement_full_width() {
        let seq = b"ACGTTGCAACGTTGCAGGGGCCCCAAAATTTA";
        assert_eq!(seq.len(), 32);
        let rc = encoding::reverse_complement(seq);
        assert_eq!(reverse_complement(encode(seq), 32), encode(&rc));
    }

    #[test]
    fn test_to_root_poly_a() {
        let a = encode(&[b'A'; 28]);
        let t = encode(&[b'T'; 28]);
        assert_eq!(to_root(a, 28), (a, Orientation::Forward));
        assert_eq!(to_root(t, 28), (a, Orientation::Reverse));
    }

    #[test]
    fn test_palindrome_is_forward() {
        let key = encode(b"ACGT");
        assert_eq!(to_root(key, 4), (key, Orientation::Forward));
    }

    #[test]
    fn test_from_root() {
        let stem = encode(b"TTTG");
        let (root, orientation) = to_root(stem, 4);
        assert_eq!(orientation, Orientation::Reverse);
        assert_eq!(from_root(root, orientation, 4), stem);
        assert_eq!(from_root(root, Orientation::Forward, 4), root);
    }

    proptest! {
        #[test]
        fn prop_key_reverse_complement_matches_string(seq in "[ACGT]{1,32}") {
            let len = seq.len();
            let rc = encoding::reverse_complement(seq.as_bytes());
            prop_assert_eq!(reverse_complement(encode(seq.as_bytes()), len), encode(&rc));
        }

        #[test]
        fn prop_root_is_shared_by_reverse_complement(seq in "[ACGT]{28}") {
            let stem = encode(seq.as_bytes());
            let rc = reverse_complement(stem, 28);
            let (root, orientation) = to_root(stem, 28);
            let (rc_root, rc_orientation) = to_root(rc, 28);
            prop_assert_eq!(root, rc_root);
            if stem != rc {
                prop_assert_eq!(orientation, rc_orientation.flip());
            }
        }

        #[test]
        fn prop_decode_inverts_encode(seq in "[ACGT]{1,32}") {
            prop_assert_eq!(decode(encode(seq.as_bytes()), seq.len()), seq);
        }
    }
}
