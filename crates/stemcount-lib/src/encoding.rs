//! DNA nucleotide encoding
//!
//! Two-bit codes in alphabet order:
//! - A (65/97)  -> 00
//! - C (67/99)  -> 01
//! - G (71/103) -> 10
//! - T (84/116) -> 11
//!
//! With this order the complement of a code `c` is `3 - c`, i.e. `c ^ 0b11`.

use thiserror::Error;

/// Error type for encoding operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The input byte is not a valid DNA base (A/C/G/T)
    #[error("Invalid DNA base {base:?} at position {position}")]
    InvalidBase {
        /// Offending byte
        base: u8,
        /// Position of the byte in the input
        position: usize,
    },
    /// The input string length does not match the expected length
    #[error("Sequence length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Expected length
        expected: usize,
        /// Actual string length
        actual: usize,
    },
}

/// Sentinel for bytes outside the ACGT alphabet in [`BASE_CODES`]
pub const INVALID_CODE: u8 = 0xFF;

/// Byte -> 2-bit code lookup, [`INVALID_CODE`] for anything that is not ACGT
pub const BASE_CODES: [u8; 256] = {
    let mut table = [INVALID_CODE; 256];
    table[b'A' as usize] = 0;
    table[b'a' as usize] = 0;
    table[b'C' as usize] = 1;
    table[b'c' as usize] = 1;
    table[b'G' as usize] = 2;
    table[b'g' as usize] = 2;
    table[b'T' as usize] = 3;
    table[b't' as usize] = 3;
    table
};

/// Encode a single DNA nucleotide to 2 bits
#[inline]
pub const fn encode_base(base: u8) -> Option<u8> {
    match BASE_CODES[base as usize] {
        INVALID_CODE => None,
        code => Some(code),
    }
}

/// Decode a 2-bit value to DNA nucleotide (uppercase)
#[inline]
pub const fn decode_base(bits: u8) -> u8 {
    match bits & 0b11 {
        0b00 => b'A',
        0b01 => b'C',
        0b10 => b'G',
        _ => b'T',
    }
}

/// Get the complement of an encoded base
#[inline]
pub const fn complement_base(bits: u8) -> u8 {
    bits ^ 0b11
}

/// Check whether a byte is one of A/C/G/T (either case)
#[inline]
pub const fn is_acgt(base: u8) -> bool {
    BASE_CODES[base as usize] != INVALID_CODE
}

/// Complement an ASCII base, preserving anything outside ACGT as `N`
#[inline]
pub const fn complement_ascii(base: u8) -> u8 {
    match BASE_CODES[base as usize] {
        INVALID_CODE => b'N',
        code => decode_base(complement_base(code)),
    }
}

/// Reverse-complement an ASCII sequence in place
pub fn reverse_complement_in_place(seq: &mut [u8]) {
    seq.reverse();
    for base in seq.iter_mut() {
        *base = complement_ascii(*base);
    }
}

/// Reverse-complement an ASCII sequence into a new buffer
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&b| complement_ascii(b)).collect()
}

/// Validate that every byte of `seq` is A/C/G/T
///
/// # Errors
/// Returns the first offending byte and its position
pub fn validate(seq: &[u8]) -> Result<(), EncodingError> {
    match seq.iter().position(|&b| !is_acgt(b)) {
        Some(position) => Err(EncodingError::InvalidBase {
            base: seq[position],
            position,
        }),
        None => Ok(()),
    }
}
