//! Constants and limits for stem counting
//!
//! This module defines the supported k-mer lengths, thread limits and the
//! numeric ceilings shared by the counting, spilling and export code.

/// Number of distinct nucleotide codes
pub const NUM_BASES: usize = 4;

/// Number of sample kinds (normal, tumor)
pub const NUM_KINDS: usize = 2;

/// Largest value a per-cell counter can hold
pub const COUNTER_MAX: u16 = u16::MAX;

/// Minimum k-mer length (a stem must keep at least 3 bases)
pub const MIN_K: usize = 5;

/// Maximum k-mer length (the stem must fit a 64-bit key)
pub const MAX_K: usize = 34;

/// Maximum number of loader threads
pub const MAX_LOADERS: usize = 256;

/// Maximum number of shards per partition
pub const MAX_SHARDS: usize = 4096;

/// Maximum router window width in bases (4^12 buckets)
pub const MAX_ROUTER_WINDOW: usize = 12;

/// Default k-mer length
pub const DEFAULT_K: usize = 31;

/// Default number of updates per batch
pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Default number of batches a single queue can hold
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default target size of a shard table (entries)
pub const DEFAULT_TABLE_TARGET_SIZE: usize = 1 << 22;

/// Default initial capacity of the singleton cache (entries)
pub const DEFAULT_CACHE_TARGET_SIZE: usize = 1 << 22;

/// Default fraction of the target size that triggers a spill
pub const DEFAULT_SPILL_FRACTION: f64 = 0.9;

/// Default number of reads between loader progress messages
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 1_000_000;

/// Version number
pub const VERSION: (u8, u8, u8) = (0, 1, 0);

/// Check if a k-mer length is supported
#[inline]
pub const fn is_valid_k(k: usize) -> bool {
    k >= MIN_K && k <= MAX_K
}

/// Stem length for a given k-mer length
#[inline]
pub const fn stem_len(k: usize) -> usize {
    k - 2
}

/// Bit mask covering a key of `len` bases
#[inline]
pub const fn key_mask(len: usize) -> u64 {
    if len >= 32 {
        u64::MAX
    } else {
        (1u64 << (2 * len)) - 1
    }
}

/// Compute floor(log2(x)) for x >= 1, 0 for x == 0.
#[inline]
pub const fn floor_log2(x: u64) -> usize {
    if x <= 1 {
        0
    } else {
        63 - x.leading_zeros() as usize
    }
}
