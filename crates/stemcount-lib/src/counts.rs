//! Saturating count matrices
//!
//! A [`StemCounts`] holds, for one stem, how often each
//! (first base, last base, sample kind) combination of the enclosing k-mer
//! was observed. A [`RootCounts`] pairs the two matrices of a root, one per
//! [`Orientation`].
//!
//! Counters are 16 bits wide and saturate: an increment that would exceed
//! [`COUNTER_MAX`] leaves the counter unchanged.

use crate::constants::{COUNTER_MAX, NUM_BASES, NUM_KINDS};
use crate::kmer::Orientation;

/// Which input stream a read came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SampleKind {
    /// Matched normal sample
    Normal = 0,
    /// Tumor sample
    Tumor = 1,
}

impl SampleKind {
    /// Index into the kind axis of a matrix
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Build from a 2-bit code; anything but 1 is `Normal`
    #[inline]
    pub const fn from_code(code: u8) -> Self {
        if code == 1 {
            SampleKind::Tumor
        } else {
            SampleKind::Normal
        }
    }
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleKind::Normal => write!(f, "normal"),
            SampleKind::Tumor => write!(f, "tumor"),
        }
    }
}

/// Number of counters in one stem matrix
pub const STEM_CELLS: usize = NUM_BASES * NUM_BASES * NUM_KINDS;

/// 4x4x2 grid of saturating counters indexed by [first][last][kind]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StemCounts {
    cells: [[[u16; NUM_KINDS]; NUM_BASES]; NUM_BASES],
}

impl StemCounts {
    /// All-zero matrix
    #[inline]
    pub const fn new() -> Self {
        Self {
            cells: [[[0; NUM_KINDS]; NUM_BASES]; NUM_BASES],
        }
    }

    /// Counter for one cell
    #[inline]
    pub fn get(&self, first: u8, last: u8, kind: SampleKind) -> u16 {
        self.cells[first as usize][last as usize][kind.index()]
    }

    /// Overwrite one cell
    #[inline]
    pub fn set(&mut self, first: u8, last: u8, kind: SampleKind, value: u16) {
        self.cells[first as usize][last as usize][kind.index()] = value;
    }

    /// Add one observation, leaving the counter unchanged at the ceiling
    #[inline]
    pub fn increment(&mut self, first: u8, last: u8, kind: SampleKind) {
        let cell = &mut self.cells[first as usize][last as usize][kind.index()];
        if let Some(next) = cell.checked_add(1) {
            *cell = next;
        }
    }

    /// Add every cell of `other` into `self`, saturating at the ceiling
    pub fn merge_from(&mut self, other: &StemCounts) {
        for (dst, src) in self.iter_cells_mut().zip(other.iter_cells()) {
            *dst = dst.saturating_add(src);
        }
    }

    /// Sum over every cell
    pub fn total(&self) -> u64 {
        self.iter_cells().map(u64::from).sum()
    }

    /// Sum over one sample kind
    pub fn total_of(&self, kind: SampleKind) -> u64 {
        self.cells
            .iter()
            .flatten()
            .map(|pair| u64::from(pair[kind.index()]))
            .sum()
    }

    /// True when no observation was recorded
    pub fn is_empty(&self) -> bool {
        self.iter_cells().all(|c| c == 0)
    }

    /// Counters in [first][last][kind] order
    pub fn iter_cells(&self) -> impl Iterator<Item = u16> + '_ {
        self.cells.iter().flatten().flatten().copied()
    }

    fn iter_cells_mut(&mut self) -> impl Iterator<Item = &mut u16> {
        self.cells.iter_mut().flatten().flatten()
    }

    /// Flatten to [`STEM_CELLS`] counters in [first][last][kind] order
    pub fn to_array(&self) -> [u16; STEM_CELLS] {
        let mut out = [0u16; STEM_CELLS];
        for (dst, src) in out.iter_mut().zip(self.iter_cells()) {
            *dst = src;
        }
        out
    }

    /// Inverse of [`to_array`](Self::to_array)
    pub fn from_array(values: &[u16; STEM_CELLS]) -> Self {
        let mut counts = Self::new();
        for (dst, &src) in counts.iter_cells_mut().zip(values.iter()) {
            *dst = src;
        }
        counts
    }

    /// (normal, tumor) pair for a (first, last) combination
    #[inline]
    pub fn pair(&self, first: u8, last: u8) -> (u16, u16) {
        let cell = self.cells[first as usize][last as usize];
        (cell[SampleKind::Normal.index()], cell[SampleKind::Tumor.index()])
    }
}

/// The two stem matrices of a root, indexed by orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootCounts {
    by_orientation: [StemCounts; 2],
}

impl RootCounts {
    /// Both matrices zeroed
    pub const fn new() -> Self {
        Self {
            by_orientation: [StemCounts::new(); 2],
        }
    }

    /// Matrix for one orientation
    #[inline]
    pub fn get(&self, orientation: Orientation) -> &StemCounts {
        &self.by_orientation[orientation.index()]
    }

    /// Mutable matrix for one orientation
    #[inline]
    pub fn get_mut(&mut self, orientation: Orientation) -> &mut StemCounts {
        &mut self.by_orientation[orientation.index()]
    }

    /// Add both matrices of `other` into `self`
    pub fn merge_from(&mut self, other: &RootCounts) {
        for (dst, src) in self.by_orientation.iter_mut().zip(other.by_orientation.iter()) {
            dst.merge_from(src);
        }
    }

    /// True when neither orientation holds an observation
    pub fn is_empty(&self) -> bool {
        self.by_orientation.iter().all(StemCounts::is_empty)
    }

    /// (orientation, matrix) pairs
    pub fn iter(&self) -> impl Iterator<Item = (Orientation, &StemCounts)> {
        [Orientation::Forward, Orientation::Reverse]
            .into_iter()
            .zip(self.by_orientation.iter())
    }
}

/// Coarse normal/tumor asymmetry predicate applied before a matrix is committed
///
/// A matrix passes when at least one (first, last) cell is either
/// tumor-enriched (`normal <= max_normal && tumor >= min_tumor`) or
/// tumor-depleted (`tumor <= max_tumor && normal >= min_normal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreFilter {
    /// Largest normal count allowed for a tumor-enriched cell
    pub max_normal: u16,
    /// Smallest tumor count required for a tumor-enriched cell
    pub min_tumor: u16,
    /// Largest tumor count allowed for a tumor-depleted cell
    pub max_tumor: u16,
    /// Smallest normal count required for a tumor-depleted cell
    pub min_normal: u16,
}

impl Default for PreFilter {
    fn default() -> Self {
        Self {
            max_normal: 1,
            min_tumor: 4,
            max_tumor: 1,
            min_normal: 4,
        }
    }
}

impl PreFilter {
    /// Whether any cell of `counts` satisfies either direction
    pub fn passes(&self, counts: &StemCounts) -> bool {
        (0..NUM_BASES as u8).any(|first| {
            (0..NUM_BASES as u8).any(|last| {
                let (normal, tumor) = counts.pair(first, last);
                (normal <= self.max_normal && tumor >= self.min_tumor)
                    || (tumor <= self.max_tumor && normal >= self.min_normal)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_get() {
        let mut counts = StemCounts::new();
        counts.increment(0, 3, SampleKind::Normal);
        counts.increment(0, 3, SampleKind::Normal);
        counts.increment(2, 1, SampleKind::Tumor);

        assert_eq!(counts.get(0, 3, SampleKind::Normal), 2);
        assert_eq!(counts.get(0, 3, SampleKind::Tumor), 0);
        assert_eq!(counts.get(2, 1, SampleKind::Tumor), 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.total_of(SampleKind::Normal), 2);
        assert_eq!(counts.total_of(SampleKind::Tumor), 1);
    }

    #[test]
    fn test_increment_saturates() {
        let mut counts = StemCounts::new();
        for _ in 0..70_000 {
            counts.increment(1, 2, SampleKind::Tumor);
        }
        assert_eq!(counts.get(1, 2, SampleKind::Tumor), COUNTER_MAX);
        assert_eq!(counts.total(), u64::from(COUNTER_MAX));
    }

    #[test]
    fn test_merge_saturates() {
        let mut a = StemCounts::new();
        let mut b = StemCounts::new();
        a.set(3, 3, SampleKind::Normal, 60_000);
        b.set(3, 3, SampleKind::Normal, 10_000);
        b.set(0, 0, SampleKind::Tumor, 7);

        a.merge_from(&b);
        assert_eq!(a.get(3, 3, SampleKind::Normal), COUNTER_MAX);
        assert_eq!(a.get(0, 0, SampleKind::Tumor), 7);
    }

    #[test]
    fn test_array_layout() {
        let mut counts = StemCounts::new();
        counts.set(0, 0, SampleKind::Tumor, 5);
        counts.set(3, 3, SampleKind::Tumor, 9);
        let arr = counts.to_array();
        assert_eq!(arr[1], 5);
        assert_eq!(arr[STEM_CELLS - 1], 9);
        assert_eq!(StemCounts::from_array(&arr), counts);
    }

    #[test]
    fn test_root_counts_orientation() {
        let mut root = RootCounts::new();
        assert!(root.is_empty());
        root.get_mut(Orientation::Reverse).increment(0, 0, SampleKind::Tumor);
        assert!(root.get(Orientation::Forward).is_empty());
        assert_eq!(root.get(Orientation::Reverse).total(), 1);
        assert!(!root.is_empty());
    }

    #[test]
    fn test_pre_filter_directions() {
        let filter = PreFilter::default();

        let mut gain = StemCounts::new();
        gain.set(1, 1, SampleKind::Tumor, 5);
        assert!(filter.passes(&gain));

        let mut loss = StemCounts::new();
        loss.set(2, 0, SampleKind::Normal, 6);
        loss.set(2, 0, SampleKind::Tumor, 1);
        assert!(filter.passes(&loss));

        let mut balanced = StemCounts::new();
        balanced.set(0, 0, SampleKind::Normal, 10);
        balanced.set(0, 0, SampleKind::Tumor, 10);
        assert!(!filter.passes(&balanced));

        assert!(!filter.passes(&StemCounts::new()));
    }
}
