//! Single-occurrence cache
//!
//! Most roots are observed exactly once. Instead of materializing a full
//! [`StemCounts`](crate::counts::StemCounts) matrix for them, a shard keeps
//! a one-byte [`CacheEntry`] per root until a second sighting arrives. The
//! second sighting promotes the cached observation into the shard table and
//! flags the entry as promoted, so later sightings of the root go straight
//! to the table.

use ahash::AHashMap;

use crate::counts::SampleKind;
use crate::kmer::{Key, Orientation};

/// Provisional record of a root seen once
///
/// Bit layout (LSB first):
///
/// | bits | field        |
/// |------|--------------|
/// | 0    | orientation  |
/// | 1-2  | first base   |
/// | 3-4  | last base    |
/// | 5-6  | sample kind  |
/// | 7    | promoted     |
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct CacheEntry(u8);

impl CacheEntry {
    const ORIENTATION_SHIFT: u8 = 0;
    const FIRST_SHIFT: u8 = 1;
    const LAST_SHIFT: u8 = 3;
    const KIND_SHIFT: u8 = 5;
    const PROMOTED_BIT: u8 = 1 << 7;

    /// Pack an un-promoted sighting
    #[inline]
    pub const fn new(orientation: Orientation, first: u8, last: u8, kind: SampleKind) -> Self {
        Self(
            (orientation.bit() << Self::ORIENTATION_SHIFT)
                | ((first & 0b11) << Self::FIRST_SHIFT)
                | ((last & 0b11) << Self::LAST_SHIFT)
                | ((kind as u8 & 0b11) << Self::KIND_SHIFT),
        )
    }

    /// Orientation of the cached stem relative to its root
    #[inline]
    pub const fn orientation(self) -> Orientation {
        Orientation::from_bit(self.0 >> Self::ORIENTATION_SHIFT)
    }

    /// First base code of the cached k-mer
    #[inline]
    pub const fn first(self) -> u8 {
        (self.0 >> Self::FIRST_SHIFT) & 0b11
    }

    /// Last base code of the cached k-mer
    #[inline]
    pub const fn last(self) -> u8 {
        (self.0 >> Self::LAST_SHIFT) & 0b11
    }

    /// Sample kind of the cached sighting
    #[inline]
    pub const fn kind(self) -> SampleKind {
        SampleKind::from_code((self.0 >> Self::KIND_SHIFT) & 0b11)
    }

    /// Whether the sighting was already moved into the table
    #[inline]
    pub const fn is_promoted(self) -> bool {
        self.0 & Self::PROMOTED_BIT != 0
    }

    /// Same entry with the promoted flag set
    #[inline]
    pub const fn promoted(self) -> Self {
        Self(self.0 | Self::PROMOTED_BIT)
    }

    /// Raw packed byte
    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("orientation", &self.orientation())
            .field("first", &self.first())
            .field("last", &self.last())
            .field("kind", &self.kind())
            .field("promoted", &self.is_promoted())
            .finish()
    }
}

/// Outcome of recording a sighting in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First sighting of the root; nothing to do in the table
    First,
    /// Second sighting; the returned earlier sighting must be materialized
    Promote(CacheEntry),
    /// The root already lives in the table
    Materialized,
}

/// Root-keyed map of provisional records owned by one shard
#[derive(Debug, Default)]
pub struct SingletonCache {
    entries: AHashMap<Key, CacheEntry>,
}

impl SingletonCache {
    /// Create a cache with room for `capacity` roots
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: AHashMap::with_capacity(capacity),
        }
    }

    /// Record a sighting of `root` and report what the table must do
    #[inline]
    pub fn record(&mut self, root: Key, sighting: CacheEntry) -> Sighting {
        use std::collections::hash_map::Entry;

        match self.entries.entry(root) {
            Entry::Vacant(slot) => {
                slot.insert(sighting);
                Sighting::First
            }
            Entry::Occupied(mut slot) => {
                let cached = *slot.get();
                if cached.is_promoted() {
                    Sighting::Materialized
                } else {
                    slot.insert(cached.promoted());
                    Sighting::Promote(cached)
                }
            }
        }
    }

    /// Mark every un-promoted entry promoted and yield it
    ///
    /// Called once ingestion ends so singleton sightings reach the table.
    pub fn flush_unpromoted(&mut self) -> Vec<(Key, CacheEntry)> {
        let mut flushed = Vec::new();
        for (&root, entry) in self.entries.iter_mut() {
            if !entry.is_promoted() {
                flushed.push((root, *entry));
                *entry = entry.promoted();
            }
        }
        flushed
    }

    /// Number of roots tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no root is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_one_byte() {
        assert_eq!(std::mem::size_of::<CacheEntry>(), 1);
    }

    #[test]
    fn test_entry_fields() {
        let entry = CacheEntry::new(Orientation::Reverse, 2, 3, SampleKind::Tumor);
        assert_eq!(entry.orientation(), Orientation::Reverse);
        assert_eq!(entry.first(), 2);
        assert_eq!(entry.last(), 3);
        assert_eq!(entry.kind(), SampleKind::Tumor);
        assert!(!entry.is_promoted());
        assert_eq!(entry.raw(), 0b0_01_11_10_1);

        let promoted = entry.promoted();
        assert!(promoted.is_promoted());
        assert_eq!(promoted.first(), 2);
        assert_eq!(promoted.kind(), SampleKind::Tumor);
    }

    #[test]
    fn test_record_sequence() {
        let mut cache = SingletonCache::with_capacity(4);
        let first = CacheEntry::new(Orientation::Forward, 0, 1, SampleKind::Normal);
        let second = CacheEntry::new(Orientation::Reverse, 3, 3, SampleKind::Tumor);

        assert_eq!(cache.record(42, first), Sighting::First);
        assert_eq!(cache.record(42, second), Sighting::Promote(first));
        assert_eq!(cache.record(42, second), Sighting::Materialized);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_flush_unpromoted() {
        let mut cache = SingletonCache::with_capacity(4);
        let sighting = CacheEntry::new(Orientation::Forward, 1, 1, SampleKind::Normal);
        cache.record(1, sighting);
        cache.record(2, sighting);
        cache.record(2, sighting);

        let flushed = cache.flush_unpromoted();
        assert_eq!(flushed, vec![(1, sighting)]);
        assert!(cache.flush_unpromoted().is_empty());
        assert_eq!(cache.record(1, sighting), Sighting::Materialized);
    }
}
