//! Stem-indexed and root-indexed count tables
//!
//! During ingestion every shard keeps a [`StemTable`] keyed by the stem as
//! it was read. Conversion folds each stem onto its root, producing a
//! [`RootTable`] whose value holds one matrix per orientation.

use ahash::AHashMap;

use crate::counts::{RootCounts, StemCounts};
use crate::encoding::encode_base;
use crate::kmer::{self, Key};

/// Working table of one shard during ingestion
pub type StemTable = AHashMap<Key, StemCounts>;

/// Final table: root -> matrices for both orientations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootTable {
    stem_len: usize,
    roots: AHashMap<Key, RootCounts>,
}

impl RootTable {
    /// Empty table for stems of `stem_len` bases
    pub fn new(stem_len: usize) -> Self {
        Self::with_capacity(stem_len, 0)
    }

    /// Empty table with room for `capacity` roots
    pub fn with_capacity(stem_len: usize, capacity: usize) -> Self {
        Self {
            stem_len,
            roots: AHashMap::with_capacity(capacity),
        }
    }

    /// Stem length of every key
    pub fn stem_len(&self) -> usize {
        self.stem_len
    }

    /// Number of roots
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// True when no root is stored
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of non-empty (root, orientation) matrices
    pub fn num_stems(&self) -> usize {
        self.roots
            .values()
            .flat_map(|value| value.iter())
            .filter(|(_, counts)| !counts.is_empty())
            .count()
    }

    /// Matrices of a root
    pub fn get(&self, root: Key) -> Option<&RootCounts> {
        self.roots.get(&root)
    }

    /// Matrix of a stem in its own orientation
    pub fn get_stem(&self, stem: Key) -> Option<&StemCounts> {
        let (root, orientation) = kmer::to_root(stem, self.stem_len);
        self.roots.get(&root).map(|value| value.get(orientation))
    }

    /// (normal, tumor) counts for an ASCII k-mer of `stem_len + 2` bases
    ///
    /// Returns `None` for k-mers of the wrong length, with ambiguous
    /// bases, or whose stem is absent.
    pub fn lookup_kmer(&self, kmer_seq: &[u8]) -> Option<(u16, u16)> {
        if kmer_seq.len() != self.stem_len + 2 {
            return None;
        }
        let first = encode_base(kmer_seq[0])?;
        let last = encode_base(kmer_seq[kmer_seq.len() - 1])?;
        let stem = kmer::try_encode(&kmer_seq[1..kmer_seq.len() - 1], self.stem_len).ok()?;
        self.get_stem(stem).map(|counts| counts.pair(first, last))
    }

    /// Store `counts` at the stem's (root, orientation), replacing what was there
    pub fn insert_stem(&mut self, stem: Key, counts: StemCounts) {
        let (root, orientation) = kmer::to_root(stem, self.stem_len);
        *self.roots.entry(root).or_default().get_mut(orientation) = counts;
    }

    /// Add `counts` into the stem's (root, orientation), saturating
    pub fn accumulate_stem(&mut self, stem: Key, counts: &StemCounts) {
        let (root, orientation) = kmer::to_root(stem, self.stem_len);
        self.roots.entry(root).or_default().get_mut(orientation).merge_from(counts);
    }

    /// Store a root's value, replacing what was there
    pub fn insert(&mut self, root: Key, value: RootCounts) {
        self.roots.insert(root, value);
    }

    /// Matrices of a root for in-place edits
    pub fn get_mut(&mut self, root: Key) -> Option<&mut RootCounts> {
        self.roots.get_mut(&root)
    }

    /// Keep only the roots for which `keep` returns true
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(Key, &mut RootCounts) -> bool,
    {
        self.roots.retain(|&root, value| keep(root, value));
    }

    /// Move every root of `other` into `self`
    ///
    /// Shard tables are disjoint by construction; a shared root is summed.
    pub fn merge_disjoint(&mut self, other: RootTable) {
        debug_assert_eq!(self.stem_len, other.stem_len);
        if self.roots.is_empty() {
            self.roots = other.roots;
            return;
        }
        self.roots.reserve(other.roots.len());
        for (root, value) in other.roots {
            self.roots.entry(root).or_default().merge_from(&value);
        }
    }

    /// Unordered iteration over (root, matrices)
    pub fn iter(&self) -> impl Iterator<Item = (Key, &RootCounts)> + '_ {
        self.roots.iter().map(|(&root, value)| (root, value))
    }

    /// Roots in ascending key order
    pub fn sorted_roots(&self) -> Vec<Key> {
        let mut roots: Vec<Key> = self.roots.keys().copied().collect();
        roots.sort_unstable();
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::SampleKind;

    fn counts(first: u8, last: u8, kind: SampleKind, n: u16) -> StemCounts {
        let mut c = StemCounts::new();
        c.set(first, last, kind, n);
        c
    }

    #[test]
    fn test_stem_and_reverse_complement_share_root() {
        let mut table = RootTable::new(4);
        let stem = kmer::encode(b"TTTG");
        let rc = kmer::encode(b"CAAA");
        table.insert_stem(stem, counts(0, 1, SampleKind::Normal, 2));
        table.insert_stem(rc, counts(2, 3, SampleKind::Tumor, 5));

        assert_eq!(table.len(), 1);
        assert_eq!(table.num_stems(), 2);
        assert_eq!(table.get_stem(stem).unwrap().get(0, 1, SampleKind::Normal), 2);
        assert_eq!(table.get_stem(rc).unwrap().get(2, 3, SampleKind::Tumor), 5);
    }

    #[test]
    fn test_insert_overwrites_accumulate_sums() {
        let mut table = RootTable::new(4);
        let stem = kmer::encode(b"ACGA");
        table.insert_stem(stem, counts(0, 0, SampleKind::Normal, 3));
        table.insert_stem(stem, counts(0, 0, SampleKind::Normal, 4));
        assert_eq!(table.get_stem(stem).unwrap().get(0, 0, SampleKind::Normal), 4);

        table.accumulate_stem(stem, &counts(0, 0, SampleKind::Normal, u16::MAX));
        assert_eq!(table.get_stem(stem).unwrap().get(0, 0, SampleKind::Normal), u16::MAX);
    }

    #[test]
    fn test_lookup_kmer() {
        let mut table = RootTable::new(4);
        // k-mer A TTTG C: first A=0, last C=1
        table.insert_stem(kmer::encode(b"TTTG"), counts(0, 1, SampleKind::Tumor, 7));

        assert_eq!(table.lookup_kmer(b"ATTTGC"), Some((0, 7)));
        assert_eq!(table.lookup_kmer(b"CTTTGA"), Some((0, 0)));
        assert_eq!(table.lookup_kmer(b"ACAAAC"), Some((0, 0)));
        assert_eq!(table.lookup_kmer(b"AGGGGC"), None);
        assert_eq!(table.lookup_kmer(b"ATTNGC"), None);
        assert_eq!(table.lookup_kmer(b"ATTTG"), None);
    }

    #[test]
    fn test_merge_disjoint() {
        let mut a = RootTable::new(4);
        let mut b = RootTable::new(4);
        a.insert_stem(kmer::encode(b"AAAC"), counts(0, 0, SampleKind::Normal, 1));
        b.insert_stem(kmer::encode(b"CCCA"), counts(0, 0, SampleKind::Tumor, 1));
        a.merge_disjoint(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.sorted_roots(), {
            let mut v = vec![
                kmer::to_root(kmer::encode(b"AAAC"), 4).0,
                kmer::to_root(kmer::encode(b"CCCA"), 4).0,
            ];
            v.sort_unstable();
            v
        });
    }
}
