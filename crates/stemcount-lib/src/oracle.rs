//! Prune oracle
//!
//! The prune stage decides which roots are worth counting at all. The
//! counting engine only consults it through [`PruneOracle::lookup`]; a root
//! reported as `false` is never counted.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ahash::AHashSet;
use anyhow::{Context, Result};

use crate::kmer::{self, Key};

/// Boolean membership test over roots
pub trait PruneOracle: Send + Sync {
    /// Whether `root` is a candidate worth counting
    fn lookup(&self, root: Key) -> bool;
}

impl<F> PruneOracle for F
where
    F: Fn(Key) -> bool + Send + Sync,
{
    fn lookup(&self, root: Key) -> bool {
        self(root)
    }
}

/// Exact oracle over an explicit set of roots
#[derive(Debug, Default, Clone)]
pub struct RootSetOracle {
    roots: AHashSet<Key>,
}

impl RootSetOracle {
    /// Build from stems, canonicalizing each one
    pub fn from_stems(stems: impl IntoIterator<Item = Key>, stem_len: usize) -> Self {
        let roots = stems
            .into_iter()
            .map(|stem| kmer::to_root(stem, stem_len).0)
            .collect();
        Self { roots }
    }

    /// Load a plain-text file with one stem (or its reverse complement) per line
    pub fn load(path: impl AsRef<Path>, stem_len: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open prune list: {}", path.display()))?;
        let mut stems = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            let stem = line.trim();
            if stem.is_empty() || stem.starts_with('#') {
                continue;
            }
            let key = kmer::try_encode(stem.as_bytes(), stem_len)
                .with_context(|| format!("Bad stem at {}:{}", path.display(), idx + 1))?;
            stems.push(key);
        }
        Ok(Self::from_stems(stems, stem_len))
    }

    /// Number of roots in the set
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// True when the set is empty
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl PruneOracle for RootSetOracle {
    fn lookup(&self, root: Key) -> bool {
        self.roots.contains(&root)
    }
}
