//! Read sources for the loaders
//!
//! A chunk is one unit of loader work: a FASTA/FASTQ file (optionally
//! gzipped, decoded through `needletail`) or a batch of reads already held in
//! memory. Every read is delivered together with its *splits*, the maximal
//! runs of unambiguous A/C/G/T bases; k-mers never straddle a split boundary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use needletail::parse_fastx_file;

use crate::counts::SampleKind;
use crate::encoding::is_acgt;

/// A run of unambiguous bases inside a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Offset of the first base
    pub offset: usize,
    /// Number of bases
    pub len: usize,
}

/// One sequencing read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Read {
    /// Read identifier
    pub id: Vec<u8>,
    /// Upper-cased bases
    pub seq: Vec<u8>,
    /// Phred+33 qualities (empty for FASTA)
    pub qual: Vec<u8>,
    /// Maximal ACGT runs
    pub splits: Vec<Span>,
}

impl Read {
    /// Build a read, upper-casing the sequence and computing its splits
    pub fn new(id: &[u8], seq: &[u8], qual: Option<&[u8]>) -> Self {
        let seq = seq.to_ascii_uppercase();
        let splits = compute_splits(&seq);
        Self {
            id: id.to_vec(),
            seq,
            qual: qual.map(<[u8]>::to_vec).unwrap_or_default(),
            splits,
        }
    }

    /// Total length in bases
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    /// True for a zero-length read
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Mean Phred quality, `None` without qualities
    pub fn mean_quality(&self) -> Option<f64> {
        if self.qual.is_empty() {
            return None;
        }
        let sum: u64 = self.qual.iter().map(|&q| u64::from(q.saturating_sub(33))).sum();
        Some(sum as f64 / self.qual.len() as f64)
    }

    /// Splits long enough to hold at least one `k`-length window
    pub fn usable_splits(&self, k: usize) -> impl Iterator<Item = &[u8]> + '_ {
        self.splits
            .iter()
            .filter(move |span| span.len >= k)
            .map(|span| &self.seq[span.offset..span.offset + span.len])
    }
}

/// Maximal runs of A/C/G/T in `seq`
pub fn compute_splits(seq: &[u8]) -> Vec<Span> {
    let mut splits = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &base) in seq.iter().enumerate() {
        match (is_acgt(base), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                splits.push(Span { offset: s, len: i - s });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        splits.push(Span { offset: s, len: seq.len() - s });
    }
    splits
}

/// Unit of loader work
///
/// A chunk is a whole file or an in-memory batch; byte ranges within a
/// file are not split across loaders. Pass several files to spread one
/// sample over loaders.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// FASTA/FASTQ file, possibly compressed
    Fastx {
        /// Input path
        path: PathBuf,
        /// Sample the file belongs to
        kind: SampleKind,
    },
    /// Reads already in memory
    Memory {
        /// Label used in log messages
        name: String,
        /// Reads of the chunk
        reads: Vec<Read>,
        /// Sample the reads belong to
        kind: SampleKind,
    },
}

impl Chunk {
    /// File-backed chunk
    pub fn fastx(path: impl AsRef<Path>, kind: SampleKind) -> Self {
        Chunk::Fastx {
            path: path.as_ref().to_path_buf(),
            kind,
        }
    }

    /// In-memory chunk built from plain sequences
    pub fn from_sequences<S: AsRef<[u8]>>(name: &str, seqs: &[S], kind: SampleKind) -> Self {
        let reads = seqs
            .iter()
            .enumerate()
            .map(|(i, s)| Read::new(format!("{name}.{i}").as_bytes(), s.as_ref(), None))
            .collect();
        Chunk::Memory {
            name: name.to_string(),
            reads,
            kind,
        }
    }

    /// Sample kind of every read in the chunk
    pub fn kind(&self) -> SampleKind {
        match self {
            Chunk::Fastx { kind, .. } | Chunk::Memory { kind, .. } => *kind,
        }
    }

    /// Human-readable name for logging
    pub fn name(&self) -> String {
        match self {
            Chunk::Fastx { path, .. } => path.display().to_string(),
            Chunk::Memory { name, .. } => name.clone(),
        }
    }

    /// Call `callback` for every read that passes the quality threshold
    ///
    /// Reads below `min_mean_quality` are skipped silently. Returns the
    /// number of reads delivered.
    pub fn for_each_read<F>(&self, min_mean_quality: Option<f64>, mut callback: F) -> Result<u64>
    where
        F: FnMut(&Read) -> Result<()>,
    {
        let passes = |read: &Read| match (min_mean_quality, read.mean_quality()) {
            (Some(min), Some(mean)) => mean >= min,
            _ => true,
        };
        let mut delivered = 0u64;

        match self {
            Chunk::Fastx { path, .. } => {
                let mut reader = parse_fastx_file(path)
                    .with_context(|| format!("Failed to open sequence file: {}", path.display()))?;
                while let Some(record) = reader.next() {
                    let record = record
                        .with_context(|| format!("Failed to parse sequence record in {}", path.display()))?;
                    let read = Read::new(record.id(), &record.seq(), record.qual());
                    if passes(&read) {
                        callback(&read)?;
                        delivered += 1;
                    }
                }
            }
            Chunk::Memory { reads, .. } => {
                for read in reads {
                    if passes(read) {
                        callback(read)?;
                        delivered += 1;
                    }
                }
            }
        }

        Ok(delivered)
    }
}
