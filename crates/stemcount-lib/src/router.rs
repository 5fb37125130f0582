//! Shard routing
//!
//! Every stem is assigned to exactly one (partition, shard) pair by looking
//! at a short window of bases in the middle of the stem. The window is
//! canonicalized (minimum of its encoding and its reverse complement's), and
//! it sits at the exact centre of the stem, so a stem and its reverse
//! complement always select the same bucket. A root therefore lives in a
//! single shard.
//!
//! The bucket -> (partition, shard) tables are built once at startup, either
//! from a mapping file or evenly in-process, and shared read-only by every
//! loader.
//!
//! # Mapping file
//!
//! ```text
//! # comment
//! window 4 partitions 1 shards 8
//! 0 0 0
//! 1 0 1
//! ...
//! ```
//!
//! One `<bucket> <partition> <shard>` line per bucket in `0..4^window`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::constants::MAX_ROUTER_WINDOW;
use crate::kmer::{self, Key};

/// Errors raised while building or loading a router
#[derive(Error, Debug)]
pub enum RouterError {
    /// The mapping file could not be read or written
    #[error("I/O error on router mapping: {0}")]
    Io(#[from] std::io::Error),
    /// A line of the mapping file could not be parsed
    #[error("Malformed router mapping at line {line}: {reason}")]
    Malformed {
        /// 1-based line number
        line: usize,
        /// What went wrong
        reason: String,
    },
    /// A bucket was listed twice or never
    #[error("Router bucket {0} is missing or duplicated")]
    Bucket(usize),
    /// Window width cannot be routed for this stem length
    #[error("Router window {window} does not fit stem length {stem_len} (window must be <= {max}, stem_len - window must be even)")]
    Window {
        /// Window width
        window: usize,
        /// Stem length
        stem_len: usize,
        /// Largest supported window
        max: usize,
    },
    /// Shard or partition id outside the declared range
    #[error("Router target out of range: partition {partition} of {partitions}, shard {shard} of {shards}")]
    OutOfRange {
        /// Partition id found
        partition: usize,
        /// Declared partitions
        partitions: usize,
        /// Shard id found
        shard: usize,
        /// Declared shards
        shards: usize,
    },
}

/// Immutable bucket -> (partition, shard) lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRouter {
    window: usize,
    num_partitions: usize,
    num_shards: usize,
    partition_of: Vec<u16>,
    shard_of: Vec<u16>,
}

impl ShardRouter {
    /// Evenly distribute canonical buckets over `num_partitions * num_shards` targets
    ///
    /// Canonical buckets are dealt round-robin in increasing order; the
    /// non-canonical bucket of each pair copies its partner's target.
    pub fn uniform(window: usize, num_partitions: usize, num_shards: usize) -> Result<Self, RouterError> {
        check_window(window)?;
        check_targets(num_partitions, num_shards, num_partitions.saturating_sub(1), num_shards.saturating_sub(1))?;

        let num_buckets = 1usize << (2 * window);
        let mut partition_of = vec![0u16; num_buckets];
        let mut shard_of = vec![0u16; num_buckets];
        let targets = num_partitions * num_shards;
        let mut next = 0usize;
        for bucket in 0..num_buckets {
            let rc = kmer::reverse_complement(bucket as Key, window) as usize;
            if rc < bucket {
                partition_of[bucket] = partition_of[rc];
                shard_of[bucket] = shard_of[rc];
                continue;
            }
            let target = next % targets;
            partition_of[bucket] = (target / num_shards) as u16;
            shard_of[bucket] = (target % num_shards) as u16;
            next += 1;
        }

        Ok(Self {
            window,
            num_partitions,
            num_shards,
            partition_of,
            shard_of,
        })
    }

    /// Load a mapping file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RouterError> {
        let file = File::open(path.as_ref())?;
        Self::parse(BufReader::new(file))
    }

    /// Parse a mapping from any buffered reader
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, RouterError> {
        let mut header: Option<(usize, usize, usize)> = None;
        let mut partition_of: Vec<u16> = Vec::new();
        let mut shard_of: Vec<u16> = Vec::new();
        let mut seen: Vec<bool> = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            let content = line.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let fields: Vec<&str> = content.split_whitespace().collect();

            let Some((_, partitions, shards)) = header else {
                let parsed = parse_header(&fields).ok_or_else(|| RouterError::Malformed {
                    line: line_no,
                    reason: format!("expected 'window <w> partitions <p> shards <s>', got '{content}'"),
                })?;
                check_window(parsed.0)?;
                let num_buckets = 1usize << (2 * parsed.0);
                partition_of = vec![0; num_buckets];
                shard_of = vec![0; num_buckets];
                seen = vec![false; num_buckets];
                header = Some(parsed);
                continue;
            };

            let [bucket, partition, shard] = parse_triple(&fields).ok_or_else(|| RouterError::Malformed {
                line: line_no,
                reason: format!("expected '<bucket> <partition> <shard>', got '{content}'"),
            })?;
            if bucket >= seen.len() || seen[bucket] {
                return Err(RouterError::Bucket(bucket));
            }
            check_targets(partitions, shards, partition, shard)?;
            seen[bucket] = true;
            partition_of[bucket] = partition as u16;
            shard_of[bucket] = shard as u16;
        }

        let (window, num_partitions, num_shards) = header.ok_or(RouterError::Malformed {
            line: 0,
            reason: "empty mapping".to_string(),
        })?;
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(RouterError::Bucket(missing));
        }

        Ok(Self {
            window,
            num_partitions,
            num_shards,
            partition_of,
            shard_of,
        })
    }

    /// Write the mapping in the format accepted by [`load`](Self::load)
    pub fn write_mapping(&self, path: impl AsRef<Path>) -> Result<(), RouterError> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        writeln!(writer, "# bucket partition shard")?;
        writeln!(
            writer,
            "window {} partitions {} shards {}",
            self.window, self.num_partitions, self.num_shards
        )?;
        for (bucket, (partition, shard)) in self.partition_of.iter().zip(&self.shard_of).enumerate() {
            writeln!(writer, "{bucket} {partition} {shard}")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Check that the router can serve stems of `stem_len` bases
    pub fn check_stem_len(&self, stem_len: usize) -> Result<(), RouterError> {
        if self.window > stem_len || (stem_len - self.window) % 2 != 0 {
            return Err(RouterError::Window {
                window: self.window,
                stem_len,
                max: MAX_ROUTER_WINDOW,
            });
        }
        Ok(())
    }

    /// Bucket index of an ASCII stem
    ///
    /// The caller guarantees `stem.len() - window` is even (see
    /// [`check_stem_len`](Self::check_stem_len)).
    #[inline]
    pub fn bucket_of(&self, stem: &[u8]) -> usize {
        let offset = (stem.len() - self.window) / 2;
        let forward = kmer::encode(&stem[offset..offset + self.window]);
        let reverse = kmer::reverse_complement(forward, self.window);
        forward.min(reverse) as usize
    }

    /// (partition, shard) for an ASCII stem
    #[inline]
    pub fn route(&self, stem: &[u8]) -> (usize, usize) {
        let bucket = self.bucket_of(stem);
        (self.partition_of[bucket] as usize, self.shard_of[bucket] as usize)
    }

    /// Shard for `stem` if it belongs to `partition_id`
    #[inline]
    pub fn local_shard(&self, stem: &[u8], partition_id: usize) -> Option<usize> {
        let (partition, shard) = self.route(stem);
        (partition == partition_id).then_some(shard)
    }

    /// Window width in bases
    pub fn window(&self) -> usize {
        self.window
    }

    /// Number of process partitions
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Number of shards per partition
    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Number of buckets (4^window)
    pub fn num_buckets(&self) -> usize {
        self.partition_of.len()
    }
}

fn check_window(window: usize) -> Result<(), RouterError> {
    if window == 0 || window > MAX_ROUTER_WINDOW {
        return Err(RouterError::Window {
            window,
            stem_len: 0,
            max: MAX_ROUTER_WINDOW,
        });
    }
    Ok(())
}

fn check_targets(partitions: usize, shards: usize, partition: usize, shard: usize) -> Result<(), RouterError> {
    if partitions == 0
        || shards == 0
        || partition >= partitions
        || shard >= shards
        || partitions > u16::MAX as usize
        || shards > u16::MAX as usize
    {
        return Err(RouterError::OutOfRange {
            partition,
            partitions,
            shard,
            shards,
        });
    }
    Ok(())
}

fn parse_header(fields: &[&str]) -> Option<(usize, usize, usize)> {
    match fields {
        ["window", w, "partitions", p, "shards", s] => Some((w.parse().ok()?, p.parse().ok()?, s.parse().ok()?)),
        _ => None,
    }
}

fn parse_triple(fields: &[&str]) -> Option<[usize; 3]> {
    match fields {
        [a, b, c] => Some([a.parse().ok()?, b.parse().ok()?, c.parse().ok()?]),
        _ => None,
    }
}
