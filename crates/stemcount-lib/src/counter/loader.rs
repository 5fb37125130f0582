//! Loaders: reads in, stem updates out
//!
//! A loader walks its chunks read by read. For every k-length window of
//! every usable split it takes the interior stem, asks the router which
//! shard owns it, and appends a [`StemUpdate`] to that shard's pending batch.

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::batch::{Outbox, StemUpdate};
use super::config::CountConfiguration;
use crate::constants::key_mask;
use crate::counts::SampleKind;
use crate::encoding::BASE_CODES;
use crate::kmer::Key;
use crate::reads::{Chunk, Read};
use crate::router::ShardRouter;

/// Work done by one loader
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoaderStats {
    /// Chunks consumed
    pub chunks: u64,
    /// Reads delivered by the read source
    pub reads: u64,
    /// Stems sent to a local shard
    pub stems: u64,
    /// Stems owned by another partition
    pub remote_stems: u64,
}

impl LoaderStats {
    /// Add another loader's statistics
    pub fn add(&mut self, other: &LoaderStats) {
        self.chunks += other.chunks;
        self.reads += other.reads;
        self.stems += other.stems;
        self.remote_stems += other.remote_stems;
    }
}

/// One loader thread's state
pub struct Loader<'a> {
    config: &'a CountConfiguration,
    router: &'a ShardRouter,
    outbox: Outbox<'a>,
    stats: LoaderStats,
}

impl<'a> Loader<'a> {
    /// Loader publishing through `outbox`
    pub fn new(config: &'a CountConfiguration, router: &'a ShardRouter, outbox: Outbox<'a>) -> Self {
        Self {
            config,
            router,
            outbox,
            stats: LoaderStats::default(),
        }
    }

    /// Process every chunk in order, then hand off what is still pending
    pub fn run<'c>(mut self, chunks: impl IntoIterator<Item = &'c Chunk>) -> Result<LoaderStats> {
        let id = self.outbox.loader();
        for chunk in chunks {
            self.load_chunk(chunk)
                .with_context(|| format!("Loader {id} failed on chunk {}", chunk.name()))?;
        }
        debug!(
            "Loader {}: done after {} chunks, {} batches sent",
            id,
            self.stats.chunks,
            self.outbox.batches_sent()
        );
        Ok(self.stats)
    }

    fn load_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        debug!("Loader {}: starting {}", self.outbox.loader(), chunk.name());
        let kind = chunk.kind();
        chunk.for_each_read(self.config.min_mean_quality, |read| {
            self.load_read(read, kind);
            Ok(())
        })?;
        self.outbox.flush();
        self.stats.chunks += 1;
        Ok(())
    }

    fn load_read(&mut self, read: &Read, kind: SampleKind) {
        let k = self.config.k;
        for split in read.usable_splits(k) {
            self.load_split(split, kind);
        }

        self.stats.reads += 1;
        if self.stats.reads % self.config.progress_interval == 0 {
            info!(
                "Loader {}: {} reads, {} stems",
                self.outbox.loader(),
                self.stats.reads,
                self.stats.stems
            );
        }
    }

    /// Every k-mer of an ACGT-only split of at least k bases
    fn load_split(&mut self, split: &[u8], kind: SampleKind) {
        let k = self.config.k;
        let stem_len = k - 2;
        let mask = key_mask(stem_len);
        let code = |base: u8| BASE_CODES[base as usize] & 0b11;

        // rolling key over the stem, primed with all but its last base
        let mut key: Key = split[1..stem_len]
            .iter()
            .fold(0, |acc, &b| (acc << 2) | Key::from(code(b)));

        for offset in 0..=split.len() - k {
            key = ((key << 2) | Key::from(code(split[offset + k - 2]))) & mask;
            let stem = &split[offset + 1..offset + k - 1];
            let Some(shard) = self.router.local_shard(stem, self.config.partition_id) else {
                self.stats.remote_stems += 1;
                continue;
            };
            self.outbox.push(
                shard,
                StemUpdate {
                    key,
                    first: code(split[offset]),
                    last: code(split[offset + k - 1]),
                    kind,
                },
            );
            self.stats.stems += 1;
        }
    }
}
