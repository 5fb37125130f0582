//! Shard counters
//!
//! One counter owns one shard: its stem table, its singleton cache and its
//! slices. It drains the shard's inbound queues and applies every update
//! with the cache-then-promote rule:
//!
//! 1. fold the stem to `(root, orientation)`;
//! 2. drop the update if the prune oracle rejects the root;
//! 3. with the cache on, the first sighting of a root only lands in the
//!    cache; the second one materializes the cached sighting at its own
//!    stem and then counts the current one; later sightings go straight
//!    to the table;
//! 4. increment the current stem's counter, saturating at the ceiling.
//!
//! Sightings still in the cache when ingestion ends are flushed into the
//! table, so counts are the same with or without the cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use super::batch::{Backoff, Inbox, StemUpdate};
use super::config::CountConfiguration;
use super::spill::SliceStore;
use crate::cache::{CacheEntry, Sighting, SingletonCache};
use crate::kmer;
use crate::oracle::PruneOracle;
use crate::table::StemTable;

/// Counter statistics for one shard
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterStats {
    /// Updates received
    pub updates: u64,
    /// Updates dropped by the prune oracle
    pub discarded: u64,
    /// First sightings kept only in the cache
    pub cache_inserts: u64,
    /// Cached sightings materialized by a second sighting
    pub promotions: u64,
    /// Singleton sightings flushed at the end of ingestion
    pub flushed: u64,
    /// Slices written
    pub spills: u64,
}

impl CounterStats {
    /// Add another shard's statistics
    pub fn add(&mut self, other: &CounterStats) {
        self.updates += other.updates;
        self.discarded += other.discarded;
        self.cache_inserts += other.cache_inserts;
        self.promotions += other.promotions;
        self.flushed += other.flushed;
        self.spills += other.spills;
    }
}

/// Exclusive owner of one shard during ingestion
pub struct ShardCounter {
    shard: usize,
    stem_len: usize,
    table: StemTable,
    table_capacity: usize,
    cache: Option<SingletonCache>,
    oracle: Option<Arc<dyn PruneOracle>>,
    slices: Option<SliceStore>,
    spill_threshold: usize,
    stats: CounterStats,
}

impl ShardCounter {
    /// Counter for `shard`; `slices` enables spilling
    pub fn new(
        shard: usize,
        config: &CountConfiguration,
        oracle: Option<Arc<dyn PruneOracle>>,
        slices: Option<SliceStore>,
    ) -> Self {
        let table_capacity = if slices.is_some() {
            config.spill_threshold() + 1
        } else {
            config.table_target_size
        };
        Self {
            shard,
            stem_len: config.stem_len(),
            table: StemTable::with_capacity(table_capacity),
            table_capacity,
            cache: config
                .use_cache
                .then(|| SingletonCache::with_capacity(config.cache_target_size)),
            oracle,
            slices,
            spill_threshold: config.spill_threshold(),
            stats: CounterStats::default(),
        }
    }

    /// Shard id
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Apply one update
    #[inline]
    pub fn apply(&mut self, update: &StemUpdate) {
        self.stats.updates += 1;
        let (root, orientation) = kmer::to_root(update.key, self.stem_len);

        if let Some(oracle) = &self.oracle {
            if !oracle.lookup(root) {
                self.stats.discarded += 1;
                return;
            }
        }

        if let Some(cache) = &mut self.cache {
            let sighting = CacheEntry::new(orientation, update.first, update.last, update.kind);
            match cache.record(root, sighting) {
                Sighting::First => {
                    self.stats.cache_inserts += 1;
                    return;
                }
                Sighting::Promote(cached) => {
                    // the cached sighting lands on the stem it was read as
                    let cached_stem = kmer::from_root(root, cached.orientation(), self.stem_len);
                    self.table
                        .entry(cached_stem)
                        .or_default()
                        .increment(cached.first(), cached.last(), cached.kind());
                    self.stats.promotions += 1;
                }
                Sighting::Materialized => {}
            }
        }

        self.table
            .entry(update.key)
            .or_default()
            .increment(update.first, update.last, update.kind);
    }

    /// One pass over the inbound queues, then a spill check
    pub fn drain(&mut self, inbox: &mut Inbox<'_>) -> Result<usize> {
        let seen = inbox.drain(|update| self.apply(update));
        if seen > 0 {
            self.maybe_spill()?;
        }
        Ok(seen)
    }

    /// Drain until `done` is set and the queues are empty
    ///
    /// Loaders are joined before `done` is raised, so a pass that starts
    /// after observing it and finds nothing is the last one.
    pub fn run(&mut self, inbox: &mut Inbox<'_>, done: &AtomicBool) -> Result<()> {
        let mut backoff = Backoff::default();
        loop {
            let finished = done.load(Ordering::Acquire);
            if self.drain(inbox)? > 0 {
                backoff.reset();
            } else if finished {
                break;
            } else {
                backoff.snooze();
            }
        }
        self.finish_ingestion();
        debug!(
            "Shard {}: ingestion done, {} updates, {} stems resident",
            self.shard,
            self.stats.updates,
            self.table.len()
        );
        Ok(())
    }

    /// Move every singleton still in the cache into the table
    pub fn finish_ingestion(&mut self) {
        let Some(cache) = &mut self.cache else {
            return;
        };
        for (root, entry) in cache.flush_unpromoted() {
            let stem = kmer::from_root(root, entry.orientation(), self.stem_len);
            self.table
                .entry(stem)
                .or_default()
                .increment(entry.first(), entry.last(), entry.kind());
            self.stats.flushed += 1;
        }
    }

    /// Spill the table if spilling is on and it outgrew its threshold
    pub fn maybe_spill(&mut self) -> Result<bool> {
        let Some(slices) = &mut self.slices else {
            return Ok(false);
        };
        if self.table.len() <= self.spill_threshold {
            return Ok(false);
        }
        slices.write_slice(&self.table)?;
        info!(
            "Shard {}: spilled {} stems (slice {})",
            self.shard,
            self.table.len(),
            slices.num_slices() - 1
        );
        self.table = StemTable::with_capacity(self.table_capacity);
        self.stats.spills += 1;
        Ok(true)
    }

    /// Resident stem table
    pub fn table(&self) -> &StemTable {
        &self.table
    }

    /// Counter statistics so far
    pub fn stats(&self) -> &CounterStats {
        &self.stats
    }

    /// Hand over the shard's data for conversion
    pub fn into_parts(self) -> ShardOutput {
        ShardOutput {
            shard: self.shard,
            stem_len: self.stem_len,
            table: self.table,
            slices: self.slices,
            stats: self.stats,
        }
    }
}

/// What a shard leaves behind after ingestion
#[derive(Debug)]
pub struct ShardOutput {
    /// Shard id
    pub shard: usize,
    /// Stem length of every key
    pub stem_len: usize,
    /// Resident stem table
    pub table: StemTable,
    /// Slices written during ingestion, when spilling is on
    pub slices: Option<SliceStore>,
    /// Counter statistics
    pub stats: CounterStats,
}
