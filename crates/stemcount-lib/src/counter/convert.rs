//! Converting stem tables into root tables
//!
//! Runs once ingestion has finished. A pool of converter workers pulls
//! shard outputs from a pre-loaded queue, so every shard is converted by
//! exactly one worker. Each shard is converted with one of two strategies:
//!
//! - **in memory**: every resident stem is stored at its (root,
//!   orientation); a stem failing the pre-filter is skipped.
//! - **slices**: the resident table is spilled as a final slice, then the
//!   slices are streamed back and summed at (root, orientation); the
//!   pre-filter runs on the summed matrices.
//!
//! For the same input both strategies yield the same table.

use anyhow::{Context, Result};
use crossbeam_queue::ArrayQueue;
use rayon::prelude::*;
use tracing::{debug, info};

use super::config::CountConfiguration;
use super::shard::ShardOutput;
use super::spill::SliceStore;
use crate::counts::{PreFilter, StemCounts};
use crate::kmer::Orientation;
use crate::table::{RootTable, StemTable};

/// Conversion statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConvertStats {
    /// Stem records read (resident entries or slice records)
    pub stems_read: u64,
    /// (root, orientation) matrices that passed the pre-filter
    pub stems_kept: u64,
    /// Roots in the resulting table
    pub roots: u64,
}

impl ConvertStats {
    /// Add another conversion's statistics
    pub fn add(&mut self, other: &ConvertStats) {
        self.stems_read += other.stems_read;
        self.stems_kept += other.stems_kept;
        self.roots += other.roots;
    }
}

/// Re-key a resident stem table by root, overwriting at (root, orientation)
pub fn convert_in_memory(table: StemTable, stem_len: usize, filter: Option<&PreFilter>) -> (RootTable, ConvertStats) {
    let mut stats = ConvertStats {
        stems_read: table.len() as u64,
        ..ConvertStats::default()
    };
    let mut roots = RootTable::with_capacity(stem_len, table.len());
    for (stem, counts) in table {
        if filter.is_some_and(|f| !f.passes(&counts)) {
            continue;
        }
        roots.insert_stem(stem, counts);
        stats.stems_kept += 1;
    }
    stats.roots = roots.len() as u64;
    (roots, stats)
}

/// Spill what is resident, then sum every slice by root
///
/// Slices are removed afterwards unless `keep_slices` is set.
pub fn convert_slices(
    slices: &mut SliceStore,
    resident: StemTable,
    stem_len: usize,
    filter: Option<&PreFilter>,
    keep_slices: bool,
) -> Result<(RootTable, ConvertStats)> {
    if !resident.is_empty() {
        slices.write_slice(&resident)?;
    }
    drop(resident);
    debug!(
        "Summing {} stem records from {} slices",
        slices.total_entries(),
        slices.num_slices()
    );

    let mut roots = RootTable::new(stem_len);
    let stems_read = slices.for_each_record(|stem, counts| roots.accumulate_stem(stem, counts))?;
    if let Some(filter) = filter {
        apply_pre_filter(&mut roots, filter);
    }

    if !keep_slices {
        slices.remove_slices()?;
    }

    let stats = ConvertStats {
        stems_read,
        stems_kept: roots.num_stems() as u64,
        roots: roots.len() as u64,
    };
    Ok((roots, stats))
}

/// Clear every orientation matrix that fails `filter`, dropping emptied roots
pub fn apply_pre_filter(table: &mut RootTable, filter: &PreFilter) {
    table.retain(|_, value| {
        for orientation in [Orientation::Forward, Orientation::Reverse] {
            let counts = value.get_mut(orientation);
            if !counts.is_empty() && !filter.passes(counts) {
                *counts = StemCounts::new();
            }
        }
        !value.is_empty()
    });
}

/// Convert one shard with the strategy its output calls for
pub fn convert_shard(output: ShardOutput, config: &CountConfiguration) -> Result<(RootTable, ConvertStats)> {
    let ShardOutput {
        shard,
        stem_len,
        table,
        slices,
        ..
    } = output;
    let filter = config.pre_filter.as_ref();

    let (roots, stats) = match slices {
        Some(mut slices) => convert_slices(&mut slices, table, stem_len, filter, config.keep_slices)
            .with_context(|| format!("Failed to convert shard {shard} from slices"))?,
        None => convert_in_memory(table, stem_len, filter),
    };
    info!(
        "Shard {}: {} stems read, {} kept, {} roots",
        shard, stats.stems_read, stats.stems_kept, stats.roots
    );
    Ok((roots, stats))
}

/// Convert every shard on `converter_threads` workers and merge the results
pub fn convert_all(outputs: Vec<ShardOutput>, config: &CountConfiguration) -> Result<(RootTable, ConvertStats)> {
    let stem_len = config.stem_len();
    if outputs.is_empty() {
        return Ok((RootTable::new(stem_len), ConvertStats::default()));
    }

    let num_workers = config.effective_converter_threads().min(outputs.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .build()
        .context("Failed to create converter thread pool")?;

    let pending = ArrayQueue::new(outputs.len());
    for output in outputs {
        anyhow::ensure!(pending.push(output).is_ok(), "Converter queue is full");
    }

    let per_worker: Vec<(RootTable, ConvertStats)> = pool.install(|| {
        (0..num_workers)
            .into_par_iter()
            .map(|worker| -> Result<(RootTable, ConvertStats)> {
                let mut roots = RootTable::new(stem_len);
                let mut stats = ConvertStats::default();
                let mut converted = 0usize;
                while let Some(output) = pending.pop() {
                    let (shard_roots, shard_stats) = convert_shard(output, config)?;
                    roots.merge_disjoint(shard_roots);
                    stats.add(&shard_stats);
                    converted += 1;
                }
                debug!("Converter {}: {} shards", worker, converted);
                Ok((roots, stats))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut roots = RootTable::new(stem_len);
    let mut stats = ConvertStats::default();
    for (worker_roots, worker_stats) in per_worker {
        roots.merge_disjoint(worker_roots);
        stats.add(&worker_stats);
    }
    stats.roots = roots.len() as u64;
    Ok((roots, stats))
}
