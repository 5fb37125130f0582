//! Count pipeline orchestration
//!
//! Runs the count stage for one partition in three phases:
//! 1. Ingest: loaders and shard counters run side by side, connected by
//!    the queue mesh
//! 2. Join the loaders, raise the ingestion-done flag, join the counters
//!    (each does a final drain and flushes its cache)
//! 3. Convert every shard to a root table and merge the shards

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;

use anyhow::{anyhow, ensure, Context, Result};
use tracing::info;

use super::batch::QueueMesh;
use super::config::CountConfiguration;
use super::convert::{convert_all, ConvertStats};
use super::loader::{Loader, LoaderStats};
use super::shard::{CounterStats, ShardCounter};
use super::spill::{new_run_id, SliceStore};
use crate::oracle::PruneOracle;
use crate::reads::Chunk;
use crate::router::ShardRouter;
use crate::table::RootTable;

/// Output of a count run
#[derive(Debug)]
pub struct CountResult {
    /// Merged root-indexed table of this partition
    pub table: RootTable,
    /// Summed loader statistics
    pub loader_stats: LoaderStats,
    /// Summed shard counter statistics
    pub counter_stats: CounterStats,
    /// Summed conversion statistics
    pub convert_stats: ConvertStats,
}

/// Count stage for one partition
pub struct CountPipeline {
    config: CountConfiguration,
    router: ShardRouter,
    oracle: Option<Arc<dyn PruneOracle>>,
}

impl CountPipeline {
    /// Create a pipeline, checking the router against the configuration
    pub fn new(
        config: CountConfiguration,
        router: ShardRouter,
        oracle: Option<Arc<dyn PruneOracle>>,
    ) -> Result<Self> {
        config.validate()?;
        router.check_stem_len(config.stem_len())?;
        ensure!(
            router.num_shards() == config.num_shards,
            "Router maps {} shards but {} are configured",
            router.num_shards(),
            config.num_shards
        );
        ensure!(
            router.num_partitions() == config.num_partitions,
            "Router maps {} partitions but {} are configured",
            router.num_partitions(),
            config.num_partitions
        );
        Ok(Self { config, router, oracle })
    }

    /// Pipeline with an evenly distributed router built from the configuration
    pub fn with_uniform_router(config: CountConfiguration, oracle: Option<Arc<dyn PruneOracle>>) -> Result<Self> {
        let router = ShardRouter::uniform(config.router_window, config.num_partitions, config.num_shards)?;
        Self::new(config, router, oracle)
    }

    /// The configuration in use
    pub fn config(&self) -> &CountConfiguration {
        &self.config
    }

    /// Count every chunk and return the merged root table
    ///
    /// Chunk `i` goes to loader `i % num_loaders`.
    pub fn run(&self, chunks: &[Chunk]) -> Result<CountResult> {
        self.config.print();
        info!("Counting stems of {} chunks", chunks.len());
        let start = Instant::now();

        info!("Step 1: Ingesting reads...");
        let counters = self.make_counters()?;
        let (loader_stats, counters) = self.ingest(chunks, counters)?;

        let mut counter_stats = CounterStats::default();
        let mut outputs = Vec::with_capacity(counters.len());
        for counter in counters {
            counter_stats.add(counter.stats());
            outputs.push(counter.into_parts());
        }
        info!(
            "  {} reads, {} stems sent, {} remote stems skipped",
            loader_stats.reads, loader_stats.stems, loader_stats.remote_stems
        );
        info!(
            "  {} updates, {} discarded, {} promotions, {} singletons flushed, {} spills",
            counter_stats.updates,
            counter_stats.discarded,
            counter_stats.promotions,
            counter_stats.flushed,
            counter_stats.spills
        );

        info!("Step 2: Converting shards...");
        let (table, convert_stats) = convert_all(outputs, &self.config)?;
        info!(
            "  {} stems read, {} kept, {} roots",
            convert_stats.stems_read, convert_stats.stems_kept, convert_stats.roots
        );
        info!("Count complete in {:.2?}", start.elapsed());

        Ok(CountResult {
            table,
            loader_stats,
            counter_stats,
            convert_stats,
        })
    }

    fn make_counters(&self) -> Result<Vec<ShardCounter>> {
        let run_id = new_run_id();
        (0..self.config.num_shards)
            .map(|shard| {
                let slices = if self.config.spill {
                    let store = SliceStore::new(&self.config.tmp_dirname, run_id, shard, self.config.stem_len())
                        .with_context(|| {
                            format!("Failed to create temp directory {}", self.config.tmp_dirname.display())
                        })?;
                    Some(store)
                } else {
                    None
                };
                Ok(ShardCounter::new(shard, &self.config, self.oracle.clone(), slices))
            })
            .collect()
    }

    /// Phases 1 and 2: run loaders and counters, then join them in order
    fn ingest(&self, chunks: &[Chunk], counters: Vec<ShardCounter>) -> Result<(LoaderStats, Vec<ShardCounter>)> {
        let num_loaders = self.config.num_loaders;
        let mut mesh = QueueMesh::new(self.config.num_shards, num_loaders, self.config.queue_capacity);
        let (outboxes, inboxes) = mesh.endpoints(self.config.batch_size);
        let done = AtomicBool::new(false);

        let assignments: Vec<Vec<&Chunk>> = (0..num_loaders)
            .map(|loader| chunks.iter().skip(loader).step_by(num_loaders).collect())
            .collect();

        let (loader_results, counter_results) = thread::scope(|s| {
            let done = &done;
            let counter_handles: Vec<_> = counters
                .into_iter()
                .zip(inboxes)
                .map(|(mut counter, mut inbox)| {
                    s.spawn(move || -> Result<ShardCounter> {
                        if let Err(err) = counter.run(&mut inbox, done) {
                            inbox.discard_until(done);
                            return Err(err.context(format!("Shard {} failed", counter.shard())));
                        }
                        Ok(counter)
                    })
                })
                .collect();

            let loader_handles: Vec<_> = outboxes
                .into_iter()
                .zip(assignments)
                .map(|(outbox, mine)| {
                    let loader = Loader::new(&self.config, &self.router, outbox);
                    s.spawn(move || loader.run(mine))
                })
                .collect();

            let loader_results: Vec<Result<LoaderStats>> =
                loader_handles.into_iter().map(|h| join_worker(h, "Loader")).collect();
            done.store(true, Ordering::Release);
            let counter_results: Vec<Result<ShardCounter>> =
                counter_handles.into_iter().map(|h| join_worker(h, "Shard counter")).collect();
            (loader_results, counter_results)
        });

        let mut loader_stats = LoaderStats::default();
        for result in loader_results {
            loader_stats.add(&result?);
        }
        let counters = counter_results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok((loader_stats, counters))
    }
}

fn join_worker<T>(handle: ScopedJoinHandle<'_, Result<T>>, what: &str) -> Result<T> {
    handle.join().map_err(|_| anyhow!("{what} thread panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::SampleKind;
    use crate::kmer;

    fn config(k: usize) -> CountConfiguration {
        CountConfiguration {
            num_loaders: 2,
            num_shards: 3,
            batch_size: 8,
            queue_capacity: 2,
            table_target_size: 1024,
            cache_target_size: 1024,
            ..CountConfiguration::new(k).unwrap()
        }
    }

    #[test]
    fn test_router_must_match_config() {
        let router = ShardRouter::uniform(5, 1, 2).unwrap();
        assert!(CountPipeline::new(config(9), router, None).is_err());
    }

    #[test]
    fn test_counts_every_kmer() {
        let pipeline = CountPipeline::with_uniform_router(config(9), None).unwrap();
        let chunks = vec![
            Chunk::from_sequences("n0", &["ACGGTCATTGACCATGCA"], SampleKind::Normal),
            Chunk::from_sequences("t0", &["ACGGTCATTGACCATGCA"], SampleKind::Tumor),
            Chunk::from_sequences("t1", &["ACGGTCATTGACCATGCA"], SampleKind::Tumor),
        ];
        let result = pipeline.run(&chunks).unwrap();

        assert_eq!(result.loader_stats.reads, 3);
        assert_eq!(result.loader_stats.stems, 30);
        assert_eq!(result.counter_stats.updates, 30);
        let table = &result.table;
        assert_eq!(table.lookup_kmer(b"ACGGTCATT"), Some((1, 2)));
        assert_eq!(table.lookup_kmer(b"GACCATGCA"), Some((1, 2)));
        // reverse complement of the last k-mer: same root, other orientation
        assert_eq!(table.lookup_kmer(b"TGCATGGTC"), Some((0, 0)));

        let observations: u64 = table
            .iter()
            .flat_map(|(_, value)| value.iter())
            .map(|(_, counts)| counts.total())
            .sum();
        assert_eq!(observations, 30);
    }

    #[test]
    fn test_oracle_limits_counting() {
        let kept = kmer::encode(b"CGGTCAT");
        let oracle: Arc<dyn PruneOracle> = Arc::new(crate::oracle::RootSetOracle::from_stems([kept], 7));
        let pipeline = CountPipeline::with_uniform_router(config(9), Some(oracle)).unwrap();
        let chunks = vec![Chunk::from_sequences("n", &["ACGGTCATTGA"], SampleKind::Normal)];
        let result = pipeline.run(&chunks).unwrap();

        assert_eq!(result.table.len(), 1);
        assert_eq!(result.counter_stats.discarded, 2);
    }

    fn spilling_config(tmp: &std::path::Path) -> CountConfiguration {
        CountConfiguration {
            num_shards: 1,
            batch_size: 4,
            queue_capacity: 1,
            use_cache: false,
            spill: true,
            table_target_size: 2,
            spill_fraction: 0.5,
            tmp_dirname: tmp.to_path_buf(),
            ..config(9)
        }
    }

    #[test]
    fn test_failed_slice_write_stops_the_run() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = spilling_config(tmp.path());
        let pipeline = CountPipeline::with_uniform_router(config.clone(), None).unwrap();

        // a directory where the first slice should go makes the write fail
        let store = SliceStore::new(tmp.path(), 7, 0, config.stem_len()).unwrap();
        let blocked = store.slice_path(0);
        std::fs::create_dir(&blocked).unwrap();
        let counters = vec![ShardCounter::new(0, &config, None, Some(store))];

        // enough batches to fill the queues many times over
        let reads = vec!["ACGGTCATTGACCATGCA"; 200];
        let chunks = vec![
            Chunk::from_sequences("n", &reads, SampleKind::Normal),
            Chunk::from_sequences("t", &reads, SampleKind::Tumor),
        ];
        let Err(err) = pipeline.ingest(&chunks, counters) else {
            panic!("ingestion succeeded despite the failed slice write");
        };
        let message = format!("{err:#}");
        assert!(message.contains("Shard 0 failed"), "{message}");
        assert!(message.contains(&blocked.display().to_string()), "{message}");
    }

    #[test]
    fn test_unusable_temp_dir_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let not_a_dir = tmp.path().join("slices");
        std::fs::write(&not_a_dir, b"").unwrap();

        let pipeline = CountPipeline::with_uniform_router(spilling_config(&not_a_dir), None).unwrap();
        let chunks = vec![Chunk::from_sequences("n", &["ACGGTCATTGA"], SampleKind::Normal)];
        let err = pipeline.run(&chunks).unwrap_err();
        assert!(format!("{err:#}").contains(&not_a_dir.display().to_string()));
    }
}
