//! Count configuration
//!
//! Parameters for one run of the count stage: k-mer length, thread layout,
//! partitioning, memory targets, spilling and the optional pre-filter.

use std::path::PathBuf;

use thiserror::Error;

use crate::constants::{
    is_valid_k, stem_len, DEFAULT_BATCH_SIZE, DEFAULT_CACHE_TARGET_SIZE, DEFAULT_K,
    DEFAULT_PROGRESS_INTERVAL, DEFAULT_QUEUE_CAPACITY, DEFAULT_SPILL_FRACTION,
    DEFAULT_TABLE_TARGET_SIZE, MAX_LOADERS, MAX_ROUTER_WINDOW, MAX_SHARDS,
};
use crate::counts::PreFilter;

/// Fatal configuration problems
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// k outside the supported range
    #[error("k outside the supported range, got k={0}")]
    K(usize),
    /// Too many or zero loader threads
    #[error("too many or zero loaders configured: {0}")]
    Loaders(usize),
    /// Too many or zero shards
    #[error("too many or zero shards configured: {0}")]
    Shards(usize),
    /// Partition id does not name a partition
    #[error("partition id {partition_id} out of range for {num_partitions} partition(s)")]
    Partition {
        /// Requested partition id
        partition_id: usize,
        /// Declared number of partitions
        num_partitions: usize,
    },
    /// Router window does not fit the stem
    #[error("router window {window} incompatible with stem length {stem_len} (window too wide or of different parity)")]
    Window {
        /// Window width
        window: usize,
        /// Stem length
        stem_len: usize,
    },
    /// A size parameter that must be positive is zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// Spill fraction outside (0, 1]
    #[error("spill fraction must be in (0, 1], got {0}")]
    SpillFraction(f64),
}

/// Configuration parameters for counting stems
#[derive(Debug, Clone)]
pub struct CountConfiguration {
    /// K-mer length (stem length is k - 2)
    pub k: usize,

    /// Number of loader threads
    pub num_loaders: usize,

    /// Number of shards (one counter thread each) in this partition
    pub num_shards: usize,

    /// Number of independent process partitions of the job
    pub num_partitions: usize,

    /// Partition handled by this process
    pub partition_id: usize,

    /// Bases used to route a stem to its shard
    pub router_window: usize,

    /// Updates per batch
    pub batch_size: usize,

    /// Batches each (shard, loader) queue can hold
    pub queue_capacity: usize,

    /// Expected entries per shard table
    pub table_target_size: usize,

    /// Initial capacity of each shard's singleton cache
    pub cache_target_size: usize,

    /// Defer materialization of roots seen once
    pub use_cache: bool,

    /// Spill shard tables to disk when they grow past the threshold
    pub spill: bool,

    /// Fraction of `table_target_size` that triggers a spill
    pub spill_fraction: f64,

    /// Keep slice files after conversion
    pub keep_slices: bool,

    /// Number of converter workers (0 = one per shard, capped by cores)
    pub converter_threads: usize,

    /// Optional coarse normal/tumor filter applied at conversion
    pub pre_filter: Option<PreFilter>,

    /// Skip reads whose mean Phred quality is below this value
    pub min_mean_quality: Option<f64>,

    /// Reads between loader progress messages
    pub progress_interval: u64,

    /// Directory for slice files
    pub tmp_dirname: PathBuf,
}

impl Default for CountConfiguration {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            num_loaders: 2,
            num_shards: 4,
            num_partitions: 1,
            partition_id: 0,
            router_window: 5, // stem of 29 bases for k=31
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            table_target_size: DEFAULT_TABLE_TARGET_SIZE,
            cache_target_size: DEFAULT_CACHE_TARGET_SIZE,
            use_cache: true,
            spill: false,
            spill_fraction: DEFAULT_SPILL_FRACTION,
            keep_slices: false,
            converter_threads: 0,
            pre_filter: None,
            min_mean_quality: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            tmp_dirname: PathBuf::from("stemcount_tmp"),
        }
    }
}

impl CountConfiguration {
    /// Create a configuration for k-mers of length `k`
    ///
    /// The router window is chosen to match the stem's parity.
    pub fn new(k: usize) -> Result<Self, ConfigError> {
        if !is_valid_k(k) {
            return Err(ConfigError::K(k));
        }
        let router_window = if stem_len(k) % 2 == 0 { 4 } else { 5 };
        let config = Self {
            k,
            router_window: router_window.min(stem_len(k)),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Stem length for this run
    pub fn stem_len(&self) -> usize {
        stem_len(self.k)
    }

    /// Table size at which a shard spills
    pub fn spill_threshold(&self) -> usize {
        ((self.table_target_size as f64) * self.spill_fraction).ceil().max(1.0) as usize
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_k(self.k) {
            return Err(ConfigError::K(self.k));
        }
        if self.num_loaders == 0 || self.num_loaders > MAX_LOADERS {
            return Err(ConfigError::Loaders(self.num_loaders));
        }
        if self.num_shards == 0 || self.num_shards > MAX_SHARDS {
            return Err(ConfigError::Shards(self.num_shards));
        }
        if self.num_partitions == 0 || self.partition_id >= self.num_partitions {
            return Err(ConfigError::Partition {
                partition_id: self.partition_id,
                num_partitions: self.num_partitions,
            });
        }
        let stem_len = self.stem_len();
        if self.router_window == 0
            || self.router_window > MAX_ROUTER_WINDOW
            || self.router_window > stem_len
            || (stem_len - self.router_window) % 2 != 0
        {
            return Err(ConfigError::Window {
                window: self.router_window,
                stem_len,
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch size"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue capacity"));
        }
        if self.table_target_size == 0 {
            return Err(ConfigError::Zero("table target size"));
        }
        if self.progress_interval == 0 {
            return Err(ConfigError::Zero("progress interval"));
        }
        if !(self.spill_fraction > 0.0 && self.spill_fraction <= 1.0) {
            return Err(ConfigError::SpillFraction(self.spill_fraction));
        }
        Ok(())
    }

    /// Number of converter workers actually used
    pub fn effective_converter_threads(&self) -> usize {
        let requested = if self.converter_threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            self.converter_threads
        };
        requested.max(1).min(self.num_shards.max(1))
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Count Configuration:");
        tracing::info!("  k = {} (stem length {})", self.k, self.stem_len());
        tracing::info!("  loaders = {}", self.num_loaders);
        tracing::info!("  shards = {}", self.num_shards);
        tracing::info!("  partition = {} of {}", self.partition_id, self.num_partitions);
        tracing::debug!("  router_window = {}", self.router_window);
        tracing::debug!("  batch_size = {}", self.batch_size);
        tracing::debug!("  queue_capacity = {}", self.queue_capacity);
        tracing::debug!("  table_target_size = {}", self.table_target_size);
        tracing::debug!("  cache_target_size = {}", self.cache_target_size);
        tracing::info!("  use_cache = {}", self.use_cache);
        tracing::info!("  spill = {}", self.spill);
        tracing::debug!("  spill_fraction = {}", self.spill_fraction);
        tracing::debug!("  keep_slices = {}", self.keep_slices);
        tracing::debug!("  converter_threads = {}", self.effective_converter_threads());
        match &self.pre_filter {
            Some(filter) => tracing::info!("  pre_filter = {:?}", filter),
            None => tracing::info!("  pre_filter = none"),
        }
        tracing::debug!("  min_mean_quality = {:?}", self.min_mean_quality);
        tracing::debug!("  progress_interval = {}", self.progress_interval);
        tracing::debug!("  tmp_dirname = {:?}", self.tmp_dirname);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CountConfiguration::default();
        assert_eq!(config.k, 31);
        assert_eq!(config.stem_len(), 29);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_new_picks_matching_window() {
        let config = CountConfiguration::new(30).unwrap();
        assert_eq!(config.stem_len(), 28);
        assert_eq!(config.router_window, 4);

        let config = CountConfiguration::new(7).unwrap();
        assert_eq!(config.router_window, 5);
    }

    #[test]
    fn test_validate_k_out_of_range() {
        assert_eq!(CountConfiguration::new(4).unwrap_err(), ConfigError::K(4));
        assert_eq!(CountConfiguration::new(35).unwrap_err(), ConfigError::K(35));
    }

    #[test]
    fn test_validate_too_many_threads() {
        let config = CountConfiguration { num_loaders: MAX_LOADERS + 1, ..CountConfiguration::default() };
        assert_eq!(config.validate(), Err(ConfigError::Loaders(MAX_LOADERS + 1)));

        let config = CountConfiguration { num_shards: 0, ..CountConfiguration::default() };
        assert_eq!(config.validate(), Err(ConfigError::Shards(0)));
    }

    #[test]
    fn test_validate_partition() {
        let config = CountConfiguration { num_partitions: 2, partition_id: 2, ..CountConfiguration::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Partition { .. })));
    }

    #[test]
    fn test_validate_window_parity() {
        let config = CountConfiguration { router_window: 4, ..CountConfiguration::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Window { .. })));
    }

    #[test]
    fn test_validate_spill_fraction() {
        let config = CountConfiguration { spill_fraction: 0.0, ..CountConfiguration::default() };
        assert_eq!(config.validate(), Err(ConfigError::SpillFraction(0.0)));
    }

    #[test]
    fn test_spill_threshold() {
        let config = CountConfiguration {
            table_target_size: 100,
            spill_fraction: 0.5,
            ..CountConfiguration::default()
        };
        assert_eq!(config.spill_threshold(), 50);
    }

    #[test]
    fn test_effective_converter_threads() {
        let config = CountConfiguration { num_shards: 3, converter_threads: 8, ..CountConfiguration::default() };
        assert_eq!(config.effective_converter_threads(), 3);
    }
}
