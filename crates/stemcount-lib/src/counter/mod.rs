//! Counter module: the partitioned count stage
//!
//! This module implements the concurrent counting pipeline:
//! 1. Loaders extract stems from reads and route them to shards
//! 2. Batches travel over per-(shard, loader) lock-free queues
//! 3. Shard counters apply the cache-then-promote update
//! 4. Oversized shard tables spill to disk as slices
//! 5. Converters re-key each shard by root and merge the shards

pub mod batch;
pub mod config;
pub mod convert;
pub mod loader;
pub mod pipeline;
pub mod shard;
pub mod spill;

pub use batch::{QueueMesh, StemUpdate};
pub use config::{ConfigError, CountConfiguration};
pub use convert::ConvertStats;
pub use loader::LoaderStats;
pub use pipeline::{CountPipeline, CountResult};
pub use shard::{CounterStats, ShardCounter};
pub use spill::SliceStore;
