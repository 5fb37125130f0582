// stemcount: partitioned k-mer stem counting
//
// Counts every k-mer of paired normal/tumor reads by its interior stem,
// folding each stem and its reverse complement onto one root.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod cache;
pub mod constants;
pub mod counter;
pub mod counts;
pub mod encoding;
pub mod export;
pub mod kmer;
pub mod oracle;
pub mod reads;
pub mod router;
pub mod serialization;
pub mod table;

// Re-export common types at crate root
pub use counter::{CountConfiguration, CountPipeline, CountResult};
pub use counts::{PreFilter, RootCounts, SampleKind, StemCounts};
pub use export::TableStats;
pub use kmer::{Key, Orientation};
pub use oracle::{PruneOracle, RootSetOracle};
pub use reads::{Chunk, Read};
pub use router::ShardRouter;
pub use table::{RootTable, StemTable};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let (major, minor, patch) = version();
        assert_eq!(major, 0);
        assert_eq!(minor, 1);
        assert_eq!(patch, 0);
    }
}
