//! Spilling shard tables to disk
//!
//! When a shard's stem table grows past its threshold it is written out as
//! the next numbered slice and replaced by an empty table. Slices are
//! immutable once written; conversion streams them back one at a time
//! through a memory map and sums their records.
//!
//! Slice files live in the run's temp directory:
//! `stemcount.run_<run_id>.shard_<shard>.slice_<n>.bin`

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::debug;

use crate::counts::StemCounts;
use crate::kmer::Key;
use crate::serialization::{self, TableView};
use crate::table::StemTable;

/// Run identifier derived from the clock, unique enough to keep runs apart
pub fn new_run_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
        ^ u64::from(std::process::id())
}

/// Ordered list of the slices a shard has produced
#[derive(Debug)]
pub struct SliceStore {
    /// Temp directory for slice files
    tmp_dir: PathBuf,
    /// Run identifier shared by every shard of the run
    run_id: u64,
    /// Owning shard
    shard: usize,
    /// Stem length of every key
    stem_len: usize,
    /// Entry count of each slice, in production order
    slice_sizes: Vec<u64>,
}

impl SliceStore {
    /// Store for `shard`, creating the temp directory if needed
    pub fn new(tmp_dir: impl AsRef<Path>, run_id: u64, shard: usize, stem_len: usize) -> std::io::Result<Self> {
        let tmp_dir = tmp_dir.as_ref().to_path_buf();
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            tmp_dir,
            run_id,
            shard,
            stem_len,
            slice_sizes: Vec::new(),
        })
    }

    /// Path of slice `n`
    pub fn slice_path(&self, n: usize) -> PathBuf {
        self.tmp_dir.join(format!(
            "stemcount.run_{}.shard_{}.slice_{}.bin",
            self.run_id, self.shard, n
        ))
    }

    /// Write `table` as the next slice
    pub fn write_slice(&mut self, table: &StemTable) -> Result<PathBuf> {
        let path = self.slice_path(self.slice_sizes.len());
        let header = serialization::write_stem_table(&path, table, self.stem_len)
            .with_context(|| format!("Failed to write slice {}", path.display()))?;
        debug!(
            "Shard {}: wrote slice {} ({} entries) to {:?}",
            self.shard,
            self.slice_sizes.len(),
            header.num_entries,
            path
        );
        self.slice_sizes.push(header.num_entries);
        Ok(path)
    }

    /// Number of slices written
    pub fn num_slices(&self) -> usize {
        self.slice_sizes.len()
    }

    /// Entry count of each slice
    pub fn slice_sizes(&self) -> &[u64] {
        &self.slice_sizes
    }

    /// Entries over all slices
    pub fn total_entries(&self) -> u64 {
        self.slice_sizes.iter().sum()
    }

    /// Stream every record of every slice in production order
    ///
    /// Only one slice is mapped at a time. Returns the number of records.
    pub fn for_each_record<F>(&self, mut apply: F) -> Result<u64>
    where
        F: FnMut(Key, &StemCounts),
    {
        let mut num_records = 0u64;
        for (n, &expected) in self.slice_sizes.iter().enumerate() {
            let path = self.slice_path(n);
            let mmap = serialization::map_file(&path)
                .with_context(|| format!("Failed to open slice {}", path.display()))?;
            let view = TableView::parse(&mmap)
                .and_then(|view| view.expect::<StemCounts>(Some(self.stem_len)).map(|()| view))
                .with_context(|| format!("Failed to read slice {}", path.display()))?;
            anyhow::ensure!(
                view.header().num_entries == expected,
                "Slice {} holds {} entries, expected {}",
                path.display(),
                view.header().num_entries,
                expected
            );
            for (key, counts) in view.records::<StemCounts>() {
                apply(key, &counts);
            }
            num_records += expected;
        }
        Ok(num_records)
    }

    /// Delete every slice file
    pub fn remove_slices(&self) -> Result<()> {
        for n in 0..self.slice_sizes.len() {
            let path = self.slice_path(n);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove slice {}", path.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::SampleKind;
    use tempfile::TempDir;

    fn table(keys: &[Key], kind: SampleKind) -> StemTable {
        keys.iter()
            .map(|&key| {
                let mut counts = StemCounts::new();
                counts.increment(0, 3, kind);
                (key, counts)
            })
            .collect()
    }

    #[test]
    fn test_slices_accumulate_in_order() {
        let dir = TempDir::new().unwrap();
        let mut store = SliceStore::new(dir.path(), 42, 3, 5).unwrap();
        assert_eq!(store.num_slices(), 0);

        let first = store.write_slice(&table(&[1, 2, 3], SampleKind::Normal)).unwrap();
        store.write_slice(&table(&[2], SampleKind::Tumor)).unwrap();
        assert!(first.ends_with("stemcount.run_42.shard_3.slice_0.bin"));
        assert_eq!(store.slice_sizes(), &[3, 1]);
        assert_eq!(store.total_entries(), 4);

        let mut merged = StemTable::default();
        let n = store
            .for_each_record(|key, counts| merged.entry(key).or_default().merge_from(counts))
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[&2].pair(0, 3), (1, 1));

        store.remove_slices().unwrap();
        assert!(!store.slice_path(0).exists());
        assert!(!store.slice_path(1).exists());
    }

    #[test]
    fn test_missing_slice_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut store = SliceStore::new(dir.path().join("nested"), 1, 0, 5).unwrap();
        store.write_slice(&table(&[7], SampleKind::Normal)).unwrap();
        fs::remove_file(store.slice_path(0)).unwrap();
        assert!(store.for_each_record(|_, _| {}).is_err());
    }
}
