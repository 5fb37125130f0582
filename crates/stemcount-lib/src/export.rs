//! Exports of a root table: CSV, per-read annotation JSON and statistics

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::constants::{floor_log2, NUM_BASES};
use crate::counts::SampleKind;
use crate::encoding::decode_base;
use crate::kmer;
use crate::reads::{Chunk, Read};
use crate::table::RootTable;

/// Header line of the CSV export
pub const CSV_HEADER: &str = "kmer,normal_count,tumor_count";

/// One CSV row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmerRow {
    /// Reconstructed k-mer
    pub kmer: String,
    /// Normal count
    pub normal: u16,
    /// Tumor count
    pub tumor: u16,
}

/// Every (root, orientation, first, last) cell with a count in `(lo, hi)`
///
/// A cell is selected when its normal or its tumor count lies strictly
/// between the bounds. Rows come back sorted by k-mer.
pub fn select_kmers(table: &RootTable, lo: u32, hi: u32) -> Vec<KmerRow> {
    let stem_len = table.stem_len();
    let inside = |n: u16| lo < u32::from(n) && u32::from(n) < hi;
    let mut rows = Vec::new();
    let mut stem_buf = Vec::with_capacity(stem_len);

    for (root, value) in table.iter() {
        for (orientation, counts) in value.iter() {
            if counts.is_empty() {
                continue;
            }
            stem_buf.clear();
            kmer::decode_into(kmer::from_root(root, orientation, stem_len), stem_len, &mut stem_buf);
            for first in 0..NUM_BASES as u8 {
                for last in 0..NUM_BASES as u8 {
                    let (normal, tumor) = counts.pair(first, last);
                    if !inside(normal) && !inside(tumor) {
                        continue;
                    }
                    let mut kmer = String::with_capacity(stem_len + 2);
                    kmer.push(decode_base(first) as char);
                    kmer.extend(stem_buf.iter().map(|&b| b as char));
                    kmer.push(decode_base(last) as char);
                    rows.push(KmerRow { kmer, normal, tumor });
                }
            }
        }
    }
    rows.sort_unstable_by(|a, b| a.kmer.cmp(&b.kmer));
    rows
}

/// Write selected rows as CSV, returning the number of rows
pub fn export_csv<W: Write>(table: &RootTable, lo: u32, hi: u32, writer: &mut W) -> io::Result<u64> {
    writeln!(writer, "{CSV_HEADER}")?;
    let rows = select_kmers(table, lo, hi);
    for row in &rows {
        writeln!(writer, "{},{},{}", row.kmer, row.normal, row.tumor)?;
    }
    Ok(rows.len() as u64)
}

/// [`export_csv`] into a file
pub fn write_csv(path: impl AsRef<Path>, table: &RootTable, lo: u32, hi: u32) -> Result<u64> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let rows = export_csv(table, lo, hi, &mut writer)
        .and_then(|rows| writer.flush().map(|()| rows))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(rows)
}

/// Counts found along one read, keyed by k-mer start position
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadAnnotation {
    /// Read identifier
    pub id: String,
    /// position -> [normal, tumor]
    pub counts: BTreeMap<usize, [u16; 2]>,
}

/// Look up every k-mer of `read` in the table
///
/// Positions whose k-mer has no observation in its orientation are left out.
pub fn annotate_read(table: &RootTable, read: &Read) -> ReadAnnotation {
    let k = table.stem_len() + 2;
    let mut counts = BTreeMap::new();
    for span in read.splits.iter().filter(|span| span.len >= k) {
        for pos in span.offset..=span.offset + span.len - k {
            if let Some((normal, tumor)) = table.lookup_kmer(&read.seq[pos..pos + k]) {
                if normal > 0 || tumor > 0 {
                    counts.insert(pos, [normal, tumor]);
                }
            }
        }
    }
    ReadAnnotation {
        id: String::from_utf8_lossy(&read.id).into_owned(),
        counts,
    }
}

/// Annotate every read of a chunk
pub fn annotate_chunk(table: &RootTable, chunk: &Chunk) -> Result<Vec<ReadAnnotation>> {
    let mut annotations = Vec::new();
    chunk.for_each_read(None, |read| {
        annotations.push(annotate_read(table, read));
        Ok(())
    })?;
    Ok(annotations)
}

/// Write annotations as a JSON array
pub fn write_annotations(path: impl AsRef<Path>, annotations: &[ReadAnnotation]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, annotations)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Aggregate statistics of a root table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Distinct roots
    pub roots: u64,
    /// Non-empty (root, orientation) matrices
    pub stems: u64,
    /// Stems observed exactly once
    pub singletons: u64,
    /// Sum of every counter
    pub observations: u64,
    /// Sum of the normal counters
    pub normal_observations: u64,
    /// Sum of the tumor counters
    pub tumor_observations: u64,
    /// `histogram[i]` = stems whose total lies in [2^i, 2^(i+1))
    pub histogram: Vec<u64>,
}

impl TableStats {
    /// Gather statistics over the whole table
    pub fn from_table(table: &RootTable) -> Self {
        let mut stats = Self {
            roots: table.len() as u64,
            ..Self::default()
        };
        for (_, value) in table.iter() {
            for (_, counts) in value.iter() {
                let total = counts.total();
                if total == 0 {
                    continue;
                }
                stats.stems += 1;
                if total == 1 {
                    stats.singletons += 1;
                }
                stats.observations += total;
                stats.normal_observations += counts.total_of(SampleKind::Normal);
                stats.tumor_observations += counts.total_of(SampleKind::Tumor);

                let bucket = floor_log2(total);
                if stats.histogram.len() <= bucket {
                    stats.histogram.resize(bucket + 1, 0);
                }
                stats.histogram[bucket] += 1;
            }
        }
        stats
    }

    /// Plain-text report
    pub fn render(&self) -> String {
        let mut out = String::new();
        // writing to a String cannot fail
        let _ = writeln!(out, "roots:            {}", self.roots);
        let _ = writeln!(out, "stems:            {}", self.stems);
        let _ = writeln!(out, "singleton stems:  {}", self.singletons);
        let _ = writeln!(
            out,
            "observations:     {} (normal {}, tumor {})",
            self.observations, self.normal_observations, self.tumor_observations
        );
        let _ = writeln!(out, "log2(count) histogram:");
        for (bucket, &stems) in self.histogram.iter().enumerate() {
            let lo = 1u64 << bucket;
            let _ = writeln!(out, "  [{}, {}): {}", lo, lo << 1, stems);
        }
        out
    }

    /// Print the report to standard output
    pub fn print(&self) {
        print!("{}", self.render());
    }
}
