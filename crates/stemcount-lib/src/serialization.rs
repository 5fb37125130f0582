//! Binary table files
//!
//! Both spilled shard slices (stem-indexed) and final tables (root-indexed)
//! use the same little-endian layout:
//!
//! ```text
//! TableHeader
//!   ├─ magic: "STEMTBL1"
//!   ├─ version_major: u32
//!   ├─ version_minor: u32
//!   ├─ record_kind: u8        (0 = stem, 1 = root)
//!   ├─ stem_len: u8
//!   ├─ num_entries: u64
//!   ├─ num_index_buckets: u32
//!   └─ index_bytes: u64
//! Bucket index ([num_index_buckets] u32 record counts, bucket = top key bits)
//! Records ([num_entries], ascending key):
//!   ├─ key: u64
//!   └─ counters: 32 u16 (stem) or 64 u16 (root, forward then reverse)
//! ```
//!
//! Readers that only stream records skip the bucket index using
//! `index_bytes`. Files are read through a memory map.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::constants::{floor_log2, stem_len as stem_len_of, MAX_K, MIN_K};
use crate::counts::{RootCounts, StemCounts, STEM_CELLS};
use crate::kmer::{Key, Orientation};
use crate::table::{RootTable, StemTable};

/// Magic bytes of a table file
pub const MAGIC: &[u8; 8] = b"STEMTBL1";

/// File format version: (major, minor)
/// Increment major on breaking changes, minor on compatible changes
pub const FORMAT_VERSION: (u32, u32) = (1, 0);

/// Size of the fixed header in bytes
pub const HEADER_BYTES: usize = 8 + 4 + 4 + 1 + 1 + 8 + 4 + 8;

/// Upper bound on bucket index bits
const MAX_INDEX_BITS: usize = 16;

/// Errors reading or writing table files
#[derive(Error, Debug)]
pub enum SerializationError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Not a table file
    #[error("invalid magic number for stem table file")]
    Magic,
    /// Written by an incompatible version
    #[error("incompatible format version {major}.{minor} (expected major {expected})")]
    Version {
        /// Major version found
        major: u32,
        /// Minor version found
        minor: u32,
        /// Major version supported
        expected: u32,
    },
    /// Record kind byte is not known
    #[error("unknown record kind {0}")]
    UnknownKind(u8),
    /// File holds the other record kind
    #[error("expected {expected:?} records, found {found:?}")]
    Kind {
        /// Kind requested by the caller
        expected: RecordKind,
        /// Kind stored in the file
        found: RecordKind,
    },
    /// Stem length does not match the caller's
    #[error("stem length {found} does not match expected {expected}")]
    StemLen {
        /// Stem length requested by the caller
        expected: usize,
        /// Stem length stored in the file
        found: usize,
    },
    /// Stem length outside the supported k range
    #[error("stem length {0} is outside the supported range")]
    InvalidStemLen(usize),
    /// Bucket index size or bucket count malformed
    #[error("malformed bucket index: {buckets} buckets in {bytes} bytes")]
    IndexLayout {
        /// Bucket count from the header
        buckets: u32,
        /// Index size from the header
        bytes: u64,
    },
    /// File shorter than its header claims
    #[error("file truncated: need {expected} bytes, found {actual}")]
    Truncated {
        /// Bytes the header implies
        expected: u64,
        /// Bytes present
        actual: u64,
    },
    /// Bucket index inconsistent with the entry count
    #[error("bucket index sums to {indexed} but header declares {declared} entries")]
    Index {
        /// Sum of the bucket counts
        indexed: u64,
        /// Entry count from the header
        declared: u64,
    },
}

/// What a record's value holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// One stem matrix per record (slices)
    Stem = 0,
    /// Both orientation matrices per record (final tables)
    Root = 1,
}

impl RecordKind {
    fn from_byte(byte: u8) -> Result<Self, SerializationError> {
        match byte {
            0 => Ok(RecordKind::Stem),
            1 => Ok(RecordKind::Root),
            other => Err(SerializationError::UnknownKind(other)),
        }
    }

    /// Number of u16 counters per record
    pub const fn num_cells(self) -> usize {
        match self {
            RecordKind::Stem => STEM_CELLS,
            RecordKind::Root => 2 * STEM_CELLS,
        }
    }

    /// Size of one record in bytes
    pub const fn record_bytes(self) -> usize {
        8 + 2 * self.num_cells()
    }
}

/// Fixed-size header at the start of every table file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableHeader {
    /// Format version major number
    pub version_major: u32,
    /// Format version minor number
    pub version_minor: u32,
    /// Kind of records stored
    pub kind: RecordKind,
    /// Stem length of every key
    pub stem_len: usize,
    /// Number of records
    pub num_entries: u64,
    /// Number of buckets in the index
    pub num_index_buckets: u32,
    /// Size of the index in bytes
    pub index_bytes: u64,
}

impl TableHeader {
    /// Header for `num_entries` records of `kind`
    pub fn new(kind: RecordKind, stem_len: usize, num_entries: u64) -> Self {
        let num_index_buckets = 1u32 << index_bits(num_entries, stem_len);
        Self {
            version_major: FORMAT_VERSION.0,
            version_minor: FORMAT_VERSION.1,
            kind,
            stem_len,
            num_entries,
            num_index_buckets,
            index_bytes: u64::from(num_index_buckets) * 4,
        }
    }

    /// Write header to a writer
    pub fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&self.version_major.to_le_bytes())?;
        writer.write_all(&self.version_minor.to_le_bytes())?;
        writer.write_all(&[self.kind as u8])?;
        writer.write_all(&[self.stem_len as u8])?;
        writer.write_all(&self.num_entries.to_le_bytes())?;
        writer.write_all(&self.num_index_buckets.to_le_bytes())?;
        writer.write_all(&self.index_bytes.to_le_bytes())?;
        Ok(())
    }

    /// Read and check a header from a reader
    pub fn read(reader: &mut dyn Read) -> Result<Self, SerializationError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SerializationError::Magic);
        }

        let mut u32_bytes = [0u8; 4];
        let mut u64_bytes = [0u8; 8];
        let mut byte = [0u8; 1];

        reader.read_exact(&mut u32_bytes)?;
        let version_major = u32::from_le_bytes(u32_bytes);
        reader.read_exact(&mut u32_bytes)?;
        let version_minor = u32::from_le_bytes(u32_bytes);
        if version_major != FORMAT_VERSION.0 {
            return Err(SerializationError::Version {
                major: version_major,
                minor: version_minor,
                expected: FORMAT_VERSION.0,
            });
        }

        reader.read_exact(&mut byte)?;
        let kind = RecordKind::from_byte(byte[0])?;
        reader.read_exact(&mut byte)?;
        let stem_len = byte[0] as usize;
        reader.read_exact(&mut u64_bytes)?;
        let num_entries = u64::from_le_bytes(u64_bytes);
        reader.read_exact(&mut u32_bytes)?;
        let num_index_buckets = u32::from_le_bytes(u32_bytes);
        reader.read_exact(&mut u64_bytes)?;
        let index_bytes = u64::from_le_bytes(u64_bytes);

        check_stem_len(stem_len)?;
        let bits = floor_log2(u64::from(num_index_buckets));
        if !num_index_buckets.is_power_of_two()
            || bits > MAX_INDEX_BITS.min(2 * stem_len)
            || index_bytes != u64::from(num_index_buckets) * 4
        {
            return Err(SerializationError::IndexLayout {
                buckets: num_index_buckets,
                bytes: index_bytes,
            });
        }

        Ok(Self {
            version_major,
            version_minor,
            kind,
            stem_len,
            num_entries,
            num_index_buckets,
            index_bytes,
        })
    }

    /// Size of the record section in bytes (saturates at `u64::MAX`)
    pub fn records_bytes(&self) -> u64 {
        self.num_entries.saturating_mul(self.kind.record_bytes() as u64)
    }

    /// Total file size implied by the header (saturates at `u64::MAX`)
    pub fn file_bytes(&self) -> u64 {
        (HEADER_BYTES as u64)
            .saturating_add(self.index_bytes)
            .saturating_add(self.records_bytes())
    }

    /// Index bucket of a key
    pub fn bucket_of(&self, key: Key) -> usize {
        let bits = floor_log2(u64::from(self.num_index_buckets));
        if bits == 0 {
            0
        } else {
            (key >> (2 * self.stem_len - bits)) as usize
        }
    }
}

/// Reject stem lengths no valid k produces
fn check_stem_len(stem_len: usize) -> Result<(), SerializationError> {
    if (stem_len_of(MIN_K)..=stem_len_of(MAX_K)).contains(&stem_len) {
        Ok(())
    } else {
        Err(SerializationError::InvalidStemLen(stem_len))
    }
}

/// Index bits for a file of `num_entries` keys of `stem_len` bases
fn index_bits(num_entries: u64, stem_len: usize) -> usize {
    floor_log2(num_entries)
        .saturating_sub(4)
        .min(MAX_INDEX_BITS)
        .min(2 * stem_len)
}

/// Value type that can be stored as a table record
pub trait TableRecord: Sized {
    /// Record kind tag stored in the header
    const KIND: RecordKind;

    /// Write the counters in record order
    fn write_cells(&self, writer: &mut dyn Write) -> io::Result<()>;

    /// Decode from exactly `KIND.num_cells() * 2` bytes
    fn read_cells(bytes: &[u8]) -> Self;
}

fn write_stem_cells(counts: &StemCounts, writer: &mut dyn Write) -> io::Result<()> {
    let mut buf = [0u8; 2 * STEM_CELLS];
    for (chunk, value) in buf.chunks_exact_mut(2).zip(counts.iter_cells()) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    writer.write_all(&buf)
}

fn read_stem_cells(bytes: &[u8]) -> StemCounts {
    let mut values = [0u16; STEM_CELLS];
    for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(2)) {
        *value = u16::from_le_bytes([chunk[0], chunk[1]]);
    }
    StemCounts::from_array(&values)
}

impl TableRecord for StemCounts {
    const KIND: RecordKind = RecordKind::Stem;

    fn write_cells(&self, writer: &mut dyn Write) -> io::Result<()> {
        write_stem_cells(self, writer)
    }

    fn read_cells(bytes: &[u8]) -> Self {
        read_stem_cells(bytes)
    }
}

impl TableRecord for RootCounts {
    const KIND: RecordKind = RecordKind::Root;

    fn write_cells(&self, writer: &mut dyn Write) -> io::Result<()> {
        write_stem_cells(self.get(Orientation::Forward), writer)?;
        write_stem_cells(self.get(Orientation::Reverse), writer)
    }

    fn read_cells(bytes: &[u8]) -> Self {
        let (forward, reverse) = bytes.split_at(2 * STEM_CELLS);
        let mut value = RootCounts::new();
        *value.get_mut(Orientation::Forward) = read_stem_cells(forward);
        *value.get_mut(Orientation::Reverse) = read_stem_cells(reverse);
        value
    }
}

/// Write `(key, value)` pairs, sorted by key, to `writer`
pub fn write_records<'a, V, I>(
    writer: &mut dyn Write,
    stem_len: usize,
    entries: I,
) -> io::Result<TableHeader>
where
    V: TableRecord + 'a,
    I: IntoIterator<Item = (Key, &'a V)>,
{
    let mut entries: Vec<(Key, &V)> = entries.into_iter().collect();
    entries.sort_unstable_by_key(|&(key, _)| key);

    let header = TableHeader::new(V::KIND, stem_len, entries.len() as u64);
    header.write(writer)?;

    let mut index = vec![0u32; header.num_index_buckets as usize];
    for &(key, _) in &entries {
        index[header.bucket_of(key)] += 1;
    }
    for count in &index {
        writer.write_all(&count.to_le_bytes())?;
    }

    for (key, value) in entries {
        writer.write_all(&key.to_le_bytes())?;
        value.write_cells(writer)?;
    }
    Ok(header)
}

/// Borrowed view over the bytes of a table file
pub struct TableView<'a> {
    header: TableHeader,
    index: &'a [u8],
    records: &'a [u8],
}

impl<'a> TableView<'a> {
    /// Parse the header and locate the index and record sections
    pub fn parse(bytes: &'a [u8]) -> Result<Self, SerializationError> {
        let mut reader = bytes;
        let header = TableHeader::read(&mut reader)?;
        // a saturated size never fits, so the casts below cannot wrap
        if header.file_bytes() > bytes.len() as u64 {
            return Err(SerializationError::Truncated {
                expected: header.file_bytes(),
                actual: bytes.len() as u64,
            });
        }
        let index_end = HEADER_BYTES + header.index_bytes as usize;
        let records_end = index_end + header.records_bytes() as usize;
        Ok(Self {
            header,
            index: &bytes[HEADER_BYTES..index_end],
            records: &bytes[index_end..records_end],
        })
    }

    /// Parsed header
    pub fn header(&self) -> &TableHeader {
        &self.header
    }

    /// Decode the bucket index, checking it against the entry count
    pub fn bucket_counts(&self) -> Result<Vec<u32>, SerializationError> {
        let counts: Vec<u32> = self
            .index
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let indexed: u64 = counts.iter().map(|&c| u64::from(c)).sum();
        if indexed != self.header.num_entries {
            return Err(SerializationError::Index {
                indexed,
                declared: self.header.num_entries,
            });
        }
        Ok(counts)
    }

    /// Check that the file holds `V` records of `stem_len` bases
    pub fn expect<V: TableRecord>(&self, stem_len: Option<usize>) -> Result<(), SerializationError> {
        if self.header.kind != V::KIND {
            return Err(SerializationError::Kind {
                expected: V::KIND,
                found: self.header.kind,
            });
        }
        match stem_len {
            Some(expected) if expected != self.header.stem_len => Err(SerializationError::StemLen {
                expected,
                found: self.header.stem_len,
            }),
            _ => Ok(()),
        }
    }

    /// Stream the records in key order
    ///
    /// The caller checks the record kind with [`expect`](Self::expect).
    pub fn records<V: TableRecord>(&self) -> impl Iterator<Item = (Key, V)> + 'a {
        let records: &'a [u8] = self.records;
        records
            .chunks_exact(V::KIND.record_bytes())
            .map(|record| {
                let (key, cells) = record.split_at(8);
                let mut key_bytes = [0u8; 8];
                key_bytes.copy_from_slice(key);
                (u64::from_le_bytes(key_bytes), V::read_cells(cells))
            })
    }
}

/// Memory-map a table file
pub fn map_file(path: impl AsRef<Path>) -> Result<Mmap, SerializationError> {
    let file = File::open(path)?;
    // SAFETY: table files are written once and never modified while mapped
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

fn write_file<'a, V, I>(path: &Path, stem_len: usize, entries: I) -> Result<TableHeader, SerializationError>
where
    V: TableRecord + 'a,
    I: IntoIterator<Item = (Key, &'a V)>,
{
    check_stem_len(stem_len)?;
    let mut writer = BufWriter::new(File::create(path)?);
    let header = write_records(&mut writer, stem_len, entries)?;
    writer.flush()?;
    Ok(header)
}

/// Write a root-indexed table
pub fn write_table(path: impl AsRef<Path>, table: &RootTable) -> Result<TableHeader, SerializationError> {
    write_file(path.as_ref(), table.stem_len(), table.iter())
}

/// Read a root-indexed table
pub fn read_table(path: impl AsRef<Path>) -> Result<RootTable, SerializationError> {
    let mmap = map_file(path)?;
    let view = TableView::parse(&mmap)?;
    view.expect::<RootCounts>(None)?;
    let header = view.header();
    let mut table = RootTable::with_capacity(header.stem_len, header.num_entries as usize);
    for (root, value) in view.records::<RootCounts>() {
        table.insert(root, value);
    }
    Ok(table)
}

/// Write a stem-indexed table
pub fn write_stem_table(
    path: impl AsRef<Path>,
    table: &StemTable,
    stem_len: usize,
) -> Result<TableHeader, SerializationError> {
    write_file(path.as_ref(), stem_len, table.iter().map(|(&key, value)| (key, value)))
}

/// Read a stem-indexed table of `stem_len`-base keys
pub fn read_stem_table(path: impl AsRef<Path>, stem_len: usize) -> Result<StemTable, SerializationError> {
    let mmap = map_file(path)?;
    let view = TableView::parse(&mmap)?;
    view.expect::<StemCounts>(Some(stem_len))?;
    Ok(view.records::<StemCounts>().collect())
}
