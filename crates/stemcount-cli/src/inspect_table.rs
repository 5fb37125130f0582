use stemcount_lib::serialization::{self, TableView, HEADER_BYTES};
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: inspect_table <table file>"))?;
    info!("Mapping table file: {}", path);

    let mmap = serialization::map_file(&path)?;
    let view = TableView::parse(&mmap)?;
    let header = view.header();
    let buckets = view.bucket_counts()?;

    let file_bytes = mmap.len() as u64;
    let entries = header.num_entries.max(1);
    let mb = |bytes: u64| -> f64 { bytes as f64 / 1024.0 / 1024.0 };
    let bpe = |bytes: u64| -> f64 { bytes as f64 / entries as f64 };

    println!("================================================================================");
    println!("STEMCOUNT TABLE - {}", path);
    println!("================================================================================");
    println!();
    println!("  format version:  {}.{}", header.version_major, header.version_minor);
    println!("  record kind:     {:?}", header.kind);
    println!("  stem length:     {} (k = {})", header.stem_len, header.stem_len + 2);
    println!("  entries:         {}", header.num_entries);
    println!("  index buckets:   {}", header.num_index_buckets);
    println!();
    println!("{:<30} {:>14} {:>10} {:>12}", "Section", "Bytes", "MB", "bytes/entry");
    println!("{:<30} {:>14} {:>10} {:>12}", "-".repeat(30), "-".repeat(14), "-".repeat(10), "-".repeat(12));

    let sections = [
        ("Header", HEADER_BYTES as u64),
        ("Bucket index", header.index_bytes),
        ("Records", header.records_bytes()),
    ];
    for (name, bytes) in sections {
        println!("{:<30} {:>14} {:>10.3} {:>12.2}", name, bytes, mb(bytes), bpe(bytes));
    }
    println!("{:<30} {:>14} {:>10.3} {:>12.2}", "TOTAL", file_bytes, mb(file_bytes), bpe(file_bytes));
    if file_bytes > header.file_bytes() {
        println!("  ({} trailing bytes)", file_bytes - header.file_bytes());
    }
    println!();

    let occupied = buckets.iter().filter(|&&c| c > 0).count();
    let largest = buckets.iter().copied().max().unwrap_or(0);
    let mean = header.num_entries as f64 / buckets.len().max(1) as f64;
    println!("Bucket occupancy:");
    println!("  occupied:        {} / {}", occupied, buckets.len());
    println!("  mean entries:    {:.2}", mean);
    println!("  largest bucket:  {}", largest);

    Ok(())
}
