use clap::{Args, Parser, Subcommand};
use stemcount_lib::export::{self, TableStats};
use stemcount_lib::serialization;
use stemcount_lib::{
    Chunk, CountConfiguration, CountPipeline, PreFilter, PruneOracle, RootSetOracle, SampleKind, ShardRouter,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "stemcount")]
#[command(version = "0.1.0")]
#[command(about = "stemcount: partitioned k-mer stem counting for normal/tumor reads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count the k-mers of normal and tumor reads
    Count(CountArgs),

    /// Print statistics of a count table
    Stats {
        /// Count table
        table: PathBuf,
    },

    /// Export k-mers whose normal or tumor count lies in (lo, hi) as CSV
    Export {
        /// Count table
        table: PathBuf,

        /// Exclusive lower bound
        #[arg(long, default_value = "0")]
        lo: u32,

        /// Exclusive upper bound
        #[arg(long, default_value = "65536")]
        hi: u32,

        /// Output CSV file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Annotate every k-mer of a read file with its counts
    Annotate {
        /// Count table
        table: PathBuf,

        /// FASTA/FASTQ reads to annotate
        #[arg(short, long)]
        reads: PathBuf,

        /// Output JSON file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write an evenly distributed router mapping file
    Router {
        /// Bases used for routing
        #[arg(short, long)]
        window: usize,

        /// Number of process partitions
        #[arg(short, long, default_value = "1")]
        partitions: usize,

        /// Shards per partition
        #[arg(short, long)]
        shards: usize,

        /// Output mapping file
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args)]
struct CountArgs {
    /// Normal FASTA/FASTQ files
    #[arg(long, num_args = 1..)]
    normal: Vec<PathBuf>,

    /// Tumor FASTA/FASTQ files
    #[arg(long, num_args = 1..)]
    tumor: Vec<PathBuf>,

    /// K-mer length
    #[arg(short, long, default_value = "31")]
    k: usize,

    /// Loader threads
    #[arg(short, long, default_value = "2")]
    loaders: usize,

    /// Shards (counter threads) per partition
    #[arg(short, long, default_value = "4")]
    shards: usize,

    /// Number of process partitions
    #[arg(long, default_value = "1")]
    partitions: usize,

    /// Partition handled by this process
    #[arg(long, default_value = "0")]
    partition_id: usize,

    /// Router window (defaults to 4 or 5 bases, matching the stem parity)
    #[arg(long)]
    window: Option<usize>,

    /// Router mapping file (an even mapping is generated otherwise)
    #[arg(long)]
    router: Option<PathBuf>,

    /// Only count stems listed in this file
    #[arg(long)]
    prune: Option<PathBuf>,

    /// Updates per batch
    #[arg(long, default_value = "4096")]
    batch_size: usize,

    /// Batches per (shard, loader) queue
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Expected stems per shard table
    #[arg(long, default_value = "4194304")]
    table_size: usize,

    /// Initial singleton cache capacity per shard
    #[arg(long, default_value = "4194304")]
    cache_size: usize,

    /// Materialize every stem on its first sighting
    #[arg(long, default_value = "false")]
    no_cache: bool,

    /// Spill shard tables to disk when they outgrow their threshold
    #[arg(long, default_value = "false")]
    spill: bool,

    /// Fraction of the table size that triggers a spill
    #[arg(long, default_value = "0.9")]
    spill_fraction: f64,

    /// Keep slice files after conversion
    #[arg(long, default_value = "false")]
    keep_slices: bool,

    /// Directory for slice files
    #[arg(long, default_value = "stemcount_tmp")]
    tmp_dir: PathBuf,

    /// Converter threads (0 = one per shard, capped by cores)
    #[arg(short = 't', long, default_value = "0")]
    converter_threads: usize,

    /// Skip reads whose mean Phred quality is below this value
    #[arg(long)]
    min_quality: Option<f64>,

    /// Keep only stems with a tumor-enriched or tumor-depleted cell
    #[arg(long, default_value = "false")]
    pre_filter: bool,

    /// Pre-filter: largest normal count of a tumor-enriched cell
    #[arg(long, default_value = "1")]
    max_normal: u16,

    /// Pre-filter: smallest tumor count of a tumor-enriched cell
    #[arg(long, default_value = "4")]
    min_tumor: u16,

    /// Pre-filter: largest tumor count of a tumor-depleted cell
    #[arg(long, default_value = "1")]
    max_tumor: u16,

    /// Pre-filter: smallest normal count of a tumor-depleted cell
    #[arg(long, default_value = "4")]
    min_normal: u16,

    /// Output count table
    #[arg(short, long, default_value = "counts.stemtbl")]
    output: PathBuf,
}

impl CountArgs {
    fn configuration(&self) -> anyhow::Result<CountConfiguration> {
        let mut config = CountConfiguration::new(self.k)?;
        config.num_loaders = self.loaders;
        config.num_shards = self.shards;
        config.num_partitions = self.partitions;
        config.partition_id = self.partition_id;
        if let Some(window) = self.window {
            config.router_window = window;
        }
        config.batch_size = self.batch_size;
        config.queue_capacity = self.queue_capacity;
        config.table_target_size = self.table_size;
        config.cache_target_size = self.cache_size;
        config.use_cache = !self.no_cache;
        config.spill = self.spill;
        config.spill_fraction = self.spill_fraction;
        config.keep_slices = self.keep_slices;
        config.tmp_dirname = self.tmp_dir.clone();
        config.converter_threads = self.converter_threads;
        config.min_mean_quality = self.min_quality;
        config.pre_filter = self.pre_filter.then_some(PreFilter {
            max_normal: self.max_normal,
            min_tumor: self.min_tumor,
            max_tumor: self.max_tumor,
            min_normal: self.min_normal,
        });
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing: use RUST_LOG if set, otherwise default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Count(args) => {
            count_command(args)?;
        }
        Commands::Stats { table } => {
            stats_command(table)?;
        }
        Commands::Export { table, lo, hi, output } => {
            export_command(table, lo, hi, output)?;
        }
        Commands::Annotate { table, reads, output } => {
            annotate_command(table, reads, output)?;
        }
        Commands::Router { window, partitions, shards, output } => {
            router_command(window, partitions, shards, output)?;
        }
    }

    Ok(())
}

/// Count normal and tumor reads into a root table
fn count_command(args: CountArgs) -> anyhow::Result<()> {
    if args.normal.is_empty() && args.tumor.is_empty() {
        anyhow::bail!("No input: pass --normal and/or --tumor files");
    }
    let config = args.configuration()?;

    let oracle: Option<Arc<dyn PruneOracle>> = match &args.prune {
        Some(path) => {
            let oracle = RootSetOracle::load(path, config.stem_len())?;
            info!("Loaded {} roots from {}", oracle.len(), path.display());
            Some(Arc::new(oracle))
        }
        None => None,
    };

    let pipeline = match &args.router {
        Some(path) => {
            let router = ShardRouter::load(path)?;
            info!("Loaded router mapping from {} (window {})", path.display(), router.window());
            CountPipeline::new(config, router, oracle)?
        }
        None => CountPipeline::with_uniform_router(config, oracle)?,
    };

    let chunks: Vec<Chunk> = args
        .normal
        .iter()
        .map(|path| Chunk::fastx(path, SampleKind::Normal))
        .chain(args.tumor.iter().map(|path| Chunk::fastx(path, SampleKind::Tumor)))
        .collect();
    let result = pipeline.run(&chunks)?;

    info!("Saving count table to {}...", args.output.display());
    let header = serialization::write_table(&args.output, &result.table)?;
    info!("  {} roots, {} bytes", header.num_entries, header.file_bytes());

    TableStats::from_table(&result.table).print();
    Ok(())
}

/// Print statistics of a count table
fn stats_command(table: PathBuf) -> anyhow::Result<()> {
    info!("Loading count table from {}...", table.display());
    let table = serialization::read_table(&table)?;
    TableStats::from_table(&table).print();
    Ok(())
}

/// Export the k-mers of a count table within (lo, hi) as CSV
fn export_command(table: PathBuf, lo: u32, hi: u32, output: PathBuf) -> anyhow::Result<()> {
    if lo >= hi {
        anyhow::bail!("Empty interval: --lo {lo} must be smaller than --hi {hi}");
    }
    info!("Loading count table from {}...", table.display());
    let table = serialization::read_table(&table)?;
    let rows = export::write_csv(&output, &table, lo, hi)?;
    info!("Wrote {} k-mers to {}", rows, output.display());
    Ok(())
}

/// Annotate every read of a FASTA/FASTQ file
fn annotate_command(table: PathBuf, reads: PathBuf, output: PathBuf) -> anyhow::Result<()> {
    info!("Loading count table from {}...", table.display());
    let table = serialization::read_table(&table)?;
    // the sample kind plays no part in lookups
    let chunk = Chunk::fastx(&reads, SampleKind::Normal);
    let annotations = export::annotate_chunk(&table, &chunk)?;
    export::write_annotations(&output, &annotations)?;
    info!("Annotated {} reads into {}", annotations.len(), output.display());
    Ok(())
}

/// Write an evenly distributed router mapping
fn router_command(window: usize, partitions: usize, shards: usize, output: PathBuf) -> anyhow::Result<()> {
    let router = ShardRouter::uniform(window, partitions, shards)?;
    router.write_mapping(&output)?;
    info!(
        "Wrote mapping of {} buckets ({} partition(s) x {} shard(s)) to {}",
        router.num_buckets(),
        partitions,
        shards,
        output.display()
    );
    Ok(())
}
