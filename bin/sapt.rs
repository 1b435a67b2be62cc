use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sapt::{SuffixArray, SuffixArrayConfig, WordId};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(name = "sapt")]
#[command(about = "Inspect and maintain a suffix-array phrase index", long_about = None)]
struct Args {
    /// Model directory holding `index/` and `storage/`
    #[arg(long, env = "SAPT_MODEL")]
    model: PathBuf,

    /// JSON configuration file (overrides --prefix-length)
    #[arg(long, env = "SAPT_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum exactly indexed phrase length
    #[arg(long, env = "SAPT_PREFIX_LENGTH", default_value = "4")]
    prefix_length: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print index and storage sizes
    Stats {
        /// Also print Prometheus metrics
        #[arg(long)]
        metrics: bool,
    },
    /// Print phrase records in key order
    Dump {
        /// Stop after this many records (0 = all)
        #[arg(long, default_value = "0")]
        limit: usize,
    },
    /// Count occurrences of a phrase
    Count {
        #[arg(long, value_enum, default_value = "source")]
        side: Side,
        /// Word ids of the phrase
        #[arg(required = true)]
        words: Vec<WordId>,
    },
    /// Persist deferred state and compact the index
    Compact,
    /// Purge domains marked for deletion now
    Sweep,
}

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    Source,
    Target,
}

fn load_config(args: &Args) -> Result<SuffixArrayConfig> {
    match &args.config {
        Some(path) => SuffixArrayConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(SuffixArrayConfig::new(args.prefix_length)),
    }
}

fn open(model: &Path, config: SuffixArrayConfig) -> Result<SuffixArray> {
    if !model.is_dir() {
        bail!("model directory {} does not exist", model.display());
    }
    SuffixArray::open(model, config)
        .with_context(|| format!("failed to open index at {}", model.display()))
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let sa = open(&args.model, config)?;

    info!("sapt v{} - model {}", sapt::VERSION, args.model.display());

    match args.command {
        Command::Stats { metrics } => {
            let stats = sa.stats();
            println!("prefix length:      {}", stats.prefix_length);
            println!("index disk bytes:   {}", stats.index_disk_bytes);
            println!("index keys (approx): {}", stats.index_approximate_keys);
            println!("storage bytes:      {}", stats.storage_bytes);
            println!("storage files:      {}", stats.storage_files);
            println!("streams:            {}", stats.streams);
            for (stream, seq) in sa.streams().iter() {
                println!("  stream {}: {}", stream, seq);
            }
            println!("pending deletions:  {}", stats.pending_deletions);
            if metrics {
                print!("{}", sa.metrics().gather_text());
            }
        }
        Command::Dump { limit } => {
            let limit = if limit == 0 { usize::MAX } else { limit };
            for entry in sa.iter().take(limit) {
                let entry = entry?;
                let side = if entry.is_source { "S" } else { "T" };
                let domain = entry
                    .domain
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let words: Vec<String> = entry.words.iter().map(|w| w.to_string()).collect();
                println!("{}\t{}\t{}\t{}", side, domain, words.join(" "), entry.count);
            }
        }
        Command::Count { side, words } => {
            let is_source = matches!(side, Side::Source);
            let count = sa.count_occurrences(is_source, &words)?;
            println!("{}", count);
        }
        Command::Compact => {
            let start = Instant::now();
            sa.force_compaction()?;
            info!("Compaction finished in {:?}", start.elapsed());
        }
        Command::Sweep => {
            let stats = sa.garbage_collector().sweep_now()?;
            println!(
                "swept {} domains, removed {} keys in {} batches",
                stats.domains, stats.keys_removed, stats.batches
            );
        }
    }

    Ok(())
}
