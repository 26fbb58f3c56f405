use clap::{Parser, Subcommand};
use raptor_lib::{
    build, index, prepare, search, BuildConfig, PrepareConfig, SearchConfig, Shape,
    ThresholdMode,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "raptor")]
#[command(version = "0.1.0")]
#[command(about = "Approximate membership queries over DNA sequence collections", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precompute per-file minimiser sets with occurrence cutoffs
    Prepare {
        /// Bin description file: one user bin per line, whitespace-separated file paths
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for .minimiser/.header pairs
        #[arg(short, long)]
        output: PathBuf,

        /// Window size in bases
        #[arg(short, long, default_value = "24")]
        window: usize,

        /// K-mer length (ignored when --shape is given)
        #[arg(short, long, default_value = "20")]
        kmer: u32,

        /// Gapped shape as a 1/0 string, e.g. 11011
        #[arg(long)]
        shape: Option<String>,

        /// Fixed occurrence cutoff overriding the file-size tiers
        #[arg(long)]
        kmer_count_cutoff: Option<u8>,

        /// Number of threads (0 = all available cores)
        #[arg(short = 't', long, default_value = "0")]
        threads: usize,
    },

    /// Build an index from sequence or minimiser files
    Build {
        /// Bin description file, or a layout file when --hibf is set
        #[arg(short, long)]
        input: PathBuf,

        /// Output index path
        #[arg(short, long)]
        output: PathBuf,

        /// Window size in bases
        #[arg(short, long, default_value = "24")]
        window: usize,

        /// K-mer length (ignored when --shape is given)
        #[arg(short, long, default_value = "20")]
        kmer: u32,

        /// Gapped shape as a 1/0 string, e.g. 11011
        #[arg(long)]
        shape: Option<String>,

        /// Target false-positive rate per bin
        #[arg(long, default_value = "0.05")]
        fpr: f64,

        /// Bloom filter hash function count (2..=5)
        #[arg(long, default_value = "2")]
        hash: u32,

        /// Split the index into this many hash-space partitions (power of 2)
        #[arg(short, long, default_value = "1")]
        parts: usize,

        /// Treat the input as a layout file and build a hierarchical index
        #[arg(long)]
        hibf: bool,

        /// Inputs are .minimiser files from `raptor prepare`
        #[arg(long)]
        input_is_minimiser: bool,

        /// Number of threads (0 = all available cores)
        #[arg(short = 't', long, default_value = "0")]
        threads: usize,
    },

    /// Query an index with a FASTA/FASTQ file
    Search {
        /// Index path (partitioned indices: the path given at build time)
        #[arg(short, long)]
        index: PathBuf,

        /// Query file
        #[arg(short, long)]
        query: PathBuf,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of index partitions, matching the build
        #[arg(short, long, default_value = "1")]
        parts: usize,

        /// Per-base error rate for the probabilistic threshold
        #[arg(short, long, default_value = "0.0")]
        error: f64,

        /// Significance level of the probabilistic threshold
        #[arg(long, default_value = "0.05")]
        tau: f64,

        /// Use a fixed fraction of the query's minimisers instead
        #[arg(long)]
        threshold: Option<f64>,

        /// Use the k-mer lemma bound with this many errors instead
        #[arg(long)]
        max_errors: Option<usize>,

        /// Cache directory for precomputed threshold tables
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Number of threads (0 = all available cores)
        #[arg(short = 't', long, default_value = "0")]
        threads: usize,
    },

    /// Rewrite an index in the current format version
    Upgrade {
        /// Index to upgrade
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the upgraded index
        #[arg(short, long)]
        output: PathBuf,
    },
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
        Commands::Prepare {
            input,
            output,
            window,
            kmer,
            shape,
            kmer_count_cutoff,
            threads,
        } => {
            init_thread_pool(threads)?;
            prepare_command(input, output, window, kmer, shape, kmer_count_cutoff)?;
        }
        Commands::Build {
            input,
            output,
            window,
            kmer,
            shape,
            fpr,
            hash,
            parts,
            hibf,
            input_is_minimiser,
            threads,
        } => {
            init_thread_pool(threads)?;
            build_command(
                input,
                output,
                window,
                kmer,
                shape,
                fpr,
                hash,
                parts,
                hibf,
                input_is_minimiser,
            )?;
        }
        Commands::Search {
            index,
            query,
            output,
            parts,
            error,
            tau,
            threshold,
            max_errors,
            cache_dir,
            threads,
        } => {
            init_thread_pool(threads)?;
            let mode = select_mode(error, tau, threshold, max_errors);
            search_command(index, query, output, parts, mode, cache_dir)?;
        }
        Commands::Upgrade { input, output } => {
            index::upgrade(&input, &output)?;
            info!("upgraded {} -> {}", input.display(), output.display());
        }
    }

    Ok(())
}

/// The --threads flag takes precedence; without it rayon sizes its pool
/// itself, honouring RAYON_NUM_THREADS.
fn init_thread_pool(threads: usize) -> anyhow::Result<()> {
    if threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}

fn resolve_shape(kmer: u32, shape: Option<String>) -> anyhow::Result<Shape> {
    let shape = match shape {
        Some(bits) => Shape::from_bit_string(&bits)?,
        None => Shape::ungapped(kmer)?,
    };
    Ok(shape)
}

fn select_mode(
    error: f64,
    tau: f64,
    threshold: Option<f64>,
    max_errors: Option<usize>,
) -> ThresholdMode {
    if let Some(fraction) = threshold {
        ThresholdMode::Percentage { fraction }
    } else if let Some(errors) = max_errors {
        ThresholdMode::Lemma { errors }
    } else {
        ThresholdMode::Probabilistic {
            error_rate: error,
            p_value: tau,
        }
    }
}

fn prepare_command(
    input: PathBuf,
    output: PathBuf,
    window: usize,
    kmer: u32,
    shape: Option<String>,
    kmer_count_cutoff: Option<u8>,
) -> anyhow::Result<()> {
    let shape = resolve_shape(kmer, shape)?;
    info!("Computing minimiser files...");
    info!("  Input: {}", input.display());
    info!("  Output directory: {}", output.display());
    info!("  w: {window}, shape: {}", shape.to_bit_string());

    let config = PrepareConfig {
        bin_paths: raptor_lib::parse_bin_paths(&input)?,
        out_dir: output,
        shape,
        window_size: window,
        cutoff_override: kmer_count_cutoff,
    };
    prepare::compute_minimisers(&config)?;
    info!("Done.");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_command(
    input: PathBuf,
    output: PathBuf,
    window: usize,
    kmer: u32,
    shape: Option<String>,
    fpr: f64,
    hash: u32,
    parts: usize,
    hibf: bool,
    input_is_minimiser: bool,
) -> anyhow::Result<()> {
    let shape = resolve_shape(kmer, shape)?;
    info!("Building index...");
    info!("  Input: {}", input.display());
    info!("  w: {window}, shape: {}", shape.to_bit_string());
    info!("  fpr: {fpr}, hash functions: {hash}, parts: {parts}");

    let (bin_paths, hibf_layout) = if hibf {
        (Vec::new(), Some(input))
    } else {
        (raptor_lib::parse_bin_paths(&input)?, None)
    };
    let config = BuildConfig {
        bin_paths,
        output,
        shape,
        window_size: window,
        fpr,
        hash_count: hash,
        parts,
        input_is_minimiser,
        hibf_layout,
    };
    build::build_index(&config)?;
    info!("Done.");
    Ok(())
}

fn search_command(
    index: PathBuf,
    query: PathBuf,
    output: Option<PathBuf>,
    parts: usize,
    mode: ThresholdMode,
    cache_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("Searching...");
    info!("  Index: {}", index.display());
    info!("  Query: {}", query.display());

    let config = SearchConfig {
        index_path: index,
        query_path: query,
        output,
        parts,
        mode,
        cache_dir,
    };
    search::search(&config)?;
    info!("Done.");
    Ok(())
}
