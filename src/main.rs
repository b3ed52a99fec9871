//! elk-rs CLI: extract hidden states for latent knowledge probing

use anyhow::Result;
use clap::{Parser, Subcommand};
use elk_rs::{
    extract, ExtractOptions, ExtractionConfig, HubModelProvider, JsonlPromptSource, PromptConfig,
    TokenLoc, VariantCount,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "elk-rs")]
#[command(about = "Hidden-state extraction for latent knowledge probing")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract hidden states into a cached train/validation dataset
    Extract(ExtractArgs),
}

#[derive(clap::Args)]
struct ExtractArgs {
    /// Model ID from `HuggingFace` or a local directory
    #[arg(short, long)]
    model: String,

    /// Dataset id, optionally with a config ("super_glue boolq")
    #[arg(short, long)]
    dataset: String,

    /// Directory holding pre-rendered prompt corpora
    #[arg(short, long, default_value = "prompts")]
    prompts_dir: PathBuf,

    /// Label column (default: from the dataset's info.json)
    #[arg(long)]
    label_column: Option<String>,

    /// Number of answer classes (default: from the dataset's info.json)
    #[arg(long)]
    num_classes: Option<usize>,

    /// Prompt variants per example (default: every template)
    #[arg(long)]
    num_variants: Option<usize>,

    /// Example limits for train and validation
    #[arg(long, num_args = 2, value_names = ["TRAIN", "VAL"], default_values_t = [750, 250])]
    max_examples: Vec<usize>,

    /// Read prompts lazily
    #[arg(long)]
    stream: bool,

    /// Hidden-state indices to extract (default: all)
    #[arg(long, value_delimiter = ',', conflicts_with = "layer_stride")]
    layers: Vec<usize>,

    /// Extract every k-th block plus the embedding layer
    #[arg(long, default_value_t = 1)]
    layer_stride: usize,

    /// Token whose state summarizes a prompt: first, last or mean
    #[arg(long, default_value = "last")]
    token_loc: String,

    /// Use encoder states of encoder-decoder models
    #[arg(long)]
    use_encoder_states: bool,

    /// Number of GPUs to use (default: all usable)
    #[arg(long)]
    num_gpus: Option<usize>,

    /// Minimum free GPU memory in bytes
    #[arg(long)]
    min_gpu_mem: Option<u64>,

    /// Rebuild even if a cached dataset matches
    #[arg(long)]
    disable_cache: bool,

    /// Cache root
    #[arg(long, default_value = "cache/elk")]
    cache_dir: PathBuf,

    /// Seed for variant sub-sampling
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Extract(args) => run_extract(args),
    }
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let token_loc: TokenLoc = args.token_loc.parse()?;
    let max_examples = match args.max_examples.as_slice() {
        &[train, val] => [train, val],
        other => anyhow::bail!("--max-examples takes two values, got {}", other.len()),
    };
    let prompts = PromptConfig {
        datasets: vec![args.dataset.clone()],
        label_columns: args.label_column.into_iter().collect(),
        num_classes: args.num_classes,
        num_variants: args
            .num_variants
            .map_or(VariantCount::All, VariantCount::Count),
        max_examples,
        seed: args.seed,
        stream: args.stream,
    };
    let cfg = ExtractionConfig::new(
        &args.model,
        prompts,
        args.layers,
        args.layer_stride,
        token_loc,
        args.use_encoder_states,
    )?;
    let options = ExtractOptions {
        disable_cache: args.disable_cache,
        num_gpus: args.num_gpus,
        min_gpu_mem: args.min_gpu_mem,
        cache_dir: args.cache_dir,
        ..Default::default()
    };

    println!("=== elk-rs: hidden-state extraction ===");
    println!("Model:   {}", args.model);
    println!("Dataset: {}", args.dataset);
    println!("Prompts: {}", args.prompts_dir.display());

    let source = JsonlPromptSource::new(&args.prompts_dir);
    let dataset = extract(&cfg, &source, &HubModelProvider, &options)?;
    info!("Fingerprint: {}", dataset.fingerprint());

    println!("\n=== {} ===", dataset.name());
    let schema = dataset.schema();
    println!(
        "Layers: {:?}  variants: {}  classes: {}  hidden: {}",
        schema.layers, schema.num_variants, schema.num_classes, schema.hidden_size
    );
    for split in dataset.splits() {
        println!("{:>12}: {} examples", split.name(), split.len());
    }
    if schema.has_log_probs() {
        println!("Answer log-probabilities stored in model_logits");
    }

    Ok(())
}
