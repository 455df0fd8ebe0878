//! circuit-lens CLI: induction-head analysis of attention-only transformers

use anyhow::Result;
use candle_core::Device;
use circuit_lens::{
    format_heads, AttnOnlyTransformer, Experiment, ExperimentConfig, HeadId, ModelConfig,
    TokenCorpus, TraceNormalization,
};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "circuit-lens")]
#[command(about = "Attention-head classification, ablation and circuit analysis")]
#[command(version)]
struct Cli {
    /// Model config JSON (TransformerLens field names)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Safetensors weights; a seeded random model is used when absent
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Token corpus JSON, `{"sequences": [[ids...]]}`; the first sequence
    /// feeds the detectors
    #[arg(short, long)]
    tokens: Option<PathBuf>,

    /// Experiment config JSON; command-line flags override its fields
    #[arg(long)]
    experiment: Option<PathBuf>,

    /// Output directory for report.json
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    #[arg(long)]
    seed: Option<u64>,

    /// Length of the repeated random block
    #[arg(long)]
    repeat_len: Option<usize>,

    /// Number of repeated sequences for the induction scores
    #[arg(long)]
    batch: Option<usize>,

    /// Detector threshold
    #[arg(long)]
    threshold: Option<f32>,

    /// Head whose OV circuit is evaluated, as LAYER.HEAD (repeatable)
    #[arg(long = "ov-head")]
    ov_heads: Vec<HeadId>,

    /// mean-diagonal or trace-over-head-dim
    #[arg(long)]
    current_token_normalization: Option<TraceNormalization>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

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

    println!("=== circuit-lens: induction-head analysis ===");

    let model_config = match &cli.config {
        Some(path) => ModelConfig::from_json_file(path)?,
        None => ModelConfig::default(),
    };

    let mut config = match &cli.experiment {
        Some(path) => ExperimentConfig::from_json_file(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(repeat_len) = cli.repeat_len {
        config.repeat_len = repeat_len;
    }
    if let Some(batch) = cli.batch {
        config.batch = batch;
    }
    if let Some(threshold) = cli.threshold {
        config.threshold = threshold;
    }
    if !cli.ov_heads.is_empty() {
        config.ov_heads = cli.ov_heads.clone();
    }
    if let Some(normalization) = cli.current_token_normalization {
        config.normalization = normalization;
    }
    if let Some(path) = &cli.tokens {
        let corpus = TokenCorpus::load(path)?;
        corpus.validate(model_config.d_vocab, model_config.n_ctx)?;
        info!("Loaded {} token sequences from {}", corpus.len(), path.display());
        config = config.with_corpus(&corpus);
    }

    let device = Device::Cpu;
    let model = match &cli.weights {
        Some(path) => AttnOnlyTransformer::from_safetensors(path, model_config, &device)?,
        None => {
            info!("No weights given, using a random model (seed {})", config.seed);
            AttnOnlyTransformer::random(model_config, config.seed, &device)?
        }
    };

    let experiment = Experiment::new(model, config);
    let report = experiment.run()?;

    println!("\n=== Results ===");
    println!("Current-token heads:  {}", format_heads(&report.current_token_heads));
    println!("Previous-token heads: {}", format_heads(&report.previous_token_heads));
    println!("First-token heads:    {}", format_heads(&report.first_token_heads));
    println!("Induction heads:      {}", format_heads(&report.induction_heads));
    println!(
        "Mean log-prob on repeated tokens: first half {:.3}, second half {:.3}",
        report.repeated_performance.first_half, report.repeated_performance.second_half
    );
    if let Some((head, score)) = report.ablation_scores.argmax() {
        println!("Largest ablation loss increase: {head} ({score:+.4})");
    }
    println!(
        "Logit attribution max deviation: {:.2e} ({})",
        report.attribution.max_deviation,
        if report.attribution.passed { "ok" } else { "FAILED" }
    );
    for ov in &report.ov_accuracy {
        println!("OV circuit {}: top-1 {:.2}%", ov.head, ov.top_1_accuracy * 100.0);
    }

    std::fs::create_dir_all(&cli.output)?;
    let report_path = cli.output.join("report.json");
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;
    info!("Report saved to {}", report_path.display());

    Ok(())
}
