//! Induction-head analysis on an attention-only model
//!
//! Loads weights when given (TransformerLens safetensors), otherwise uses a
//! small random model, then runs the detectors, the repeated-token check,
//! ablation scoring and the OV circuit of the strongest induction head.
//!
//! Usage:
//!   cargo run --release --example induction_heads
//!   cargo run --release --example induction_heads -- --weights attn_only_2l.safetensors --config config.json

use anyhow::Result;
use candle_core::Device;
use circuit_lens::{
    ablation_scores, detect_heads, format_heads, full_ov_circuit, generate_repeated_tokens,
    half_performance, induction_scores, token_log_probs, top_1_accuracy, AttnOnlyTransformer,
    HeadDetector, HookedModel, ModelConfig, DEFAULT_THRESHOLD,
};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "induction_heads")]
#[command(about = "Find induction heads and check their circuits")]
struct Args {
    /// Model config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors weights
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Length of the repeated random block
    #[arg(long, default_value_t = 50)]
    repeat_len: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let device = Device::Cpu;

    println!("=== Induction heads ===\n");

    let model = match (&args.weights, &args.config) {
        (Some(weights), Some(config)) => {
            AttnOnlyTransformer::from_safetensors(weights, ModelConfig::from_json_file(config)?, &device)?
        }
        (Some(weights), None) => {
            AttnOnlyTransformer::from_safetensors(weights, ModelConfig::default(), &device)?
        }
        (None, _) => {
            let config = ModelConfig {
                n_heads: 4,
                d_model: 64,
                d_head: 16,
                d_vocab: 500,
                n_ctx: 2 * args.repeat_len + 1,
                ..Default::default()
            };
            println!("No weights given, using a random model");
            AttnOnlyTransformer::random(config, args.seed, &device)?
        }
    };
    let config = model.config().clone();

    let batch = generate_repeated_tokens(config.bos_token_id, config.d_vocab, args.repeat_len, 4, args.seed)?;
    let tokens = &batch[0];
    let (logits, cache) = model.run_with_cache(tokens)?;

    for detector in [
        HeadDetector::current_token(),
        HeadDetector::PreviousToken,
        HeadDetector::FirstToken,
        HeadDetector::Induction { repeat_len: args.repeat_len },
    ] {
        let heads = detect_heads(&cache, detector, DEFAULT_THRESHOLD)?;
        println!("{:<15} {}", format!("{detector}:"), format_heads(&heads));
    }

    let perf = half_performance(&token_log_probs(&logits, tokens)?, args.repeat_len)?;
    println!(
        "\nMean log-prob: first half {:.3}, second half {:.3}",
        perf.first_half, perf.second_half
    );

    let scores = induction_scores(&model, &batch, args.repeat_len)?;
    println!("\nInduction scores (layer × head):");
    for (layer, row) in scores.rows().iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|s| format!("{s:.3}")).collect();
        println!("  L{layer}: {}", cells.join(" "));
    }

    let ablation = ablation_scores(&model, tokens)?;
    if let Some((head, delta)) = ablation.argmax() {
        println!("\nLargest loss increase from ablation: {head} ({delta:+.4})");
    }

    if let Some((head, _)) = scores.argmax() {
        let circuit = full_ov_circuit(&model, head.layer, head.head)?;
        let accuracy = top_1_accuracy(&circuit, 1024)?;
        println!("OV circuit of {head}: top-1 accuracy {:.2}%", accuracy * 100.0);
    }

    Ok(())
}
