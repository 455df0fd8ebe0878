//! Token sequences for the experiments
//!
//! Tokenization is out of scope: sequences are given as token ids, either
//! generated (repeated random blocks) or loaded from a JSON corpus.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{check_index, CircuitError};

/// `batch` sequences of `[bos, r_1..r_S, r_1..r_S]`, `S = repeat_len`
///
/// The random block is drawn uniformly from `0..d_vocab` with a seeded
/// `StdRng`, so the same seed always gives the same batch.
pub fn generate_repeated_tokens(
    bos: u32,
    d_vocab: usize,
    repeat_len: usize,
    batch: usize,
    seed: u64,
) -> Result<Vec<Vec<u32>>> {
    check_index("bos token", bos as usize, d_vocab)?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let vocab = u32::try_from(d_vocab).context("d_vocab does not fit in u32")?;
    Ok((0..batch)
        .map(|_| {
            let block: Vec<u32> = (0..repeat_len).map(|_| rng.gen_range(0..vocab)).collect();
            let mut seq = Vec::with_capacity(1 + 2 * repeat_len);
            seq.push(bos);
            seq.extend_from_slice(&block);
            seq.extend_from_slice(&block);
            seq
        })
        .collect())
}

/// Mean log-probability on the first and the repeated half of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HalfPerformance {
    pub first_half: f32,
    pub second_half: f32,
}

/// Split next-token log-probs of a repeated sequence into its two halves
///
/// `log_probs` has `2 * repeat_len` entries (one per predicted token after
/// the BOS); the first `repeat_len` cover the random block, the rest its
/// repetition.
pub fn half_performance(log_probs: &Tensor, repeat_len: usize) -> Result<HalfPerformance> {
    let values: Vec<f32> = log_probs.to_dtype(DType::F32)?.to_vec1()?;
    if repeat_len == 0 || values.len() != 2 * repeat_len {
        return Err(CircuitError::shape(
            "half_performance",
            format!("{} log-probs", 2 * repeat_len),
            format!("{}", values.len()),
        )
        .into());
    }
    let mean = |xs: &[f32]| xs.iter().sum::<f32>() / xs.len() as f32;
    Ok(HalfPerformance {
        first_half: mean(&values[..repeat_len]),
        second_half: mean(&values[repeat_len..]),
    })
}

/// Raw JSON structure for loading
#[derive(Debug, Deserialize)]
struct CorpusFile {
    sequences: Vec<Vec<u32>>,
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

/// Collection of token-id sequences
#[derive(Debug, Clone, PartialEq)]
pub struct TokenCorpus {
    sequences: Vec<Vec<u32>>,
}

impl TokenCorpus {
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        Self { sequences }
    }

    /// Load `{"sequences": [[ids...], ...]}` from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read token corpus {}", path.display()))?;
        let file: CorpusFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse token corpus {}", path.display()))?;
        Ok(Self {
            sequences: file.sequences,
        })
    }

    /// Check every sequence fits the model
    pub fn validate(&self, d_vocab: usize, n_ctx: usize) -> Result<()> {
        for seq in &self.sequences {
            if seq.is_empty() {
                return Err(CircuitError::shape("token corpus", "non-empty sequences", "empty sequence").into());
            }
            check_index("position", seq.len() - 1, n_ctx)?;
            for &t in seq {
                check_index("token", t as usize, d_vocab)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn sequences(&self) -> &[Vec<u32>] {
        &self.sequences
    }

    pub fn first(&self) -> Option<&[u32]> {
        self.sequences.first().map(Vec::as_slice)
    }
}
