//! Head ablation for causal scoring
//!
//! Each ablation zeroes one head's `attn.hook_result` slice for a single
//! forward pass and measures how much the next-token loss rises.
//!
//! ## Example
//!
//! ```ignore
//! use circuit_lens::{ablation_scores_for, AblationSpec, AttnOnlyTransformer};
//!
//! // Score only the heads of layer 1
//! let spec = AblationSpec::new().layer(1);
//! let scores = ablation_scores_for(&model, &tokens, &spec)?;
//! println!("most important: {:?}", scores.argmax());
//! ```

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use tracing::{debug, info};

use crate::error::{check_index, CircuitError};
use crate::heads::{HeadId, HeadScores};
use crate::hooks::HeadAblationHook;
use crate::model::HookedModel;

/// Which layers an ablation sweep covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSpec {
    /// Every layer
    All,
    /// Listed layers only
    Specific(Vec<usize>),
    /// Inclusive layer range
    Range { start: usize, end: usize },
}

/// Which heads an ablation sweep covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadSpec {
    /// Every head
    All,
    /// Listed heads only
    Specific(Vec<usize>),
}

/// Selection of heads to ablate, one at a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AblationSpec {
    pub layers: LayerSpec,
    pub heads: HeadSpec,
}

impl AblationSpec {
    /// Every head of every layer
    pub fn new() -> Self {
        Self {
            layers: LayerSpec::All,
            heads: HeadSpec::All,
        }
    }

    pub fn layer(mut self, layer: usize) -> Self {
        self.layers = LayerSpec::Specific(vec![layer]);
        self
    }

    pub fn layers(mut self, layers: &[usize]) -> Self {
        self.layers = LayerSpec::Specific(layers.to_vec());
        self
    }

    /// Inclusive range
    pub fn layer_range(mut self, start: usize, end: usize) -> Self {
        self.layers = LayerSpec::Range { start, end };
        self
    }

    pub fn head(mut self, head: usize) -> Self {
        self.heads = HeadSpec::Specific(vec![head]);
        self
    }

    pub fn heads(mut self, heads: &[usize]) -> Self {
        self.heads = HeadSpec::Specific(heads.to_vec());
        self
    }

    pub fn applies_to_layer(&self, layer: usize) -> bool {
        match &self.layers {
            LayerSpec::All => true,
            LayerSpec::Specific(layers) => layers.contains(&layer),
            LayerSpec::Range { start, end } => layer >= *start && layer <= *end,
        }
    }

    pub fn applies_to_head(&self, head: usize) -> bool {
        match &self.heads {
            HeadSpec::All => true,
            HeadSpec::Specific(heads) => heads.contains(&head),
        }
    }

    /// Check every layer and head against the model dimensions
    pub fn validate(&self, n_layers: usize, n_heads: usize) -> Result<()> {
        match &self.layers {
            LayerSpec::Specific(layers) => {
                for &l in layers {
                    check_index("layer", l, n_layers)?;
                }
            }
            LayerSpec::Range { start, end } => {
                check_index("layer", *end, n_layers)?;
                if start > end {
                    anyhow::bail!("Invalid layer range: start {start} > end {end}");
                }
            }
            LayerSpec::All => {}
        }
        if let HeadSpec::Specific(heads) = &self.heads {
            for &h in heads {
                check_index("head", h, n_heads)?;
            }
        }
        Ok(())
    }

    /// Selected heads in ascending (layer, head) order
    pub fn targets(&self, n_layers: usize, n_heads: usize) -> Vec<HeadId> {
        (0..n_layers)
            .filter(|&l| self.applies_to_layer(l))
            .flat_map(|l| {
                (0..n_heads)
                    .filter(|&h| self.applies_to_head(h))
                    .map(move |h| HeadId::new(l, h))
            })
            .collect()
    }
}

impl Default for AblationSpec {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of ablating a single head
#[derive(Debug)]
pub struct AblationResult {
    pub head: HeadId,
    /// Mean next-token loss without intervention
    pub baseline_loss: f32,
    /// Mean next-token loss with the head zeroed
    pub ablated_loss: f32,
    /// Logits from the baseline pass `[seq, d_vocab]`
    pub baseline_logits: Tensor,
    /// Logits from the ablated pass `[seq, d_vocab]`
    pub ablated_logits: Tensor,
}

impl AblationResult {
    /// Loss increase caused by the ablation
    pub fn score(&self) -> f32 {
        self.ablated_loss - self.baseline_loss
    }

    /// KL(baseline || ablated) of the next-token distribution at the last position
    pub fn kl_divergence(&self) -> Result<f32> {
        let last = self.baseline_logits.dim(0)?.saturating_sub(1);
        kl_divergence(
            &self.baseline_logits.get(last)?,
            &self.ablated_logits.get(last)?,
        )
    }
}

/// Log-probability the model assigns to each actual next token
///
/// `logits` is `[seq, d_vocab]`; returns `[seq - 1]` where entry `p` is
/// `log_softmax(logits[p])[tokens[p + 1]]`.
pub fn token_log_probs(logits: &Tensor, tokens: &[u32]) -> Result<Tensor> {
    let (seq, vocab) = logits.dims2()?;
    if seq != tokens.len() {
        return Err(CircuitError::shape(
            "token_log_probs",
            format!("logits for {} tokens", tokens.len()),
            format!("{seq} positions"),
        )
        .into());
    }
    if seq < 2 {
        return Err(CircuitError::shape("token_log_probs", "at least 2 tokens", format!("{seq}")).into());
    }
    for &t in &tokens[1..] {
        check_index("token", t as usize, vocab)?;
    }
    let log_probs =
        candle_nn::ops::log_softmax(&logits.narrow(0, 0, seq - 1)?.to_dtype(DType::F32)?, D::Minus1)?;
    let next = Tensor::new(&tokens[1..], logits.device())?.unsqueeze(1)?;
    Ok(log_probs.gather(&next, 1)?.squeeze(1)?)
}

/// Mean next-token cross-entropy of one sequence
pub fn cross_entropy_loss(logits: &Tensor, tokens: &[u32]) -> Result<f32> {
    let log_probs = token_log_probs(logits, tokens)?;
    Ok(-log_probs.mean_all()?.to_scalar::<f32>()?)
}

/// KL(P || Q) between the softmax distributions of two logit vectors
pub fn kl_divergence(baseline_logits: &Tensor, ablated_logits: &Tensor) -> Result<f32> {
    let p = softmax_to_vec(baseline_logits)?;
    let q = softmax_to_vec(ablated_logits)?;
    Ok(p.iter()
        .zip(q.iter())
        .filter(|(&pi, &qi)| pi > 1e-10 && qi > 1e-10)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum())
}

fn softmax_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
    Ok(probs.flatten_all()?.to_vec1()?)
}

/// Ablate a single head and compare with the clean pass
pub fn ablate_head<M: HookedModel + ?Sized>(
    model: &M,
    tokens: &[u32],
    head: HeadId,
) -> Result<AblationResult> {
    check_index("layer", head.layer, model.n_layers())?;
    check_index("head", head.head, model.n_heads())?;
    let baseline_logits = model.forward(tokens)?;
    let baseline_loss = cross_entropy_loss(&baseline_logits, tokens)?;
    let mut hook = HeadAblationHook::new(head);
    let ablated_logits = model.run_with_hooks(tokens, &mut [&mut hook])?;
    let ablated_loss = cross_entropy_loss(&ablated_logits, tokens)?;
    Ok(AblationResult {
        head,
        baseline_loss,
        ablated_loss,
        baseline_logits,
        ablated_logits,
    })
}

/// Loss increase from zeroing each head, one forward pass per head
pub fn ablation_scores<M: HookedModel + ?Sized>(model: &M, tokens: &[u32]) -> Result<HeadScores> {
    ablation_scores_for(model, tokens, &AblationSpec::new())
}

/// [`ablation_scores`] restricted to the heads selected by `spec`; other
/// entries stay zero
pub fn ablation_scores_for<M: HookedModel + ?Sized>(
    model: &M,
    tokens: &[u32],
    spec: &AblationSpec,
) -> Result<HeadScores> {
    let (n_layers, n_heads) = (model.n_layers(), model.n_heads());
    spec.validate(n_layers, n_heads)?;

    let baseline_loss = cross_entropy_loss(&model.forward(tokens)?, tokens)?;
    info!("Baseline loss {:.4} over {} tokens", baseline_loss, tokens.len());

    let mut scores = HeadScores::zeros(n_layers, n_heads);
    for target in spec.targets(n_layers, n_heads) {
        let mut hook = HeadAblationHook::new(target);
        let logits = model.run_with_hooks(tokens, &mut [&mut hook])?;
        let delta = cross_entropy_loss(&logits, tokens)? - baseline_loss;
        debug!("Ablated {}: loss delta {:+.5}", target, delta);
        scores.set(target.layer, target.head, delta)?;
    }
    Ok(scores)
}
