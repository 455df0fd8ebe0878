//! Hooked model interface
//!
//! Everything the analysis code needs from an execution engine: a forward pass
//! that threads transient hooks, the cached activations of that pass, the
//! hyperparameters and the weight matrices.

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::cache::ActivationCache;
use crate::config::ModelConfig;
use crate::error::{check_index, CircuitError};
use crate::hooks::{ActivationHook, CachingHook};

/// Unified interface over attention-only transformers with hook points.
///
/// Implementors provide the forward pass and weight access; caching and plain
/// forward passes have default implementations built on
/// [`run_with_hooks`](Self::run_with_hooks). Implementations take `&self`, so
/// hooks can never leave state behind in the model.
pub trait HookedModel {
    // --- Metadata ---
    fn config(&self) -> &ModelConfig;
    fn device(&self) -> &Device;

    fn n_layers(&self) -> usize {
        self.config().n_layers
    }

    fn n_heads(&self) -> usize {
        self.config().n_heads
    }

    // --- Forward passes ---

    /// Logits `[seq, d_vocab]` for one token sequence, with `hooks` applied at
    /// every hook point they want
    fn run_with_hooks(&self, tokens: &[u32], hooks: &mut [&mut dyn ActivationHook])
        -> Result<Tensor>;

    fn forward(&self, tokens: &[u32]) -> Result<Tensor> {
        self.run_with_hooks(tokens, &mut [])
    }

    /// Logits plus a validated snapshot of every activation
    fn run_with_cache(&self, tokens: &[u32]) -> Result<(Tensor, ActivationCache)> {
        let mut caching = CachingHook::new(self.config(), tokens.len());
        let logits = self.run_with_hooks(tokens, &mut [&mut caching])?;
        Ok((logits, caching.into_cache()?))
    }

    // --- Weights ---

    /// Token embedding `[d_vocab, d_model]`
    fn w_e(&self) -> &Tensor;
    /// Positional embedding `[n_ctx, d_model]`
    fn w_pos(&self) -> &Tensor;
    /// Unembedding `[d_model, d_vocab]`
    fn w_u(&self) -> &Tensor;
    /// Unembedding bias `[d_vocab]`
    fn b_u(&self) -> &Tensor;
    /// Query weight of one head `[d_model, d_head]`
    fn w_q(&self, layer: usize, head: usize) -> Result<Tensor>;
    /// Key weight of one head `[d_model, d_head]`
    fn w_k(&self, layer: usize, head: usize) -> Result<Tensor>;
    /// Value weight of one head `[d_model, d_head]`
    fn w_v(&self, layer: usize, head: usize) -> Result<Tensor>;
    /// Output weight of one head `[d_head, d_model]`
    fn w_o(&self, layer: usize, head: usize) -> Result<Tensor>;
    /// Attention output bias of one layer `[d_model]`
    fn b_o(&self, layer: usize) -> Result<Tensor>;
}

/// Reject sequences the model cannot embed
pub fn validate_tokens(config: &ModelConfig, tokens: &[u32]) -> Result<()> {
    if tokens.is_empty() {
        return Err(CircuitError::shape("token sequence", "at least one token", "0 tokens").into());
    }
    check_index("position", tokens.len() - 1, config.n_ctx)?;
    for &token in tokens {
        check_index("token", token as usize, config.d_vocab)?;
    }
    Ok(())
}
