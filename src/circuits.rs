//! Weight-space circuits of attention heads
//!
//! OV and QK circuits are products of embedding, head and unembedding
//! matrices, `d_vocab × d_vocab` when materialised. They are built as
//! [`FactoredMatrix`] values so the full product is only formed in row chunks
//! or on small sampled blocks.

use anyhow::Result;
use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::ActivationCache;
use crate::error::CircuitError;
use crate::factored::FactoredMatrix;
use crate::masks::{apply_causal_mask, INSPECTION_MASK_VALUE};
use crate::model::HookedModel;

/// Full OV circuit `W_E · W_V · W_O · W_U` of one head, `[d_vocab, d_vocab]`
///
/// Row `i` is the effect on the logits of attending to token `i`.
pub fn full_ov_circuit<M: HookedModel + ?Sized>(
    model: &M,
    layer: usize,
    head: usize,
) -> Result<FactoredMatrix> {
    let left = model.w_e().matmul(&model.w_v(layer, head)?)?;
    let right = model.w_o(layer, head)?.matmul(model.w_u())?;
    FactoredMatrix::new(left, right)
}

/// Full QK circuit `W_E · W_Q · W_Kᵀ · W_Eᵀ` of one head, `[d_vocab, d_vocab]`
///
/// Rows are query tokens, columns key tokens.
pub fn full_qk_circuit<M: HookedModel + ?Sized>(
    model: &M,
    layer: usize,
    head: usize,
) -> Result<FactoredMatrix> {
    let w_e = model.w_e();
    let left = w_e.matmul(&model.w_q(layer, head)?)?;
    let right = w_e.matmul(&model.w_k(layer, head)?)?.t()?.contiguous()?;
    FactoredMatrix::new(left, right)
}

/// K-composition circuit: queries from token embeddings, keys from the output
/// of an earlier head, `[d_vocab (query), d_vocab (key)]`
pub fn k_composition_circuit<M: HookedModel + ?Sized>(
    model: &M,
    prev_layer: usize,
    prev_head: usize,
    layer: usize,
    head: usize,
) -> Result<FactoredMatrix> {
    let w_e = model.w_e();
    let q = w_e.matmul(&model.w_q(layer, head)?)?;
    let k = w_e
        .matmul(&model.w_v(prev_layer, prev_head)?)?
        .matmul(&model.w_o(prev_layer, prev_head)?)?
        .matmul(&model.w_k(layer, head)?)?;
    FactoredMatrix::new(q, k.t()?.contiguous()?)
}

/// How per-head weight blocks are joined in [`effective_ov_circuit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OvConcatAxis {
    /// `W_V` blocks side by side, `W_O` blocks stacked: the sum of the
    /// per-head OV circuits
    #[default]
    Stacked,
    /// `W_V` and `W_O` blocks both side by side. Only composes for a single
    /// head; with two or more it fails with a shape mismatch.
    SideBySide,
}

impl std::str::FromStr for OvConcatAxis {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stacked" => Ok(Self::Stacked),
            "side-by-side" => Ok(Self::SideBySide),
            other => anyhow::bail!("Unknown concat axis '{other}' (expected stacked or side-by-side)"),
        }
    }
}

/// Combined OV circuit of several heads in one layer
pub fn effective_ov_circuit<M: HookedModel + ?Sized>(
    model: &M,
    layer: usize,
    heads: &[usize],
    axis: OvConcatAxis,
) -> Result<FactoredMatrix> {
    if heads.is_empty() {
        return Err(CircuitError::shape("effective_ov_circuit", "at least one head", "none").into());
    }
    let w_v = heads
        .iter()
        .map(|&h| model.w_v(layer, h))
        .collect::<Result<Vec<_>>>()?;
    let w_o = heads
        .iter()
        .map(|&h| model.w_o(layer, h))
        .collect::<Result<Vec<_>>>()?;

    let w_v = Tensor::cat(&w_v, 1)?;
    let w_o = match axis {
        OvConcatAxis::Stacked => Tensor::cat(&w_o, 0)?,
        OvConcatAxis::SideBySide => Tensor::cat(&w_o, 1)?,
    };
    let d_model = model.config().d_model;
    if w_o.dim(1)? != d_model {
        return Err(CircuitError::shape(
            "effective_ov_circuit",
            format!("concatenated W_O with {d_model} columns"),
            format!("{:?} ({axis:?})", w_o.dims()),
        )
        .into());
    }
    FactoredMatrix::new(model.w_e().matmul(&w_v)?, w_o.matmul(model.w_u())?)
}

/// Fraction of rows of a square circuit whose largest entry is on the diagonal
///
/// The product is materialised `chunk_rows` rows at a time.
pub fn top_1_accuracy(circuit: &FactoredMatrix, chunk_rows: usize) -> Result<f64> {
    let (rows, cols) = circuit.shape();
    if rows != cols {
        return Err(CircuitError::shape(
            "top_1_accuracy",
            "square circuit",
            format!("{rows}x{cols}"),
        )
        .into());
    }
    if rows == 0 {
        return Err(CircuitError::shape("top_1_accuracy", "non-empty circuit", "0x0").into());
    }
    if chunk_rows == 0 {
        anyhow::bail!("chunk_rows must be positive");
    }
    let mut hits = 0usize;
    for start in (0..rows).step_by(chunk_rows) {
        let end = (start + chunk_rows).min(rows);
        let indices: Vec<usize> = (start..end).collect();
        let block = circuit.select_rows(&indices)?.ab()?;
        let argmax: Vec<u32> = block.argmax(1)?.to_vec1()?;
        hits += argmax
            .iter()
            .zip(start..end)
            .filter(|(&best, row)| best as usize == *row)
            .count();
    }
    debug!("top-1 diagonal hits: {}/{}", hits, rows);
    Ok(hits as f64 / rows as f64)
}

/// `circuit[I, I]` for `n` indices drawn uniformly (with replacement)
pub fn sample_diagonal_block(circuit: &FactoredMatrix, n: usize, seed: u64) -> Result<FactoredMatrix> {
    let bound = circuit.ldim().min(circuit.rdim());
    if bound == 0 {
        return Err(CircuitError::shape(
            "sample_diagonal_block",
            "non-empty circuit",
            format!("{}x{}", circuit.ldim(), circuit.rdim()),
        )
        .into());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let indices: Vec<usize> = (0..n).map(|_| rng.gen_range(0..bound)).collect();
    circuit.index(&indices, &indices)
}

/// Fill everything above the diagonal with a large negative score
pub fn mask_scores(attn_scores: &Tensor) -> Result<Tensor> {
    apply_causal_mask(attn_scores, INSPECTION_MASK_VALUE)
}

/// Attention pattern produced by positional embeddings alone,
/// `softmax(mask(W_pos W_Q W_Kᵀ W_posᵀ) / √d_head)`, `[n_ctx, n_ctx]`
pub fn pos_by_pos_pattern<M: HookedModel + ?Sized>(
    model: &M,
    layer: usize,
    head: usize,
) -> Result<Tensor> {
    let w_pos = model.w_pos();
    let q = w_pos.matmul(&model.w_q(layer, head)?)?;
    let k = w_pos.matmul(&model.w_k(layer, head)?)?;
    let scores = q.matmul(&k.t()?)?;
    let scaled = (mask_scores(&scores)? * model.config().attn_scale())?;
    Ok(candle_nn::ops::softmax_last_dim(&scaled)?)
}

/// Split the query/key input of `layer` into its additive components
///
/// Returns `[2 + layer * n_heads, seq, d_model]`: token embedding, positional
/// embedding, then the result of every head in earlier layers. Attention
/// output biases are not included.
pub fn decompose_qk_input(cache: &ActivationCache, layer: usize) -> Result<Tensor> {
    if layer >= cache.n_layers() {
        return Err(CircuitError::out_of_range("layer", layer, cache.n_layers()).into());
    }
    let mut parts = vec![cache.embed()?.unsqueeze(0)?, cache.pos_embed()?.unsqueeze(0)?];
    for l in 0..layer {
        parts.push(cache.result(l)?.transpose(0, 1)?.contiguous()?);
    }
    Ok(Tensor::cat(&parts, 0)?)
}

/// Project each component through one head's `W_Q`: `[n_components, seq, d_head]`
///
/// Sums to the head's queries minus the query bias.
pub fn decompose_q<M: HookedModel + ?Sized>(
    model: &M,
    decomposed_qk_input: &Tensor,
    layer: usize,
    head: usize,
) -> Result<Tensor> {
    Ok(decomposed_qk_input.broadcast_matmul(&model.w_q(layer, head)?)?)
}

/// Project each component through one head's `W_K`: `[n_components, seq, d_head]`
pub fn decompose_k<M: HookedModel + ?Sized>(
    model: &M,
    decomposed_qk_input: &Tensor,
    layer: usize,
    head: usize,
) -> Result<Tensor> {
    Ok(decomposed_qk_input.broadcast_matmul(&model.w_k(layer, head)?)?)
}

/// Attention-score contribution of every (query component, key component)
/// pair: `[n_q, n_k, q_pos, k_pos]`, unscaled
pub fn decompose_attn_scores(decomposed_q: &Tensor, decomposed_k: &Tensor) -> Result<Tensor> {
    let (_, _, dq) = decomposed_q.dims3()?;
    let (_, _, dk) = decomposed_k.dims3()?;
    if dq != dk {
        return Err(CircuitError::shape(
            "decompose_attn_scores",
            format!("keys with d_head {dq}"),
            format!("{:?}", decomposed_k.dims()),
        )
        .into());
    }
    let q = decomposed_q.unsqueeze(1)?;
    let k = decomposed_k.transpose(1, 2)?.contiguous()?.unsqueeze(0)?;
    Ok(q.broadcast_matmul(&k)?)
}

/// Standard deviation (unbiased) of each component pair's scores over all
/// query/key positions: `[n_q, n_k]`
pub fn component_score_stds(decomposed_scores: &Tensor) -> Result<Tensor> {
    let (n_q, n_k, q_pos, k_pos) = decomposed_scores.dims4()?;
    let n = q_pos * k_pos;
    let flat = decomposed_scores
        .to_dtype(DType::F32)?
        .reshape((n_q, n_k, n))?;
    let centered = flat.broadcast_sub(&flat.mean_keepdim(2)?)?;
    let var = (centered.sqr()?.sum(2)? / (n.max(2) - 1) as f64)?;
    Ok(var.sqrt()?)
}
