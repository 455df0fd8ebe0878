//! Direct logit attribution
//!
//! The unembedding is linear and the model has no final normalisation, so the
//! logit of the true next token splits exactly into one term per residual
//! stream component: the direct embedding path, every head's result and the
//! constant biases.

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::Serialize;

use crate::cache::ActivationCache;
use crate::config::PositionalEmbedding;
use crate::error::{check_index, CircuitError};
use crate::heads::HeadId;
use crate::model::HookedModel;

/// Tolerance for the attribution round trip
pub const DEFAULT_ATTRIBUTION_TOLERANCE: f64 = 1e-3;

/// `W_U[:, tokens[p + 1]]` for every position, as rows `[seq - 1, d_model]`
fn correct_token_directions(w_u: &Tensor, tokens: &[u32]) -> Result<Tensor> {
    let (_, vocab) = w_u.dims2()?;
    for &t in &tokens[1..] {
        check_index("token", t as usize, vocab)?;
    }
    let next = Tensor::new(&tokens[1..], w_u.device())?;
    Ok(w_u.index_select(&next, 1)?.t()?.contiguous()?)
}

/// Per-component contribution to the true next-token logit
///
/// `embed` is `[seq, d_model]`, each entry of `results` is one layer's
/// `[seq, n_heads, d_model]` head outputs and `w_u` is `[d_model, d_vocab]`.
/// Returns `[seq - 1, 1 + n_layers * n_heads]`: the direct path first, then
/// each layer's heads in order.
pub fn logit_attribution(
    embed: &Tensor,
    results: &[Tensor],
    w_u: &Tensor,
    tokens: &[u32],
) -> Result<Tensor> {
    let (seq, d_model) = embed.dims2()?;
    if seq != tokens.len() || seq < 2 {
        return Err(CircuitError::shape(
            "logit_attribution",
            format!("embeddings for {} tokens (at least 2)", tokens.len()),
            format!("{seq} positions"),
        )
        .into());
    }
    let directions = correct_token_directions(w_u, tokens)?;
    if directions.dim(1)? != d_model {
        return Err(CircuitError::shape(
            "logit_attribution",
            format!("W_U with d_model {d_model}"),
            format!("{:?}", w_u.dims()),
        )
        .into());
    }

    let embed = embed.narrow(0, 0, seq - 1)?.to_dtype(directions.dtype())?;
    let mut columns = vec![(embed * &directions)?.sum_keepdim(1)?];
    let per_head_directions = directions.unsqueeze(1)?;
    for result in results {
        let (r_seq, _, r_dm) = result.dims3()?;
        if r_seq != seq || r_dm != d_model {
            return Err(CircuitError::shape(
                "logit_attribution",
                format!("head results [{seq}, n_heads, {d_model}]"),
                format!("{:?}", result.dims()),
            )
            .into());
        }
        let result = result.narrow(0, 0, seq - 1)?.to_dtype(directions.dtype())?;
        columns.push(result.broadcast_mul(&per_head_directions)?.sum(2)?);
    }
    Ok(Tensor::cat(&columns, 1)?)
}

/// Logit attribution of one cached pass, including the bias column
#[derive(Debug, Clone)]
pub struct LogitAttribution {
    /// `[seq - 1, 1 + n_layers * n_heads + 1]`
    attributions: Tensor,
    labels: Vec<String>,
    tokens: Vec<u32>,
}

/// Mean contribution of one component across positions
#[derive(Debug, Clone, Serialize)]
pub struct ComponentAttribution {
    pub component: String,
    pub mean_logit: f32,
}

impl LogitAttribution {
    /// Attribute the next-token logits of `tokens` from a cached pass
    pub fn from_cache<M: HookedModel + ?Sized>(
        model: &M,
        cache: &ActivationCache,
        tokens: &[u32],
    ) -> Result<Self> {
        let config = model.config();
        let mut embed = cache.embed()?.clone();
        if config.positional_embedding == PositionalEmbedding::Standard {
            embed = (embed + cache.pos_embed()?)?;
        }
        let results = (0..config.n_layers)
            .map(|l| cache.result(l).cloned())
            .collect::<Result<Vec<_>>>()?;
        let heads = logit_attribution(&embed, &results, model.w_u(), tokens)?;

        let directions = correct_token_directions(model.w_u(), tokens)?;
        let mut b_o_total = model.b_o(0)?;
        for l in 1..config.n_layers {
            b_o_total = (b_o_total + model.b_o(l)?)?;
        }
        let next = Tensor::new(&tokens[1..], model.device())?;
        let b_u = model.b_u().index_select(&next, 0)?;
        let bias = directions
            .broadcast_mul(&b_o_total.unsqueeze(0)?)?
            .sum(1)?
            .add(&b_u)?
            .unsqueeze(1)?;

        let mut labels = vec!["direct".to_string()];
        for l in 0..config.n_layers {
            for h in 0..config.n_heads {
                labels.push(HeadId::new(l, h).to_string());
            }
        }
        labels.push("bias".to_string());

        Ok(Self {
            attributions: Tensor::cat(&[heads, bias], 1)?,
            labels,
            tokens: tokens.to_vec(),
        })
    }

    /// `[seq - 1, n_components]`
    pub fn attributions(&self) -> &Tensor {
        &self.attributions
    }

    /// Column names: `direct`, `L.H` per head, `bias`
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Sum over components: the reconstructed logit at each position `[seq - 1]`
    pub fn total(&self) -> Result<Tensor> {
        Ok(self.attributions.sum(1)?)
    }

    /// Compare the reconstruction with the model's true next-token logits
    ///
    /// Returns the largest absolute deviation, or
    /// [`CircuitError::ToleranceViolation`] when it exceeds `tolerance`.
    pub fn verify(&self, logits: &Tensor, tolerance: f64) -> Result<f64> {
        let seq = self.tokens.len();
        let next = Tensor::new(&self.tokens[1..], logits.device())?.unsqueeze(1)?;
        let actual = logits
            .narrow(0, 0, seq - 1)?
            .to_dtype(DType::F32)?
            .gather(&next, 1)?
            .squeeze(1)?;
        let deviation = (self.total()?.to_dtype(DType::F32)? - actual)?
            .abs()?
            .max(0)?
            .to_scalar::<f32>()? as f64;
        if deviation > tolerance {
            return Err(CircuitError::ToleranceViolation {
                check: "logit attribution",
                deviation,
                tolerance,
            }
            .into());
        }
        Ok(deviation)
    }

    /// Mean attribution per component, largest first
    pub fn ranked_components(&self) -> Result<Vec<ComponentAttribution>> {
        let means: Vec<f32> = self.attributions.to_dtype(DType::F32)?.mean(0)?.to_vec1()?;
        let mut ranked: Vec<ComponentAttribution> = self
            .labels
            .iter()
            .zip(means)
            .map(|(component, mean_logit)| ComponentAttribution {
                component: component.clone(),
                mean_logit,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.mean_logit
                .partial_cmp(&a.mean_logit)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_hand_computed_attribution() {
        let device = Device::Cpu;
        // d_model 2, vocab 3, seq 3, one layer with one head
        let embed = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [1.0, 1.0]], &device).unwrap();
        let result = Tensor::new(&[[[2f32, 0.0]], [[0.0, 3.0]], [[0.0, 0.0]]], &device).unwrap();
        let w_u = Tensor::new(&[[1f32, 0.0, 2.0], [0.0, 1.0, 0.5]], &device).unwrap();
        let attr = logit_attribution(&embed, &[result], &w_u, &[0, 2, 1]).unwrap();
        assert_eq!(attr.dims(), &[2, 2]);
        let rows: Vec<Vec<f32>> = attr.to_vec2().unwrap();
        // position 0 -> token 2: embed [1,0]·[2,0.5] = 2, head [2,0]·[2,0.5] = 4
        assert_eq!(rows[0], vec![2.0, 4.0]);
        // position 1 -> token 1: embed [0,1]·[0,1] = 1, head [0,3]·[0,1] = 3
        assert_eq!(rows[1], vec![1.0, 3.0]);
    }

    #[test]
    fn test_rejects_mismatched_results() {
        let device = Device::Cpu;
        let embed = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        let result = Tensor::zeros((2, 1, 2), DType::F32, &device).unwrap();
        let w_u = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        assert!(logit_attribution(&embed, &[result], &w_u, &[0, 1, 2]).is_err());
        assert!(logit_attribution(&embed, &[], &w_u, &[0, 1]).is_err());
        assert!(logit_attribution(&embed, &[], &w_u, &[0, 1, 3]).is_err());
    }
}
