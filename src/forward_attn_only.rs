//! Attention-only transformer with hook points
//!
//! No MLPs and no normalisation: the residual stream is the token embedding
//! plus the summed output of every attention layer. Each head's output is
//! kept separately (`attn.hook_result`) so heads can be cached, ablated and
//! attributed one at a time. With shortformer positional embeddings the
//! positional embedding only enters the query/key inputs.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::cache::{ActivationKey, ActivationKind};
use crate::config::{ModelConfig, PositionalEmbedding};
use crate::error::{check_index, CircuitError};
use crate::hooks::{apply_hooks, ActivationHook};
use crate::masks::{apply_causal_mask, MASKED_SCORE};
use crate::model::{validate_tokens, HookedModel};

/// Weights of one attention layer, in TransformerLens layout
#[derive(Debug, Clone)]
pub struct AttnWeights {
    /// `[n_heads, d_model, d_head]`
    pub w_q: Tensor,
    pub w_k: Tensor,
    pub w_v: Tensor,
    /// `[n_heads, d_head, d_model]`
    pub w_o: Tensor,
    /// `[n_heads, d_head]`
    pub b_q: Tensor,
    pub b_k: Tensor,
    pub b_v: Tensor,
    /// `[d_model]`
    pub b_o: Tensor,
}

/// Every parameter of an attention-only model
#[derive(Debug, Clone)]
pub struct ModelWeights {
    /// `[d_vocab, d_model]`
    pub w_e: Tensor,
    /// `[n_ctx, d_model]`
    pub w_pos: Tensor,
    pub blocks: Vec<AttnWeights>,
    /// `[d_model, d_vocab]`
    pub w_u: Tensor,
    /// `[d_vocab]`
    pub b_u: Tensor,
}

fn normal_tensor(
    rng: &mut StdRng,
    std: f64,
    shape: &[usize],
    device: &Device,
) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n)
        .map(|_| {
            let z: f64 = StandardNormal.sample(rng);
            (z * std) as f32
        })
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() != expected {
        return Err(CircuitError::shape(
            "model weights",
            format!("{name} with shape {expected:?}"),
            format!("{:?}", tensor.dims()),
        )
        .into());
    }
    Ok(())
}

impl ModelWeights {
    /// Normal(0, init_range) weights and zero biases, deterministic in `seed`
    pub fn random(config: &ModelConfig, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let std = config.init_range;
        let (h, dm, dh) = (config.n_heads, config.d_model, config.d_head);

        let w_e = normal_tensor(&mut rng, std, &[config.d_vocab, dm], device)?;
        let w_pos = normal_tensor(&mut rng, std, &[config.n_ctx, dm], device)?;
        let mut blocks = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            blocks.push(AttnWeights {
                w_q: normal_tensor(&mut rng, std, &[h, dm, dh], device)?,
                w_k: normal_tensor(&mut rng, std, &[h, dm, dh], device)?,
                w_v: normal_tensor(&mut rng, std, &[h, dm, dh], device)?,
                w_o: normal_tensor(&mut rng, std, &[h, dh, dm], device)?,
                b_q: Tensor::zeros((h, dh), DType::F32, device)?,
                b_k: Tensor::zeros((h, dh), DType::F32, device)?,
                b_v: Tensor::zeros((h, dh), DType::F32, device)?,
                b_o: Tensor::zeros(dm, DType::F32, device)?,
            });
        }
        let w_u = normal_tensor(&mut rng, std, &[dm, config.d_vocab], device)?;
        let b_u = Tensor::zeros(config.d_vocab, DType::F32, device)?;

        Ok(Self {
            w_e,
            w_pos,
            blocks,
            w_u,
            b_u,
        })
    }

    /// Read a TransformerLens-style state dict (`embed.W_E`,
    /// `blocks.{l}.attn.W_Q`, ...). Missing biases default to zero.
    pub fn from_state_dict(
        config: &ModelConfig,
        mut tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        // `default` is the zero-fill shape for optional tensors (biases)
        let mut take = |name: &str, default: Option<&[usize]>| -> Result<Tensor> {
            match (tensors.remove(name), default) {
                (Some(tensor), _) => Ok(tensor.to_dtype(DType::F32)?),
                (None, Some(shape)) => Ok(Tensor::zeros(shape, DType::F32, device)?),
                (None, None) => anyhow::bail!("Missing weight '{name}'"),
            }
        };
        let (h, dm, dh) = (config.n_heads, config.d_model, config.d_head);
        let w_e = take("embed.W_E", None)?;
        let w_pos = take("pos_embed.W_pos", None)?;
        let w_u = take("unembed.W_U", None)?;
        let b_u = take("unembed.b_U", Some(&[config.d_vocab][..]))?;

        let mut blocks = Vec::with_capacity(config.n_layers);
        for l in 0..config.n_layers {
            let name = |param: &str| format!("blocks.{l}.attn.{param}");
            blocks.push(AttnWeights {
                w_q: take(&name("W_Q"), None)?,
                w_k: take(&name("W_K"), None)?,
                w_v: take(&name("W_V"), None)?,
                w_o: take(&name("W_O"), None)?,
                b_q: take(&name("b_Q"), Some(&[h, dh][..]))?,
                b_k: take(&name("b_K"), Some(&[h, dh][..]))?,
                b_v: take(&name("b_V"), Some(&[h, dh][..]))?,
                b_o: take(&name("b_O"), Some(&[dm][..]))?,
            });
        }
        debug!("{} unused tensors in state dict", tensors.len());

        Ok(Self {
            w_e,
            w_pos,
            blocks,
            w_u,
            b_u,
        })
    }

    /// Check every tensor against the config
    pub fn validate(&self, config: &ModelConfig) -> Result<()> {
        let (h, dm, dh) = (config.n_heads, config.d_model, config.d_head);
        expect_shape("embed.W_E", &self.w_e, &[config.d_vocab, dm])?;
        expect_shape("pos_embed.W_pos", &self.w_pos, &[config.n_ctx, dm])?;
        expect_shape("unembed.W_U", &self.w_u, &[dm, config.d_vocab])?;
        expect_shape("unembed.b_U", &self.b_u, &[config.d_vocab])?;
        if self.blocks.len() != config.n_layers {
            return Err(CircuitError::shape(
                "model weights",
                format!("{} attention blocks", config.n_layers),
                format!("{} blocks", self.blocks.len()),
            )
            .into());
        }
        for block in &self.blocks {
            expect_shape("attn.W_Q", &block.w_q, &[h, dm, dh])?;
            expect_shape("attn.W_K", &block.w_k, &[h, dm, dh])?;
            expect_shape("attn.W_V", &block.w_v, &[h, dm, dh])?;
            expect_shape("attn.W_O", &block.w_o, &[h, dh, dm])?;
            expect_shape("attn.b_Q", &block.b_q, &[h, dh])?;
            expect_shape("attn.b_K", &block.b_k, &[h, dh])?;
            expect_shape("attn.b_V", &block.b_v, &[h, dh])?;
            expect_shape("attn.b_O", &block.b_o, &[dm])?;
        }
        Ok(())
    }
}

/// Project `x [seq, d_model]` through per-head weights `[h, d_model, d_head]`
/// plus bias `[h, d_head]`, giving `[seq, h, d_head]`
fn project_heads(x: &Tensor, w: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (h, dm, dh) = w.dims3()?;
    let seq = x.dim(0)?;
    let w_flat = w.permute((1, 0, 2))?.contiguous()?.reshape((dm, h * dh))?;
    let out = x.matmul(&w_flat)?.reshape((seq, h, dh))?;
    Ok(out.broadcast_add(b)?)
}

/// Attention-only transformer implementing [`HookedModel`]
#[derive(Debug, Clone)]
pub struct AttnOnlyTransformer {
    config: ModelConfig,
    weights: ModelWeights,
    device: Device,
}

impl AttnOnlyTransformer {
    /// Build from explicit weights, validating every shape
    pub fn from_weights(config: ModelConfig, weights: ModelWeights) -> Result<Self> {
        config.validate()?;
        weights.validate(&config)?;
        let device = weights.w_e.device().clone();
        Ok(Self {
            config,
            weights,
            device,
        })
    }

    /// Randomly initialised model (normal weights, zero biases)
    pub fn random(config: ModelConfig, seed: u64, device: &Device) -> Result<Self> {
        config.validate()?;
        let weights = ModelWeights::random(&config, seed, device)?;
        Self::from_weights(config, weights)
    }

    /// Load a safetensors file with TransformerLens parameter names
    pub fn from_safetensors(
        path: impl AsRef<Path>,
        config: ModelConfig,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading weights from {}", path.display());
        config.validate()?;
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load safetensors {}", path.display()))?;
        info!("Read {} tensors", tensors.len());
        let weights = ModelWeights::from_state_dict(&config, tensors, device)?;
        let model = Self::from_weights(config, weights)?;
        info!(
            "Model loaded: {} layers, {} heads, d_model {}, vocab {}",
            model.config.n_layers, model.config.n_heads, model.config.d_model, model.config.d_vocab
        );
        Ok(model)
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    fn block(&self, layer: usize) -> Result<&AttnWeights> {
        check_index("layer", layer, self.config.n_layers)?;
        Ok(&self.weights.blocks[layer])
    }

    fn head_slice(&self, tensor: &Tensor, head: usize) -> Result<Tensor> {
        check_index("head", head, self.config.n_heads)?;
        Ok(tensor.i(head)?)
    }

    /// One attention layer; returns the new residual stream
    fn attention_layer(
        &self,
        layer: usize,
        resid: Tensor,
        pos_embed: &Tensor,
        hooks: &mut [&mut dyn ActivationHook],
    ) -> Result<Tensor> {
        let block = &self.weights.blocks[layer];
        let key = |kind| ActivationKey::layer(kind, layer);

        let resid_pre = apply_hooks(hooks, key(ActivationKind::ResidPre), resid)?;
        let qk_input = match self.config.positional_embedding {
            PositionalEmbedding::Shortformer => (&resid_pre + pos_embed)?,
            PositionalEmbedding::Standard => resid_pre.clone(),
        };

        // [seq, h, d_head]
        let q = project_heads(&qk_input, &block.w_q, &block.b_q)?;
        let q = apply_hooks(hooks, key(ActivationKind::Q), q)?;
        let k = project_heads(&qk_input, &block.w_k, &block.b_k)?;
        let k = apply_hooks(hooks, key(ActivationKind::K), k)?;
        let v = project_heads(&resid_pre, &block.w_v, &block.b_v)?;
        let v = apply_hooks(hooks, key(ActivationKind::V), v)?;

        // [h, seq, seq], rows are destinations
        let q_h = q.transpose(0, 1)?.contiguous()?;
        let k_h = k.transpose(0, 1)?.contiguous()?;
        let scores = (q_h.matmul(&k_h.t()?)? * self.config.attn_scale())?;
        let scores = apply_causal_mask(&scores, MASKED_SCORE)?;
        let scores = apply_hooks(hooks, key(ActivationKind::AttnScores), scores)?;

        let pattern = candle_nn::ops::softmax_last_dim(&scores)?;
        let pattern = apply_hooks(hooks, key(ActivationKind::Pattern), pattern)?;

        let v_h = v.transpose(0, 1)?.contiguous()?;
        let z = pattern.matmul(&v_h)?.transpose(0, 1)?.contiguous()?;
        let z = apply_hooks(hooks, key(ActivationKind::Z), z)?;

        // [h, seq, d_head] x [h, d_head, d_model] -> [seq, h, d_model]
        let z_h = z.transpose(0, 1)?.contiguous()?;
        let result = z_h.matmul(&block.w_o)?.transpose(0, 1)?.contiguous()?;
        let result = apply_hooks(hooks, key(ActivationKind::Result), result)?;

        let attn_out = result.sum(1)?.broadcast_add(&block.b_o)?;
        let attn_out = apply_hooks(hooks, key(ActivationKind::AttnOut), attn_out)?;

        let resid_post = (&resid_pre + &attn_out)?;
        apply_hooks(hooks, key(ActivationKind::ResidPost), resid_post)
    }
}

impl HookedModel for AttnOnlyTransformer {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn run_with_hooks(
        &self,
        tokens: &[u32],
        hooks: &mut [&mut dyn ActivationHook],
    ) -> Result<Tensor> {
        validate_tokens(&self.config, tokens)?;
        let seq_len = tokens.len();
        debug!("Forward pass over {} tokens with {} hooks", seq_len, hooks.len());

        let ids = Tensor::new(tokens, &self.device)?;
        let embed = self.weights.w_e.index_select(&ids, 0)?;
        let embed = apply_hooks(hooks, ActivationKey::global(ActivationKind::Embed), embed)?;
        let pos_embed = self.weights.w_pos.narrow(0, 0, seq_len)?;
        let pos_embed = apply_hooks(
            hooks,
            ActivationKey::global(ActivationKind::PosEmbed),
            pos_embed,
        )?;

        let mut resid = match self.config.positional_embedding {
            PositionalEmbedding::Shortformer => embed,
            PositionalEmbedding::Standard => (&embed + &pos_embed)?,
        };
        for layer in 0..self.config.n_layers {
            resid = self.attention_layer(layer, resid, &pos_embed, hooks)?;
        }

        Ok(resid
            .matmul(&self.weights.w_u)?
            .broadcast_add(&self.weights.b_u)?)
    }

    fn w_e(&self) -> &Tensor {
        &self.weights.w_e
    }

    fn w_pos(&self) -> &Tensor {
        &self.weights.w_pos
    }

    fn w_u(&self) -> &Tensor {
        &self.weights.w_u
    }

    fn b_u(&self) -> &Tensor {
        &self.weights.b_u
    }

    fn w_q(&self, layer: usize, head: usize) -> Result<Tensor> {
        self.head_slice(&self.block(layer)?.w_q, head)
    }

    fn w_k(&self, layer: usize, head: usize) -> Result<Tensor> {
        self.head_slice(&self.block(layer)?.w_k, head)
    }

    fn w_v(&self, layer: usize, head: usize) -> Result<Tensor> {
        self.head_slice(&self.block(layer)?.w_v, head)
    }

    fn w_o(&self, layer: usize, head: usize) -> Result<Tensor> {
        self.head_slice(&self.block(layer)?.w_o, head)
    }

    fn b_o(&self, layer: usize) -> Result<Tensor> {
        Ok(self.block(layer)?.b_o.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::is_lower_triangular;

    fn tiny() -> ModelConfig {
        ModelConfig {
            n_layers: 2,
            n_heads: 3,
            d_model: 16,
            d_head: 4,
            d_vocab: 20,
            n_ctx: 12,
            init_range: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_forward_shapes() {
        let model = AttnOnlyTransformer::random(tiny(), 0, &Device::Cpu).unwrap();
        let logits = model.forward(&[0, 5, 7, 3]).unwrap();
        assert_eq!(logits.dims(), &[4, 20]);
    }

    #[test]
    fn test_random_is_deterministic() {
        let a = AttnOnlyTransformer::random(tiny(), 7, &Device::Cpu).unwrap();
        let b = AttnOnlyTransformer::random(tiny(), 7, &Device::Cpu).unwrap();
        let la: Vec<f32> = a.forward(&[1, 2, 3]).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let lb: Vec<f32> = b.forward(&[1, 2, 3]).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(la, lb);
    }

    #[test]
    fn test_cache_is_complete_and_causal() {
        let config = tiny();
        let model = AttnOnlyTransformer::random(config.clone(), 1, &Device::Cpu).unwrap();
        let (_, cache) = model.run_with_cache(&[0, 4, 8, 12, 16]).unwrap();
        assert_eq!(cache.len(), 2 + config.n_layers * 10);

        for layer in 0..config.n_layers {
            for head in 0..config.n_heads {
                let pattern = cache.head_pattern(layer, head).unwrap();
                assert!(is_lower_triangular(&pattern, 1e-6).unwrap());
                let sums: Vec<f32> = pattern.sum(1).unwrap().to_vec1().unwrap();
                assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
            }
        }
    }

    #[test]
    fn test_result_sums_to_attn_out() {
        let model = AttnOnlyTransformer::random(tiny(), 2, &Device::Cpu).unwrap();
        let (_, cache) = model.run_with_cache(&[3, 1, 4, 1, 5]).unwrap();
        let summed = cache.result(1).unwrap().sum(1).unwrap();
        let attn_out = cache.layer(ActivationKind::AttnOut, 1).unwrap();
        let diff: f32 = (summed - attn_out)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_rejects_bad_tokens() {
        let model = AttnOnlyTransformer::random(tiny(), 0, &Device::Cpu).unwrap();
        let err = model.forward(&[0, 20]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::IndexOutOfRange { what: "token", .. })
        ));
        assert!(model.forward(&[0; 13]).is_err());
    }

    #[test]
    fn test_weight_accessors() {
        let model = AttnOnlyTransformer::random(tiny(), 0, &Device::Cpu).unwrap();
        assert_eq!(model.w_q(1, 2).unwrap().dims(), &[16, 4]);
        assert_eq!(model.w_o(0, 0).unwrap().dims(), &[4, 16]);
        assert!(model.w_v(2, 0).is_err());
        assert!(model.w_k(0, 3).is_err());
    }

    #[test]
    fn test_from_weights_rejects_wrong_shape() {
        let config = tiny();
        let mut weights = ModelWeights::random(&config, 0, &Device::Cpu).unwrap();
        weights.w_u = Tensor::zeros((16, 19), DType::F32, &Device::Cpu).unwrap();
        let err = AttnOnlyTransformer::from_weights(config, weights).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_safetensors_round_trip() {
        let config = tiny();
        let model = AttnOnlyTransformer::random(config.clone(), 3, &Device::Cpu).unwrap();
        let w = model.weights();
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert("embed.W_E".into(), w.w_e.clone());
        tensors.insert("pos_embed.W_pos".into(), w.w_pos.clone());
        tensors.insert("unembed.W_U".into(), w.w_u.clone());
        for (l, block) in w.blocks.iter().enumerate() {
            tensors.insert(format!("blocks.{l}.attn.W_Q"), block.w_q.clone());
            tensors.insert(format!("blocks.{l}.attn.W_K"), block.w_k.clone());
            tensors.insert(format!("blocks.{l}.attn.W_V"), block.w_v.clone());
            tensors.insert(format!("blocks.{l}.attn.W_O"), block.w_o.clone());
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let loaded = AttnOnlyTransformer::from_safetensors(&path, config, &Device::Cpu).unwrap();
        let tokens = [0, 2, 4, 6];
        let a: Vec<f32> = model.forward(&tokens).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = loaded.forward(&tokens).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
