//! Typed activation cache for a single forward pass
//!
//! Activations are addressed by `(ActivationKind, layer)` instead of free-form
//! strings. Every entry is validated once, when the snapshot is built, so
//! later lookups only need to check presence and head bounds.

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ModelConfig;
use crate::error::{check_index, CircuitError};

/// Every activation a hooked forward pass exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActivationKind {
    /// Token embedding `[seq, d_model]`
    Embed,
    /// Positional embedding `[seq, d_model]`
    PosEmbed,
    /// Residual stream entering a layer `[seq, d_model]`
    ResidPre,
    /// Queries `[seq, n_heads, d_head]`
    Q,
    /// Keys `[seq, n_heads, d_head]`
    K,
    /// Values `[seq, n_heads, d_head]`
    V,
    /// Scaled, masked pre-softmax scores `[n_heads, seq, seq]`
    AttnScores,
    /// Attention pattern `[n_heads, seq, seq]`
    Pattern,
    /// Pattern-weighted values `[seq, n_heads, d_head]`
    Z,
    /// Per-head output in the residual basis `[seq, n_heads, d_model]`
    Result,
    /// Summed attention output `[seq, d_model]`
    AttnOut,
    /// Residual stream leaving a layer `[seq, d_model]`
    ResidPost,
}

impl ActivationKind {
    pub const ALL: [ActivationKind; 12] = [
        Self::Embed,
        Self::PosEmbed,
        Self::ResidPre,
        Self::Q,
        Self::K,
        Self::V,
        Self::AttnScores,
        Self::Pattern,
        Self::Z,
        Self::Result,
        Self::AttnOut,
        Self::ResidPost,
    ];

    /// Whether this activation exists once per layer
    pub fn is_per_layer(&self) -> bool {
        !matches!(self, Self::Embed | Self::PosEmbed)
    }

    /// Whether the activation has a head axis
    pub fn has_heads(&self) -> bool {
        matches!(
            self,
            Self::Q | Self::K | Self::V | Self::AttnScores | Self::Pattern | Self::Z | Self::Result
        )
    }

    /// Expected shape for a sequence of `seq_len` tokens
    pub fn expected_shape(&self, config: &ModelConfig, seq_len: usize) -> Vec<usize> {
        let (h, dm, dh) = (config.n_heads, config.d_model, config.d_head);
        match self {
            Self::Embed | Self::PosEmbed | Self::ResidPre | Self::AttnOut | Self::ResidPost => {
                vec![seq_len, dm]
            }
            Self::Q | Self::K | Self::V | Self::Z => vec![seq_len, h, dh],
            Self::AttnScores | Self::Pattern => vec![h, seq_len, seq_len],
            Self::Result => vec![seq_len, h, dm],
        }
    }

    fn hook_suffix(&self) -> &'static str {
        match self {
            Self::Embed => "hook_embed",
            Self::PosEmbed => "hook_pos_embed",
            Self::ResidPre => "hook_resid_pre",
            Self::Q => "attn.hook_q",
            Self::K => "attn.hook_k",
            Self::V => "attn.hook_v",
            Self::AttnScores => "attn.hook_attn_scores",
            Self::Pattern => "attn.hook_pattern",
            Self::Z => "attn.hook_z",
            Self::Result => "attn.hook_result",
            Self::AttnOut => "hook_attn_out",
            Self::ResidPost => "hook_resid_post",
        }
    }
}

/// Address of one cached activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationKey {
    pub kind: ActivationKind,
    pub layer: Option<usize>,
}

impl ActivationKey {
    /// Key for a model-level activation (embeddings)
    pub fn global(kind: ActivationKind) -> Self {
        Self { kind, layer: None }
    }

    /// Key for a per-layer activation
    pub fn layer(kind: ActivationKind, layer: usize) -> Self {
        Self {
            kind,
            layer: Some(layer),
        }
    }

    /// TransformerLens hook point name, e.g. `blocks.1.attn.hook_pattern`
    pub fn hook_name(&self) -> String {
        match self.layer {
            Some(l) => format!("blocks.{l}.{}", self.kind.hook_suffix()),
            None => self.kind.hook_suffix().to_string(),
        }
    }

    fn validate(&self, n_layers: usize) -> Result<()> {
        match (self.kind.is_per_layer(), self.layer) {
            (true, Some(l)) => check_index("layer", l, n_layers),
            (false, None) => Ok(()),
            (true, None) => Err(CircuitError::shape(
                "ActivationKey",
                format!("layer index for {:?}", self.kind),
                "none",
            )
            .into()),
            (false, Some(l)) => Err(CircuitError::shape(
                "ActivationKey",
                format!("no layer index for {:?}", self.kind),
                format!("layer {l}"),
            )
            .into()),
        }
    }
}

impl std::fmt::Display for ActivationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hook_name())
    }
}

/// Collects activations during a forward pass; validated by [`CacheBuilder::build`]
#[derive(Debug)]
pub struct CacheBuilder {
    config: ModelConfig,
    seq_len: usize,
    entries: Vec<(ActivationKey, Tensor)>,
}

impl CacheBuilder {
    pub fn new(config: &ModelConfig, seq_len: usize) -> Self {
        Self {
            config: config.clone(),
            seq_len,
            entries: Vec::new(),
        }
    }

    /// Record an activation
    pub fn push(&mut self, key: ActivationKey, tensor: Tensor) {
        self.entries.push((key, tensor));
    }

    /// Builder-style [`push`](Self::push)
    pub fn with(mut self, key: ActivationKey, tensor: Tensor) -> Self {
        self.push(key, tensor);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate every entry and freeze the snapshot
    pub fn build(self) -> Result<ActivationCache> {
        let mut entries = BTreeMap::new();
        for (key, tensor) in self.entries {
            key.validate(self.config.n_layers)?;
            let expected = key.kind.expected_shape(&self.config, self.seq_len);
            if tensor.dims() != expected.as_slice() {
                return Err(CircuitError::shape(
                    "ActivationCache",
                    format!("{key} with shape {expected:?}"),
                    format!("{:?}", tensor.dims()),
                )
                .into());
            }
            if entries.insert(key, tensor).is_some() {
                anyhow::bail!("Activation {key} captured twice");
            }
        }
        Ok(ActivationCache {
            config: self.config,
            seq_len: self.seq_len,
            entries,
        })
    }
}

/// Immutable snapshot of the activations of one forward pass (batch removed)
#[derive(Debug, Clone)]
pub struct ActivationCache {
    config: ModelConfig,
    seq_len: usize,
    entries: BTreeMap<ActivationKey, Tensor>,
}

impl ActivationCache {
    /// Start collecting a cache for a sequence of `seq_len` tokens
    pub fn builder(config: &ModelConfig, seq_len: usize) -> CacheBuilder {
        CacheBuilder::new(config, seq_len)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn n_layers(&self) -> usize {
        self.config.n_layers
    }

    pub fn n_heads(&self) -> usize {
        self.config.n_heads
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ActivationKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Cached keys in (kind, layer) order
    pub fn keys(&self) -> impl Iterator<Item = &ActivationKey> {
        self.entries.keys()
    }

    /// Look up any activation
    pub fn get(&self, key: &ActivationKey) -> Result<&Tensor> {
        self.entries
            .get(key)
            .ok_or_else(|| CircuitError::MissingActivation(key.hook_name()).into())
    }

    /// Per-layer activation
    pub fn layer(&self, kind: ActivationKind, layer: usize) -> Result<&Tensor> {
        check_index("layer", layer, self.n_layers())?;
        self.get(&ActivationKey::layer(kind, layer))
    }

    /// Token embedding `[seq, d_model]`
    pub fn embed(&self) -> Result<&Tensor> {
        self.get(&ActivationKey::global(ActivationKind::Embed))
    }

    /// Positional embedding `[seq, d_model]`
    pub fn pos_embed(&self) -> Result<&Tensor> {
        self.get(&ActivationKey::global(ActivationKind::PosEmbed))
    }

    /// Attention patterns of one layer `[n_heads, seq, seq]`
    pub fn pattern(&self, layer: usize) -> Result<&Tensor> {
        self.layer(ActivationKind::Pattern, layer)
    }

    /// Per-head results of one layer `[seq, n_heads, d_model]`
    pub fn result(&self, layer: usize) -> Result<&Tensor> {
        self.layer(ActivationKind::Result, layer)
    }

    /// One head's attention pattern `[seq, seq]`
    pub fn head_pattern(&self, layer: usize, head: usize) -> Result<Tensor> {
        check_index("head", head, self.n_heads())?;
        Ok(self.pattern(layer)?.i(head)?)
    }

    /// One head's attention pattern as nested rows (dest × source)
    pub fn head_pattern_rows(&self, layer: usize, head: usize) -> Result<Vec<Vec<f32>>> {
        Ok(self
            .head_pattern(layer, head)?
            .to_dtype(DType::F32)?
            .to_vec2()?)
    }

    /// Slice one head out of any activation with a head axis
    pub fn head(&self, kind: ActivationKind, layer: usize, head: usize) -> Result<Tensor> {
        if !kind.has_heads() {
            return Err(CircuitError::shape(
                "ActivationCache::head",
                "activation with a head axis",
                format!("{kind:?}"),
            )
            .into());
        }
        check_index("head", head, self.n_heads())?;
        let t = self.layer(kind, layer)?;
        let out = match kind {
            ActivationKind::AttnScores | ActivationKind::Pattern => t.i(head)?,
            _ => t.i((.., head))?,
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            n_layers: 2,
            n_heads: 3,
            d_model: 8,
            d_head: 2,
            d_vocab: 16,
            n_ctx: 32,
            ..Default::default()
        }
    }

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(
            ActivationKey::layer(ActivationKind::Pattern, 1).hook_name(),
            "blocks.1.attn.hook_pattern"
        );
        assert_eq!(
            ActivationKey::global(ActivationKind::Embed).hook_name(),
            "hook_embed"
        );
    }

    #[test]
    fn test_build_and_lookup() {
        let config = tiny_config();
        let cache = ActivationCache::builder(&config, 5)
            .with(ActivationKey::global(ActivationKind::Embed), zeros(&[5, 8]))
            .with(
                ActivationKey::layer(ActivationKind::Pattern, 0),
                zeros(&[3, 5, 5]),
            )
            .with(
                ActivationKey::layer(ActivationKind::Result, 1),
                zeros(&[5, 3, 8]),
            )
            .build()
            .unwrap();

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.embed().unwrap().dims(), &[5, 8]);
        assert_eq!(cache.head_pattern(0, 2).unwrap().dims(), &[5, 5]);
        assert_eq!(
            cache.head(ActivationKind::Result, 1, 0).unwrap().dims(),
            &[5, 8]
        );
        assert!(cache.pos_embed().is_err());
    }

    #[test]
    fn test_build_rejects_wrong_shape() {
        let config = tiny_config();
        let err = ActivationCache::builder(&config, 5)
            .with(
                ActivationKey::layer(ActivationKind::Pattern, 0),
                zeros(&[3, 5, 4]),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_build_rejects_bad_layer_and_duplicates() {
        let config = tiny_config();
        let bad_layer = ActivationCache::builder(&config, 4)
            .with(
                ActivationKey::layer(ActivationKind::Pattern, 2),
                zeros(&[3, 4, 4]),
            )
            .build();
        assert!(bad_layer.is_err());

        let missing_layer = ActivationCache::builder(&config, 4)
            .with(ActivationKey::global(ActivationKind::Pattern), zeros(&[3, 4, 4]))
            .build();
        assert!(missing_layer.is_err());

        let key = ActivationKey::global(ActivationKind::Embed);
        let dup = ActivationCache::builder(&config, 4)
            .with(key, zeros(&[4, 8]))
            .with(key, zeros(&[4, 8]))
            .build();
        assert!(dup.is_err());
    }

    #[test]
    fn test_head_out_of_range() {
        let config = tiny_config();
        let cache = ActivationCache::builder(&config, 4)
            .with(
                ActivationKey::layer(ActivationKind::Pattern, 0),
                zeros(&[3, 4, 4]),
            )
            .build()
            .unwrap();
        let err = cache.head_pattern(0, 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::IndexOutOfRange { what: "head", .. })
        ));
        let err = cache.pattern(1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::MissingActivation(_))
        ));
    }
}
