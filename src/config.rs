//! Model hyperparameters
//!
//! Field names follow TransformerLens' `HookedTransformerConfig`, so a
//! config dumped from Python loads directly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CircuitError;

/// How positional embeddings enter the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionalEmbedding {
    /// Added to the residual stream once, after the token embedding
    Standard,
    /// Added only to the query/key inputs of every attention layer
    #[default]
    Shortformer,
}

/// Configuration of an attention-only transformer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_model: usize,
    pub d_head: usize,
    pub d_vocab: usize,
    pub n_ctx: usize,
    #[serde(default, rename = "positional_embedding_type")]
    pub positional_embedding: PositionalEmbedding,
    #[serde(default = "default_init_range")]
    pub init_range: f64,
    #[serde(default)]
    pub bos_token_id: u32,
}

fn default_init_range() -> f64 {
    0.02
}

impl Default for ModelConfig {
    /// The two-layer attention-only model of the induction-head exercises
    fn default() -> Self {
        Self {
            n_layers: 2,
            n_heads: 12,
            d_model: 768,
            d_head: 64,
            d_vocab: 50278,
            n_ctx: 2048,
            positional_embedding: PositionalEmbedding::Shortformer,
            init_range: default_init_range(),
            bos_token_id: 0,
        }
    }
}

impl ModelConfig {
    /// Load and validate a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the forward pass cannot run
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("d_model", self.d_model),
            ("d_head", self.d_head),
            ("d_vocab", self.d_vocab),
            ("n_ctx", self.n_ctx),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(CircuitError::InvalidConfig(format!("{name} must be positive")).into());
            }
        }
        if self.bos_token_id as usize >= self.d_vocab {
            return Err(CircuitError::InvalidConfig(format!(
                "bos_token_id {} outside vocabulary of {}",
                self.bos_token_id, self.d_vocab
            ))
            .into());
        }
        if !(self.init_range > 0.0) {
            return Err(
                CircuitError::InvalidConfig(format!("init_range {} must be > 0", self.init_range))
                    .into(),
            );
        }
        Ok(())
    }

    /// Total number of attention heads in the model
    pub fn total_heads(&self) -> usize {
        self.n_layers * self.n_heads
    }

    /// Attention scale `1 / sqrt(d_head)`
    pub fn attn_scale(&self) -> f64 {
        1.0 / (self.d_head as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_matches_two_layer_model() {
        let config = ModelConfig::default();
        assert_eq!(config.n_layers, 2);
        assert_eq!(config.total_heads(), 24);
        assert_eq!(config.positional_embedding, PositionalEmbedding::Shortformer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_json_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"n_layers": 1, "n_heads": 4, "d_model": 16, "d_head": 4,
                "d_vocab": 32, "n_ctx": 64, "positional_embedding_type": "standard"}}"#
        )
        .unwrap();

        let config = ModelConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.n_heads, 4);
        assert_eq!(config.positional_embedding, PositionalEmbedding::Standard);
        assert!((config.init_range - 0.02).abs() < 1e-12);
        assert_eq!(config.bos_token_id, 0);
    }

    #[test]
    fn test_validate_rejects_zero_dims() {
        let config = ModelConfig {
            n_heads: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bos_outside_vocab() {
        let config = ModelConfig {
            d_vocab: 10,
            bos_token_id: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
