//! Transient forward-pass hooks
//!
//! A hook is handed to a single `run_with_hooks` call. At every hook point the
//! model asks each hook whether it [`wants`](ActivationHook::wants) the
//! activation and, if so, replaces the activation with whatever
//! [`call`](ActivationHook::call) returns. Nothing outlives the call: the
//! model is borrowed immutably and hooks are plain values owned by the caller.

use anyhow::Result;
use candle_core::{DType, Tensor};

use crate::attention::PatternView;
use crate::cache::{ActivationCache, ActivationKey, ActivationKind, CacheBuilder};
use crate::config::ModelConfig;
use crate::error::check_index;
use crate::heads::{HeadId, HeadScores};

/// Read or overwrite one named activation during a forward pass
pub trait ActivationHook {
    /// Whether this hook should see the activation at `key`
    fn wants(&self, key: &ActivationKey) -> bool;

    /// Inspect `activation` and return the tensor the pass should continue with
    fn call(&mut self, key: &ActivationKey, activation: Tensor) -> Result<Tensor>;
}

/// Thread `activation` through every hook that wants `key`, in order
pub fn apply_hooks(
    hooks: &mut [&mut dyn ActivationHook],
    key: ActivationKey,
    mut activation: Tensor,
) -> Result<Tensor> {
    for hook in hooks.iter_mut() {
        if hook.wants(&key) {
            activation = hook.call(&key, activation)?;
        }
    }
    Ok(activation)
}

/// Records activations into a [`CacheBuilder`]
#[derive(Debug)]
pub struct CachingHook {
    builder: CacheBuilder,
    kinds: Option<Vec<ActivationKind>>,
}

impl CachingHook {
    /// Cache every activation of a `seq_len`-token pass
    pub fn new(config: &ModelConfig, seq_len: usize) -> Self {
        Self {
            builder: CacheBuilder::new(config, seq_len),
            kinds: None,
        }
    }

    /// Only cache the listed kinds
    pub fn only(mut self, kinds: &[ActivationKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    /// Validate what was recorded
    pub fn into_cache(self) -> Result<ActivationCache> {
        self.builder.build()
    }
}

impl ActivationHook for CachingHook {
    fn wants(&self, key: &ActivationKey) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&key.kind))
    }

    fn call(&mut self, key: &ActivationKey, activation: Tensor) -> Result<Tensor> {
        self.builder.push(*key, activation.clone());
        Ok(activation)
    }
}

/// Zeroes one head's slice of `attn.hook_result`
#[derive(Debug, Clone, Copy)]
pub struct HeadAblationHook {
    target: HeadId,
}

impl HeadAblationHook {
    pub fn new(target: HeadId) -> Self {
        Self { target }
    }

    pub fn target(&self) -> HeadId {
        self.target
    }
}

impl ActivationHook for HeadAblationHook {
    fn wants(&self, key: &ActivationKey) -> bool {
        key.kind == ActivationKind::Result && key.layer == Some(self.target.layer)
    }

    fn call(&mut self, _key: &ActivationKey, activation: Tensor) -> Result<Tensor> {
        // [seq, n_heads, d_model]
        let (_, n_heads, _) = activation.dims3()?;
        check_index("head", self.target.head, n_heads)?;
        let keep: Vec<f32> = (0..n_heads)
            .map(|h| if h == self.target.head { 0.0 } else { 1.0 })
            .collect();
        let keep = Tensor::from_vec(keep, (1, n_heads, 1), activation.device())?
            .to_dtype(activation.dtype())?;
        Ok(activation.broadcast_mul(&keep)?)
    }
}

/// Adds each head's induction-stripe mean into a borrowed score table
///
/// The stripe is the diagonal at offset `-(repeat_len - 1)` of the pattern.
/// Each call adds `weight × stripe mean`, so running one hook per sequence
/// with `weight = 1 / batch` leaves the batch average in the table.
#[derive(Debug)]
pub struct InductionScoreHook<'a> {
    scores: &'a mut HeadScores,
    repeat_len: usize,
    weight: f32,
}

impl<'a> InductionScoreHook<'a> {
    pub fn new(scores: &'a mut HeadScores, repeat_len: usize) -> Self {
        Self {
            scores,
            repeat_len,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }
}

impl ActivationHook for InductionScoreHook<'_> {
    fn wants(&self, key: &ActivationKey) -> bool {
        key.kind == ActivationKind::Pattern
    }

    fn call(&mut self, key: &ActivationKey, activation: Tensor) -> Result<Tensor> {
        let layer = key.layer.unwrap_or_default();
        let offset = -(self.repeat_len as isize - 1);
        let n_heads = activation.dim(0)?;
        let per_head = activation.to_dtype(DType::F32)?;
        for head in 0..n_heads {
            let view = PatternView::from_tensor(&per_head.get(head)?)?;
            self.scores
                .add(layer, head, self.weight * view.diagonal_mean(offset)?)?;
        }
        Ok(activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_ablation_hook_zeroes_only_target() {
        let activation = Tensor::ones((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let mut hook = HeadAblationHook::new(HeadId::new(0, 1));
        let key = ActivationKey::layer(ActivationKind::Result, 0);
        assert!(hook.wants(&key));
        assert!(!hook.wants(&ActivationKey::layer(ActivationKind::Result, 1)));
        assert!(!hook.wants(&ActivationKey::layer(ActivationKind::Z, 0)));

        let out = hook.call(&key, activation).unwrap();
        let sums: Vec<f32> = out.sum((0, 2)).unwrap().to_vec1().unwrap();
        assert_eq!(sums, vec![8.0, 0.0, 8.0]);
    }

    #[test]
    fn test_ablation_hook_rejects_bad_head() {
        let activation = Tensor::ones((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let mut hook = HeadAblationHook::new(HeadId::new(0, 3));
        let key = ActivationKey::layer(ActivationKind::Result, 0);
        assert!(hook.call(&key, activation).is_err());
    }

    #[test]
    fn test_apply_hooks_chains_in_order() {
        let config = ModelConfig {
            n_layers: 1,
            n_heads: 2,
            d_model: 3,
            d_head: 2,
            d_vocab: 5,
            n_ctx: 8,
            ..Default::default()
        };
        let key = ActivationKey::layer(ActivationKind::Result, 0);
        let mut ablate = HeadAblationHook::new(HeadId::new(0, 0));
        let mut caching = CachingHook::new(&config, 2);
        {
            let mut hooks: Vec<&mut dyn ActivationHook> = vec![&mut ablate, &mut caching];
            let activation = Tensor::ones((2, 2, 3), DType::F32, &Device::Cpu).unwrap();
            apply_hooks(&mut hooks, key, activation).unwrap();
        }
        let cache = caching.into_cache().unwrap();
        let cached = cache.result(0).unwrap();
        let total: f32 = cached.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 6.0);
    }

    #[test]
    fn test_induction_hook_accumulates_weighted_mean() {
        let mut scores = HeadScores::zeros(1, 2);
        // seq 3, repeat_len 2 -> offset -1
        let head0 = Tensor::new(&[[1f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], &Device::Cpu)
            .unwrap();
        let head1 = Tensor::new(&[[1f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]], &Device::Cpu)
            .unwrap();
        let pattern = Tensor::stack(&[head0, head1], 0).unwrap();
        let key = ActivationKey::layer(ActivationKind::Pattern, 0);
        for _ in 0..2 {
            let mut hook = InductionScoreHook::new(&mut scores, 2).with_weight(0.5);
            hook.call(&key, pattern.clone()).unwrap();
        }
        assert!((scores.get(0, 0).unwrap() - 1.0).abs() < 1e-6);
        assert!(scores.get(0, 1).unwrap().abs() < 1e-6);
    }
}
