//! Attention-head behaviour detectors
//!
//! Each detector reduces a head's `[seq, seq]` pattern to one positional
//! statistic; heads whose statistic is strictly above a threshold are
//! reported in ascending (layer, head) order.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attention::PatternView;
use crate::cache::ActivationCache;
use crate::heads::{HeadId, HeadScores};
use crate::hooks::InductionScoreHook;
use crate::model::HookedModel;

/// Threshold used throughout the induction-head analysis
pub const DEFAULT_THRESHOLD: f32 = 0.3;

/// How the current-token statistic is normalised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceNormalization {
    /// Mean of the main diagonal (trace / seq_len)
    #[default]
    MeanDiagonal,
    /// Trace divided by `d_head` (legacy calibration).
    ///
    /// Grows with sequence length rather than head size, so a 0.3 threshold
    /// is not comparable to the other detectors' thresholds.
    TraceOverHeadDim,
}

impl std::str::FromStr for TraceNormalization {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean-diagonal" => Ok(Self::MeanDiagonal),
            "trace-over-head-dim" => Ok(Self::TraceOverHeadDim),
            other => anyhow::bail!(
                "Unknown normalization '{other}' (expected mean-diagonal or trace-over-head-dim)"
            ),
        }
    }
}

/// Positional signature a head is tested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadDetector {
    /// Attention from each token to itself
    CurrentToken { normalization: TraceNormalization },
    /// Attention from position `i` to `i - 1`
    PreviousToken,
    /// Attention to position 0
    FirstToken,
    /// Attention from the second copy of a repeated block to the token after
    /// the first occurrence, i.e. the diagonal at offset `-(repeat_len - 1)`
    Induction { repeat_len: usize },
}

impl HeadDetector {
    pub fn current_token() -> Self {
        Self::CurrentToken {
            normalization: TraceNormalization::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CurrentToken { .. } => "current-token",
            Self::PreviousToken => "previous-token",
            Self::FirstToken => "first-token",
            Self::Induction { .. } => "induction",
        }
    }

    /// Statistic of one head's pattern
    pub fn statistic(&self, pattern: &PatternView, d_head: usize) -> Result<f32> {
        match *self {
            Self::CurrentToken {
                normalization: TraceNormalization::MeanDiagonal,
            } => pattern.diagonal_mean(0),
            Self::CurrentToken {
                normalization: TraceNormalization::TraceOverHeadDim,
            } => Ok(pattern.trace() / d_head as f32),
            Self::PreviousToken => pattern.diagonal_mean(-1),
            Self::FirstToken => pattern.column_mean(0),
            Self::Induction { repeat_len } => {
                pattern.diagonal_mean(-(repeat_len as isize - 1))
            }
        }
    }
}

impl std::fmt::Display for HeadDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The detector statistic for every head in the cache
pub fn head_statistics(cache: &ActivationCache, detector: HeadDetector) -> Result<HeadScores> {
    let d_head = cache.config().d_head;
    let mut scores = HeadScores::zeros(cache.n_layers(), cache.n_heads());
    for layer in 0..cache.n_layers() {
        for head in 0..cache.n_heads() {
            let view = PatternView::from_tensor(&cache.head_pattern(layer, head)?)?;
            scores.set(layer, head, detector.statistic(&view, d_head)?)?;
        }
    }
    Ok(scores)
}

/// Heads whose statistic is strictly above `threshold`, ascending (layer, head)
pub fn detect_heads(
    cache: &ActivationCache,
    detector: HeadDetector,
    threshold: f32,
) -> Result<Vec<HeadId>> {
    let heads = head_statistics(cache, detector)?.above(threshold);
    debug!("{} heads above {}: {:?}", detector, threshold, heads);
    Ok(heads)
}

/// Induction score of every head, averaged over a batch of repeated sequences
///
/// Each sequence runs with a fresh [`InductionScoreHook`] that borrows the
/// returned table for that pass only.
pub fn induction_scores<M: HookedModel + ?Sized>(
    model: &M,
    sequences: &[Vec<u32>],
    repeat_len: usize,
) -> Result<HeadScores> {
    let config = model.config();
    let mut scores = HeadScores::zeros(config.n_layers, config.n_heads);
    if sequences.is_empty() {
        return Ok(scores);
    }
    let weight = 1.0 / sequences.len() as f32;
    for tokens in sequences {
        let mut hook = InductionScoreHook::new(&mut scores, repeat_len).with_weight(weight);
        model.run_with_hooks(tokens, &mut [&mut hook])?;
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ActivationKey, ActivationKind};
    use crate::config::ModelConfig;
    use candle_core::{Device, Tensor};

    fn config() -> ModelConfig {
        ModelConfig {
            n_layers: 2,
            n_heads: 2,
            d_model: 4,
            d_head: 2,
            d_vocab: 8,
            n_ctx: 16,
            ..Default::default()
        }
    }

    /// Pattern with all weight on `(i, i + offset)` where it exists, else on 0
    fn shifted(seq: usize, offset: isize) -> Tensor {
        let data: Vec<f32> = (0..seq)
            .flat_map(|i| {
                let target = i as isize + offset;
                let target = if (0..=i as isize).contains(&target) {
                    target as usize
                } else {
                    0
                };
                (0..seq).map(move |j| if j == target { 1.0 } else { 0.0 })
            })
            .collect();
        Tensor::from_vec(data, (seq, seq), &Device::Cpu).unwrap()
    }

    fn cache_of(patterns: [[Tensor; 2]; 2], seq: usize) -> ActivationCache {
        let mut builder = ActivationCache::builder(&config(), seq);
        for (layer, heads) in patterns.into_iter().enumerate() {
            let stacked = Tensor::stack(&heads, 0).unwrap();
            builder.push(ActivationKey::layer(ActivationKind::Pattern, layer), stacked);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_each_detector_fires_on_its_head() {
        let seq = 8;
        let cache = cache_of(
            [
                [shifted(seq, 0), shifted(seq, -1)],
                [shifted(seq, -100), shifted(seq, 1)],
            ],
            seq,
        );

        assert_eq!(
            detect_heads(&cache, HeadDetector::current_token(), DEFAULT_THRESHOLD).unwrap(),
            vec![HeadId::new(0, 0)]
        );
        assert_eq!(
            detect_heads(&cache, HeadDetector::PreviousToken, DEFAULT_THRESHOLD).unwrap(),
            vec![HeadId::new(0, 1)]
        );
        // shifted(_, 1) is not causal, so it falls back to position 0
        assert_eq!(
            detect_heads(&cache, HeadDetector::FirstToken, DEFAULT_THRESHOLD).unwrap(),
            vec![HeadId::new(1, 0), HeadId::new(1, 1)]
        );
    }

    #[test]
    fn test_trace_over_head_dim_is_preserved() {
        let seq = 6;
        let cache = cache_of(
            [
                [shifted(seq, 0), shifted(seq, -1)],
                [shifted(seq, -1), shifted(seq, -1)],
            ],
            seq,
        );
        let detector = HeadDetector::CurrentToken {
            normalization: TraceNormalization::TraceOverHeadDim,
        };
        let stats = head_statistics(&cache, detector).unwrap();
        // trace 6 over d_head 2
        assert!((stats.get(0, 0).unwrap() - 3.0).abs() < 1e-6);
        // head 0.1 only has its first row on the diagonal: 1 / 2
        assert!((stats.get(0, 1).unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(
            detect_heads(&cache, detector, DEFAULT_THRESHOLD).unwrap(),
            vec![HeadId::new(0, 0), HeadId::new(0, 1), HeadId::new(1, 0), HeadId::new(1, 1)]
        );
    }

    #[test]
    fn test_threshold_is_strict() {
        let seq = 4;
        let cache = cache_of(
            [
                [shifted(seq, 0), shifted(seq, 0)],
                [shifted(seq, 0), shifted(seq, 0)],
            ],
            seq,
        );
        assert!(detect_heads(&cache, HeadDetector::current_token(), 1.0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_induction_offset_longer_than_sequence() {
        let seq = 4;
        let cache = cache_of(
            [
                [shifted(seq, 0), shifted(seq, 0)],
                [shifted(seq, 0), shifted(seq, 0)],
            ],
            seq,
        );
        let err = detect_heads(&cache, HeadDetector::Induction { repeat_len: 5 }, 0.3)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::CircuitError>(),
            Some(crate::error::CircuitError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_detectors_are_deterministic() {
        let model_config = ModelConfig {
            d_vocab: 12,
            init_range: 0.5,
            ..config()
        };
        let model = crate::forward_attn_only::AttnOnlyTransformer::random(model_config, 4, &Device::Cpu)
            .unwrap();
        let tokens = [0u32, 7, 3, 9, 7, 3, 9];
        let (_, first) = model.run_with_cache(&tokens).unwrap();
        let (_, second) = model.run_with_cache(&tokens).unwrap();

        for detector in [
            HeadDetector::current_token(),
            HeadDetector::PreviousToken,
            HeadDetector::FirstToken,
            HeadDetector::Induction { repeat_len: 3 },
        ] {
            assert_eq!(
                head_statistics(&first, detector).unwrap(),
                head_statistics(&second, detector).unwrap()
            );
            for threshold in [0.0, 0.1, DEFAULT_THRESHOLD] {
                let heads = detect_heads(&first, detector, threshold).unwrap();
                assert_eq!(heads, detect_heads(&second, detector, threshold).unwrap());
                assert!(heads.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    #[test]
    fn test_normalization_parse() {
        assert_eq!(
            "trace-over-head-dim".parse::<TraceNormalization>().unwrap(),
            TraceNormalization::TraceOverHeadDim
        );
        assert!("trace".parse::<TraceNormalization>().is_err());
    }
}
