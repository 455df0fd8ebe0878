//! Experiment runner for the induction-head analysis
//!
//! Runs the detectors on a text sequence, measures in-context learning on
//! repeated random tokens, scores heads by induction pattern and ablation,
//! checks the logit attribution and evaluates OV circuits of chosen heads.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::circuits::{effective_ov_circuit, full_ov_circuit, top_1_accuracy, OvConcatAxis};
use crate::detectors::{detect_heads, induction_scores, HeadDetector, TraceNormalization, DEFAULT_THRESHOLD};
use crate::error::{check_index, CircuitError};
use crate::heads::{HeadId, HeadScores};
use crate::intervention::{ablation_scores, token_log_probs};
use crate::logit_attribution::{ComponentAttribution, LogitAttribution, DEFAULT_ATTRIBUTION_TOLERANCE};
use crate::model::HookedModel;
use crate::tokens::{generate_repeated_tokens, half_performance, HalfPerformance, TokenCorpus};

/// Configuration for one analysis run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Random seed for the repeated-token batch
    pub seed: u64,
    /// Length `S` of the random block that gets repeated
    pub repeat_len: usize,
    /// Number of repeated sequences the induction scores average over
    pub batch: usize,
    /// Detector threshold
    pub threshold: f32,
    /// Heads whose full OV circuit is evaluated
    pub ov_heads: Vec<HeadId>,
    pub normalization: TraceNormalization,
    pub concat_axis: OvConcatAxis,
    /// Rows materialised at once when scanning a `d_vocab²` circuit
    pub chunk_rows: usize,
    /// Text sequence for the detectors; the first repeated sequence when absent
    pub text_tokens: Option<Vec<u32>>,
    pub attribution_tolerance: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            repeat_len: 50,
            batch: 10,
            threshold: DEFAULT_THRESHOLD,
            ov_heads: vec![],
            normalization: TraceNormalization::default(),
            concat_axis: OvConcatAxis::default(),
            chunk_rows: 1024,
            text_tokens: None,
            attribution_tolerance: DEFAULT_ATTRIBUTION_TOLERANCE,
        }
    }
}

impl ExperimentConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read experiment config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse experiment config {}", path.display()))
    }

    /// Use the first sequence of a corpus as the detector text
    pub fn with_corpus(mut self, corpus: &TokenCorpus) -> Self {
        if let Some(first) = corpus.first() {
            self.text_tokens = Some(first.to_vec());
        }
        self
    }
}

/// Top-1 accuracy of one head's full OV circuit
#[derive(Debug, Clone, Serialize)]
pub struct OvAccuracy {
    pub head: HeadId,
    pub top_1_accuracy: f64,
}

/// Outcome of the logit attribution round trip
#[derive(Debug, Clone, Serialize)]
pub struct AttributionCheck {
    pub max_deviation: f64,
    pub tolerance: f64,
    pub passed: bool,
    pub top_components: Vec<ComponentAttribution>,
}

/// Everything one run produces
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub current_token_heads: Vec<HeadId>,
    pub previous_token_heads: Vec<HeadId>,
    pub first_token_heads: Vec<HeadId>,
    pub repeated_performance: HalfPerformance,
    pub induction_heads: Vec<HeadId>,
    pub induction_scores: HeadScores,
    pub ablation_scores: HeadScores,
    pub attribution: AttributionCheck,
    pub ov_accuracy: Vec<OvAccuracy>,
    /// Top-1 accuracy of the combined OV circuit when all `ov_heads` share a layer
    pub effective_ov_accuracy: Option<f64>,
}

/// Main experiment runner
pub struct Experiment<M: HookedModel> {
    config: ExperimentConfig,
    model: M,
}

impl<M: HookedModel> Experiment<M> {
    pub fn new(model: M, config: ExperimentConfig) -> Self {
        Self { config, model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn validate(&self) -> Result<()> {
        let model_config = self.model.config();
        if self.config.repeat_len == 0 || self.config.batch == 0 {
            return Err(CircuitError::InvalidConfig(
                "repeat_len and batch must be positive".to_string(),
            )
            .into());
        }
        if self.config.chunk_rows == 0 {
            return Err(CircuitError::InvalidConfig("chunk_rows must be positive".to_string()).into());
        }
        let repeated_len = 1 + 2 * self.config.repeat_len;
        if repeated_len > model_config.n_ctx {
            return Err(CircuitError::InvalidConfig(format!(
                "repeated sequence of {repeated_len} tokens exceeds n_ctx {}",
                model_config.n_ctx
            ))
            .into());
        }
        for head in &self.config.ov_heads {
            check_index("layer", head.layer, model_config.n_layers)?;
            check_index("head", head.head, model_config.n_heads)?;
        }
        Ok(())
    }

    /// Run the full analysis
    pub fn run(&self) -> Result<ExperimentReport> {
        info!("Starting induction-head experiment");
        info!("Config: {:?}", self.config);
        self.validate()?;
        let model_config = self.model.config();

        let repeated = generate_repeated_tokens(
            model_config.bos_token_id,
            model_config.d_vocab,
            self.config.repeat_len,
            self.config.batch,
            self.config.seed,
        )?;
        let text = self
            .config
            .text_tokens
            .clone()
            .unwrap_or_else(|| repeated[0].clone());

        // Detectors and attribution on the text sequence
        info!("Running detectors on {} text tokens", text.len());
        let (text_logits, text_cache) = self.model.run_with_cache(&text)?;
        let threshold = self.config.threshold;
        let current_token_heads = detect_heads(
            &text_cache,
            HeadDetector::CurrentToken {
                normalization: self.config.normalization,
            },
            threshold,
        )?;
        let previous_token_heads = detect_heads(&text_cache, HeadDetector::PreviousToken, threshold)?;
        let first_token_heads = detect_heads(&text_cache, HeadDetector::FirstToken, threshold)?;
        info!("Current-token heads: {:?}", current_token_heads);
        info!("Previous-token heads: {:?}", previous_token_heads);
        info!("First-token heads: {:?}", first_token_heads);

        let attribution = self.check_attribution(&text_logits, &text_cache, &text)?;

        // In-context learning on repeated random tokens
        let rep_tokens = &repeated[0];
        let (rep_logits, rep_cache) = self.model.run_with_cache(rep_tokens)?;
        let log_probs = token_log_probs(&rep_logits, rep_tokens)?;
        let repeated_performance = half_performance(&log_probs, self.config.repeat_len)?;
        info!(
            "Mean log-prob: first half {:.3}, second half {:.3}",
            repeated_performance.first_half, repeated_performance.second_half
        );

        let induction = HeadDetector::Induction {
            repeat_len: self.config.repeat_len,
        };
        let induction_heads = detect_heads(&rep_cache, induction, threshold)?;
        info!("Induction heads: {:?}", induction_heads);
        let induction_scores = induction_scores(&self.model, &repeated, self.config.repeat_len)?;
        if let Some((head, score)) = induction_scores.argmax() {
            info!("Strongest induction score {:.3} at head {}", score, head);
        }

        info!("Ablating {} heads", model_config.total_heads());
        let ablation_scores = ablation_scores(&self.model, rep_tokens)?;

        let ov_accuracy = self.ov_accuracy()?;
        let effective_ov_accuracy = self.effective_ov_accuracy()?;

        Ok(ExperimentReport {
            current_token_heads,
            previous_token_heads,
            first_token_heads,
            repeated_performance,
            induction_heads,
            induction_scores,
            ablation_scores,
            attribution,
            ov_accuracy,
            effective_ov_accuracy,
        })
    }

    fn check_attribution(
        &self,
        logits: &candle_core::Tensor,
        cache: &crate::cache::ActivationCache,
        tokens: &[u32],
    ) -> Result<AttributionCheck> {
        let tolerance = self.config.attribution_tolerance;
        let attribution = LogitAttribution::from_cache(&self.model, cache, tokens)?;
        let (max_deviation, passed) = match attribution.verify(logits, tolerance) {
            Ok(deviation) => (deviation, true),
            Err(e) => match e.downcast_ref::<CircuitError>() {
                Some(CircuitError::ToleranceViolation { deviation, .. }) => {
                    warn!("Logit attribution off by {:.3e}", deviation);
                    (*deviation, false)
                }
                _ => return Err(e),
            },
        };
        info!("Logit attribution max deviation {:.3e}", max_deviation);
        let mut top_components = attribution.ranked_components()?;
        top_components.truncate(5);
        Ok(AttributionCheck {
            max_deviation,
            tolerance,
            passed,
            top_components,
        })
    }

    fn ov_accuracy(&self) -> Result<Vec<OvAccuracy>> {
        self.config
            .ov_heads
            .iter()
            .map(|&head| {
                let circuit = full_ov_circuit(&self.model, head.layer, head.head)?;
                let accuracy = top_1_accuracy(&circuit, self.config.chunk_rows)?;
                info!("OV circuit {}: top-1 accuracy {:.4}", head, accuracy);
                Ok(OvAccuracy {
                    head,
                    top_1_accuracy: accuracy,
                })
            })
            .collect()
    }

    fn effective_ov_accuracy(&self) -> Result<Option<f64>> {
        let heads = &self.config.ov_heads;
        let Some(first) = heads.first() else {
            return Ok(None);
        };
        if heads.len() < 2 || heads.iter().any(|h| h.layer != first.layer) {
            debug!("Skipping effective OV circuit");
            return Ok(None);
        }
        let indices: Vec<usize> = heads.iter().map(|h| h.head).collect();
        let circuit = match effective_ov_circuit(&self.model, first.layer, &indices, self.config.concat_axis) {
            Ok(circuit) => circuit,
            Err(e) => match e.downcast_ref::<CircuitError>() {
                Some(CircuitError::ShapeMismatch { .. }) => {
                    warn!("Effective OV circuit not composable: {}", e);
                    return Ok(None);
                }
                _ => return Err(e),
            },
        };
        let accuracy = top_1_accuracy(&circuit, self.config.chunk_rows)?;
        info!("Effective OV circuit of layer {}: top-1 accuracy {:.4}", first.layer, accuracy);
        Ok(Some(accuracy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::forward_attn_only::AttnOnlyTransformer;
    use candle_core::{Device, Tensor};

    fn tiny_model() -> AttnOnlyTransformer {
        let config = ModelConfig {
            n_layers: 2,
            n_heads: 2,
            d_model: 16,
            d_head: 8,
            d_vocab: 20,
            n_ctx: 32,
            ..Default::default()
        };
        AttnOnlyTransformer::random(config, 0, &Device::Cpu).unwrap()
    }

    fn tiny_config() -> ExperimentConfig {
        ExperimentConfig {
            repeat_len: 5,
            batch: 2,
            chunk_rows: 7,
            ov_heads: vec![HeadId::new(1, 0), HeadId::new(1, 1)],
            ..Default::default()
        }
    }

    #[test]
    fn test_run_produces_complete_report() {
        let experiment = Experiment::new(tiny_model(), tiny_config());
        let report = experiment.run().unwrap();
        assert_eq!(report.induction_scores.n_layers(), 2);
        assert_eq!(report.ablation_scores.n_heads(), 2);
        assert_eq!(report.ov_accuracy.len(), 2);
        assert!(report.effective_ov_accuracy.is_some());
        assert!(report.attribution.passed);
        assert!(report.attribution.top_components.len() <= 5);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("induction_scores"));
    }

    /// Runs with a real unembedding bias but reports it as zero, so the
    /// attribution's bias column misses it
    struct HiddenBias {
        inner: AttnOnlyTransformer,
        reported_b_u: Tensor,
    }

    impl HookedModel for HiddenBias {
        fn config(&self) -> &ModelConfig {
            self.inner.config()
        }
        fn device(&self) -> &Device {
            self.inner.device()
        }
        fn run_with_hooks(
            &self,
            tokens: &[u32],
            hooks: &mut [&mut dyn crate::hooks::ActivationHook],
        ) -> Result<Tensor> {
            self.inner.run_with_hooks(tokens, hooks)
        }
        fn w_e(&self) -> &Tensor {
            self.inner.w_e()
        }
        fn w_pos(&self) -> &Tensor {
            self.inner.w_pos()
        }
        fn w_u(&self) -> &Tensor {
            self.inner.w_u()
        }
        fn b_u(&self) -> &Tensor {
            &self.reported_b_u
        }
        fn w_q(&self, layer: usize, head: usize) -> Result<Tensor> {
            self.inner.w_q(layer, head)
        }
        fn w_k(&self, layer: usize, head: usize) -> Result<Tensor> {
            self.inner.w_k(layer, head)
        }
        fn w_v(&self, layer: usize, head: usize) -> Result<Tensor> {
            self.inner.w_v(layer, head)
        }
        fn w_o(&self, layer: usize, head: usize) -> Result<Tensor> {
            self.inner.w_o(layer, head)
        }
        fn b_o(&self, layer: usize) -> Result<Tensor> {
            self.inner.b_o(layer)
        }
    }

    #[test]
    fn test_attribution_violation_is_recorded() {
        let model = tiny_model();
        let config = model.config().clone();
        let mut weights = model.weights().clone();
        weights.b_u = (weights.b_u.ones_like().unwrap() * 2.0).unwrap();
        let reported_b_u = weights.b_u.zeros_like().unwrap();
        let inner = AttnOnlyTransformer::from_weights(config, weights).unwrap();

        let experiment = Experiment::new(
            HiddenBias {
                inner,
                reported_b_u,
            },
            tiny_config(),
        );
        let report = experiment.run().unwrap();
        assert!(!report.attribution.passed);
        assert!(report.attribution.max_deviation > 1.0);
        assert_eq!(report.attribution.tolerance, DEFAULT_ATTRIBUTION_TOLERANCE);
    }

    #[test]
    fn test_side_by_side_axis_is_skipped() {
        let config = ExperimentConfig {
            concat_axis: OvConcatAxis::SideBySide,
            ..tiny_config()
        };
        let report = Experiment::new(tiny_model(), config).run().unwrap();
        assert!(report.effective_ov_accuracy.is_none());
    }

    #[test]
    fn test_rejects_sequences_longer_than_context() {
        let config = ExperimentConfig {
            repeat_len: 16,
            ..tiny_config()
        };
        let err = Experiment::new(tiny_model(), config).run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: ExperimentConfig =
            serde_json::from_str(r#"{"repeat_len": 7, "ov_heads": [{"layer": 1, "head": 4}]}"#).unwrap();
        assert_eq!(config.repeat_len, 7);
        assert_eq!(config.batch, 10);
        assert_eq!(config.ov_heads, vec![HeadId::new(1, 4)]);
        assert_eq!(config.threshold, DEFAULT_THRESHOLD);
    }
}
