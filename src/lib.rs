// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→isize for diagonal offsets
#![allow(clippy::many_single_char_names)] // a, b, q, k, v standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // ActivationCache in cache.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! circuit-lens: mechanistic analysis of attention-only transformers
//!
//! Finds and verifies induction circuits: classifies heads by their
//! attention patterns, scores them by ablation, splits logits into
//! per-head contributions and analyses weight-space circuits through a
//! low-rank factored matrix.
//!
//! ## Architecture
//!
//! - `factored`: FactoredMatrix, a lazy `A · B` product with cheap composition and spectra
//! - `linalg`: small dense eigen/SVD routines behind the factored spectra
//! - `config`: ModelConfig hyperparameters (TransformerLens field names)
//! - `model`: HookedModel trait, the forward-pass and weight-access contract
//! - `forward_attn_only`: attention-only transformer implementing HookedModel
//! - `cache`: typed, validated ActivationCache and its builder
//! - `hooks`: ActivationHook trait plus caching, ablation and induction-score hooks
//! - `masks`: cached causal masks
//! - `attention`: read-only views over attention patterns
//! - `heads`: HeadId and per-head score tables
//! - `detectors`: current/previous/first-token and induction head detectors
//! - `intervention`: head ablation and next-token loss
//! - `logit_attribution`: direct logit attribution per head
//! - `circuits`: OV/QK/K-composition circuits and score decomposition
//! - `tokens`: repeated random token batches and token corpora
//! - `experiment`: experiment runner producing a serializable report
//! - `error`: CircuitError taxonomy

pub mod attention;
pub mod cache;
pub mod circuits;
pub mod config;
pub mod detectors;
pub mod error;
pub mod experiment;
pub mod factored;
pub mod forward_attn_only;
pub mod heads;
pub mod hooks;
pub mod intervention;
pub mod linalg;
pub mod logit_attribution;
pub mod masks;
pub mod model;
pub mod tokens;

pub use attention::{head_averaged_row, PatternView};
pub use cache::{ActivationCache, ActivationKey, ActivationKind, CacheBuilder};
pub use circuits::{
    component_score_stds, decompose_attn_scores, decompose_k, decompose_q, decompose_qk_input,
    effective_ov_circuit, full_ov_circuit, full_qk_circuit, k_composition_circuit, mask_scores,
    pos_by_pos_pattern, sample_diagonal_block, top_1_accuracy, OvConcatAxis,
};
pub use config::{ModelConfig, PositionalEmbedding};
pub use detectors::{
    detect_heads, head_statistics, induction_scores, HeadDetector, TraceNormalization,
    DEFAULT_THRESHOLD,
};
pub use error::CircuitError;
pub use experiment::{Experiment, ExperimentConfig, ExperimentReport};
pub use factored::FactoredMatrix;
pub use forward_attn_only::{AttnOnlyTransformer, AttnWeights, ModelWeights};
pub use heads::{format_heads, HeadId, HeadScores};
pub use hooks::{apply_hooks, ActivationHook, CachingHook, HeadAblationHook, InductionScoreHook};
pub use intervention::{
    ablate_head, ablation_scores, ablation_scores_for, cross_entropy_loss, kl_divergence,
    token_log_probs, AblationResult, AblationSpec, HeadSpec, LayerSpec,
};
pub use linalg::Eigenvalue;
pub use logit_attribution::{
    logit_attribution, ComponentAttribution, LogitAttribution, DEFAULT_ATTRIBUTION_TOLERANCE,
};
pub use masks::{apply_causal_mask, clear_mask_caches, INSPECTION_MASK_VALUE, MASKED_SCORE};
pub use model::{validate_tokens, HookedModel};
pub use tokens::{generate_repeated_tokens, half_performance, HalfPerformance, TokenCorpus};
