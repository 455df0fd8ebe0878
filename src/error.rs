//! Error taxonomy for circuit-lens
//!
//! Library functions return `anyhow::Result`; the variants below are what
//! gets wrapped, so callers can recover them with
//! `err.downcast_ref::<CircuitError>()`.

use thiserror::Error;

/// Typed failures raised by the analysis code
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CircuitError {
    /// Incompatible dimensions (factored-matrix construction/composition,
    /// cache snapshot validation, weight loading)
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    /// Layer, head, row/column or token index outside its configured bound
    #[error("{what} index {index} out of range (bound {bound})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        bound: usize,
    },

    /// A numerical correctness check exceeded its tolerance
    #[error("{check}: deviation {deviation:.3e} exceeds tolerance {tolerance:.1e}")]
    ToleranceViolation {
        check: &'static str,
        deviation: f64,
        tolerance: f64,
    },

    /// Requested activation was never captured
    #[error("activation '{0}' not present in cache")]
    MissingActivation(String),

    /// Model configuration is unusable
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
}

impl CircuitError {
    pub(crate) fn shape(
        context: &'static str,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn out_of_range(what: &'static str, index: usize, bound: usize) -> Self {
        Self::IndexOutOfRange { what, index, bound }
    }
}

/// Check `index < bound`, failing with [`CircuitError::IndexOutOfRange`]
pub(crate) fn check_index(what: &'static str, index: usize, bound: usize) -> anyhow::Result<()> {
    if index >= bound {
        return Err(CircuitError::out_of_range(what, index, bound).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_survives_anyhow() {
        let err: anyhow::Error = CircuitError::out_of_range("head", 12, 12).into();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::IndexOutOfRange { index: 12, .. })
        ));
        assert_eq!(err.to_string(), "head index 12 out of range (bound 12)");
    }

    #[test]
    fn test_check_index() {
        assert!(check_index("layer", 1, 2).is_ok());
        assert!(check_index("layer", 2, 2).is_err());
    }
}
