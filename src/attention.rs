//! Positional statistics over attention patterns
//!
//! A pattern is one head's `[dest, source]` matrix of attention weights. The
//! helpers here read it once into host memory and compute diagonal, column and
//! row statistics; the detectors build on them.

use anyhow::Result;
use candle_core::{DType, Tensor};

use crate::error::{check_index, CircuitError};

/// One head's attention pattern copied to host memory
#[derive(Debug, Clone)]
pub struct PatternView {
    rows: Vec<Vec<f32>>,
}

impl PatternView {
    /// Read a square `[seq, seq]` pattern tensor
    pub fn from_tensor(pattern: &Tensor) -> Result<Self> {
        let dims = pattern.dims();
        if dims.len() != 2 || dims[0] != dims[1] {
            return Err(CircuitError::shape(
                "attention pattern",
                "[seq, seq]",
                format!("{dims:?}"),
            )
            .into());
        }
        let rows = pattern.to_dtype(DType::F32)?.to_vec2()?;
        Ok(Self { rows })
    }

    pub fn seq_len(&self) -> usize {
        self.rows.len()
    }

    /// Weight from destination `dest` to source `src`
    pub fn weight(&self, dest: usize, src: usize) -> Result<f32> {
        check_index("destination position", dest, self.seq_len())?;
        check_index("source position", src, self.seq_len())?;
        Ok(self.rows[dest][src])
    }

    /// Entries `(i, i + offset)`; negative offsets lie below the main diagonal
    pub fn diagonal(&self, offset: isize) -> Vec<f32> {
        let n = self.seq_len() as isize;
        (0..n)
            .filter_map(|i| {
                let j = i + offset;
                (0..n)
                    .contains(&j)
                    .then(|| self.rows[i as usize][j as usize])
            })
            .collect()
    }

    /// Mean of the diagonal at `offset`; ShapeMismatch if that diagonal is empty
    pub fn diagonal_mean(&self, offset: isize) -> Result<f32> {
        let diag = self.diagonal(offset);
        if diag.is_empty() {
            return Err(CircuitError::shape(
                "diagonal_mean",
                format!("|offset| < seq_len for offset {offset}"),
                format!("seq_len {}", self.seq_len()),
            )
            .into());
        }
        Ok(diag.iter().sum::<f32>() / diag.len() as f32)
    }

    /// Sum of the main diagonal
    pub fn trace(&self) -> f32 {
        self.diagonal(0).iter().sum()
    }

    /// Mean attention paid to source position `col` over all destinations
    pub fn column_mean(&self, col: usize) -> Result<f32> {
        check_index("source position", col, self.seq_len())?;
        let sum: f32 = self.rows.iter().map(|r| r[col]).sum();
        Ok(sum / self.seq_len() as f32)
    }

    /// Largest `|row sum − 1|`
    pub fn max_row_deviation(&self) -> f32 {
        self.rows
            .iter()
            .map(|r| (r.iter().sum::<f32>() - 1.0).abs())
            .fold(0.0, f32::max)
    }

    /// Top-k source positions attended to from `dest`, highest weight first
    pub fn top_attended(&self, dest: usize, k: usize) -> Result<Vec<(usize, f32)>> {
        check_index("destination position", dest, self.seq_len())?;
        let mut indexed: Vec<(usize, f32)> =
            self.rows[dest].iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        indexed.truncate(k);
        Ok(indexed)
    }
}

/// Attention from `dest` to every source, averaged across heads
///
/// `layer_pattern` has shape `[n_heads, seq, seq]`; returns `[seq]`.
pub fn head_averaged_row(layer_pattern: &Tensor, dest: usize) -> Result<Vec<f32>> {
    let (_, seq, _) = layer_pattern.dims3()?;
    check_index("destination position", dest, seq)?;
    let row = layer_pattern
        .to_dtype(DType::F32)?
        .narrow(1, dest, 1)?
        .squeeze(1)?
        .mean(0)?;
    Ok(row.to_vec1()?)
}
