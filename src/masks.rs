//! Causal attention masks
//!
//! Keep-masks are cached by `(seq_len, device_id)` so repeated forward passes
//! over the same sequence length reuse one tensor. The cache holds shallow
//! clones (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use crate::error::CircuitError;

/// Fill value for masked scores inside the forward pass
pub const MASKED_SCORE: f32 = f32::NEG_INFINITY;

/// Finite fill value used when masking scores for inspection
pub const INSPECTION_MASK_VALUE: f32 = -1e6;

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize), Tensor>>>;

/// Keep-masks indexed by (seq_len, device_id)
static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

fn lock_cache() -> MutexGuard<'static, HashMap<(usize, usize), Tensor>> {
    // A poisoned lock only means another thread panicked mid-insert; the map is still usable.
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Create or retrieve the cached causal keep-mask for `seq_len`
///
/// Returns a `u8` tensor of shape `[seq_len, seq_len]` with `1` where the
/// destination (row) may attend to the source (column), i.e. `j <= i`.
///
/// ```text
/// [[1, 0, 0],
///  [1, 1, 0],
///  [1, 1, 1]]
/// ```
pub fn causal_keep_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device));
    if let Some(cached) = lock_cache().get(&cache_key) {
        return Ok(cached.clone());
    }

    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| u8::from(j <= i)))
        .collect();
    let mask = Tensor::from_vec(mask, (seq_len, seq_len), device)?;

    lock_cache().insert(cache_key, mask.clone());
    Ok(mask)
}

/// Replace every score above the diagonal of the last two axes with `fill`
///
/// `scores` has shape `[..., seq, seq]`; leading axes (heads, batch) are
/// broadcast over.
pub fn apply_causal_mask(scores: &Tensor, fill: f32) -> Result<Tensor> {
    let dims = scores.dims();
    let rank = dims.len();
    if rank < 2 || dims[rank - 1] != dims[rank - 2] {
        return Err(CircuitError::shape(
            "apply_causal_mask",
            "[..., seq, seq]",
            format!("{dims:?}"),
        )
        .into());
    }
    let seq_len = dims[rank - 1];
    let keep = causal_keep_mask(seq_len, scores.device())?.broadcast_as(scores.shape())?;
    let fill = Tensor::new(fill, scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(scores.shape())?;
    Ok(keep.where_cond(scores, &fill)?)
}

/// Number of cached keep-masks
pub fn mask_cache_size() -> usize {
    lock_cache().len()
}

/// Drop all cached masks
pub fn clear_mask_caches() {
    lock_cache().clear();
}

/// `true` if every entry above the diagonal of a square `[seq, seq]` tensor is
/// (numerically) zero
pub fn is_lower_triangular(pattern: &Tensor, tol: f32) -> Result<bool> {
    let rows: Vec<Vec<f32>> = pattern.to_dtype(DType::F32)?.to_vec2()?;
    Ok(rows
        .iter()
        .enumerate()
        .all(|(i, row)| row.iter().skip(i + 1).all(|v| v.abs() <= tol)))
}
