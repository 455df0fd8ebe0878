//! Head identifiers and per-head score tables

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::check_index;

/// A single attention head, `(layer, head)`, both zero-based.
///
/// Ordering is layer-major, then head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeadId {
    pub layer: usize,
    pub head: usize,
}

impl HeadId {
    pub fn new(layer: usize, head: usize) -> Self {
        Self { layer, head }
    }
}

impl std::fmt::Display for HeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.layer, self.head)
    }
}

impl std::str::FromStr for HeadId {
    type Err = anyhow::Error;

    /// Parse `"L.H"`, e.g. `"1.4"`
    fn from_str(s: &str) -> Result<Self> {
        let (layer, head) = s
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("Expected LAYER.HEAD, got '{s}'"))?;
        Ok(Self {
            layer: layer.trim().parse()?,
            head: head.trim().parse()?,
        })
    }
}

/// Dense `n_layers × n_heads` table of scalar scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadScores {
    n_layers: usize,
    n_heads: usize,
    /// Row-major, `scores[layer * n_heads + head]`
    scores: Vec<f32>,
}

impl HeadScores {
    pub fn zeros(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            scores: vec![0.0; n_layers * n_heads],
        }
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn get(&self, layer: usize, head: usize) -> Result<f32> {
        self.check(layer, head)?;
        Ok(self.scores[layer * self.n_heads + head])
    }

    pub fn set(&mut self, layer: usize, head: usize, value: f32) -> Result<()> {
        self.check(layer, head)?;
        self.scores[layer * self.n_heads + head] = value;
        Ok(())
    }

    pub fn add(&mut self, layer: usize, head: usize, value: f32) -> Result<()> {
        self.check(layer, head)?;
        self.scores[layer * self.n_heads + head] += value;
        Ok(())
    }

    /// One row per layer
    pub fn rows(&self) -> Vec<Vec<f32>> {
        self.scores
            .chunks(self.n_heads.max(1))
            .map(<[f32]>::to_vec)
            .collect()
    }

    /// All `(head, score)` pairs in ascending (layer, head) order
    pub fn iter(&self) -> impl Iterator<Item = (HeadId, f32)> + '_ {
        let n_heads = self.n_heads;
        self.scores
            .iter()
            .enumerate()
            .map(move |(i, &s)| (HeadId::new(i / n_heads, i % n_heads), s))
    }

    /// Heads whose score is strictly greater than `threshold`
    pub fn above(&self, threshold: f32) -> Vec<HeadId> {
        self.iter()
            .filter(|(_, s)| *s > threshold)
            .map(|(h, _)| h)
            .collect()
    }

    /// Head with the highest score (first one on ties)
    pub fn argmax(&self) -> Option<(HeadId, f32)> {
        self.iter().fold(None, |best, (h, s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((h, s)),
        })
    }

    fn check(&self, layer: usize, head: usize) -> Result<()> {
        check_index("layer", layer, self.n_layers)?;
        check_index("head", head, self.n_heads)
    }
}

/// Format a head list the way the analysis printouts do: `"0.7, 1.4"`
pub fn format_heads(heads: &[HeadId]) -> String {
    heads
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_id_order_and_display() {
        let mut heads = vec![HeadId::new(1, 0), HeadId::new(0, 11), HeadId::new(0, 2)];
        heads.sort();
        assert_eq!(format_heads(&heads), "0.2, 0.11, 1.0");
        assert_eq!("1.4".parse::<HeadId>().unwrap(), HeadId::new(1, 4));
        assert!("14".parse::<HeadId>().is_err());
    }

    #[test]
    fn test_scores_above_threshold_is_ordered() {
        let mut scores = HeadScores::zeros(2, 3);
        scores.set(1, 2, 0.9).unwrap();
        scores.set(0, 1, 0.5).unwrap();
        scores.set(1, 0, 0.3).unwrap();
        assert_eq!(scores.above(0.3), vec![HeadId::new(0, 1), HeadId::new(1, 2)]);
        assert_eq!(scores.argmax(), Some((HeadId::new(1, 2), 0.9)));
    }

    #[test]
    fn test_scores_bounds() {
        let mut scores = HeadScores::zeros(2, 3);
        assert!(scores.get(2, 0).is_err());
        assert!(scores.add(0, 3, 1.0).is_err());
        assert_eq!(scores.rows().len(), 2);
    }
}
