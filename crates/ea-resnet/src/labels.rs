//! Gate supervision: "would continuing help" labels and the weighted
//! binary cross-entropy used to train the gate.
//!
//! A sample's label at transition `i` is positive iff the ensemble of
//! experts `0..=i` classifies it wrongly **and** some larger ensemble
//! `0..=j` (`j > i`) classifies it correctly:
//!
//! ```text
//! label[:, i] = !correct[:, i] & (correct[:, i+1] | … | correct[:, N-1])
//! ```
//!
//! Labels depend only on the correctness matrix, never on parameters.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Gate probability above which a sample continues to the next expert.
pub const DECISION_THRESHOLD: f32 = 0.5;

/// Secondary threshold reported by [`LabelStats`].
pub const LOW_DECISION_THRESHOLD: f32 = 0.3;

/// Derive the `[B, N-1]` gate labels from a `[B, N]` correctness matrix.
///
/// # Errors
///
/// [`ModelError::TooFewExperts`] when `N < 2`: no transition exists.
pub fn gate_labels(correctness: ArrayView2<bool>) -> ModelResult<Array2<bool>> {
    let (batch, num_experts) = correctness.dim();
    if num_experts < 2 {
        return Err(ModelError::TooFewExperts { num_experts });
    }
    let mut labels = Array2::from_elem((batch, num_experts - 1), false);
    for (row, mut out) in correctness.outer_iter().zip(labels.outer_iter_mut()) {
        let mut later_correct = false;
        for i in (0..num_experts - 1).rev() {
            later_correct |= row[i + 1];
            out[i] = !row[i] && later_correct;
        }
    }
    Ok(labels)
}

/// Logistic function, stable for large `|x|`.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + eˣ)` without overflow.
fn softplus(x: f32) -> f32 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Binary decision per logit: `sigmoid(x) > 0.5`.
pub fn continue_decisions(logits: ArrayView1<f32>) -> Array1<bool> {
    logits.mapv(|x| sigmoid(x) > DECISION_THRESHOLD)
}

fn check_lengths(logits: &ArrayView1<f32>, labels: &ArrayView1<bool>) -> ModelResult<()> {
    if logits.len() != labels.len() {
        return Err(ModelError::shape_mismatch(vec![logits.len()], vec![labels.len()]));
    }
    Ok(())
}

/// Mean binary cross-entropy with logits and a positive-class weight:
///
/// `mean(pw · y · softplus(-x) + (1 - y) · softplus(x))`
///
/// An empty batch has zero loss.
pub fn bce_with_logits(
    logits: ArrayView1<f32>,
    labels: ArrayView1<bool>,
    pos_weight: f32,
) -> ModelResult<f32> {
    check_lengths(&logits, &labels)?;
    if logits.is_empty() {
        return Ok(0.0);
    }
    let total: f32 = logits
        .iter()
        .zip(labels.iter())
        .map(|(&x, &y)| if y { pos_weight * softplus(-x) } else { softplus(x) })
        .sum();
    Ok(total / logits.len() as f32)
}

/// Gradient of [`bce_with_logits`] with respect to each logit.
pub fn bce_with_logits_grad(
    logits: ArrayView1<f32>,
    labels: ArrayView1<bool>,
    pos_weight: f32,
) -> ModelResult<Array1<f32>> {
    check_lengths(&logits, &labels)?;
    let n = logits.len().max(1) as f32;
    Ok(Array1::from_iter(logits.iter().zip(labels.iter()).map(|(&x, &y)| {
        let p = sigmoid(x);
        (if y { pos_weight * (p - 1.0) } else { p }) / n
    })))
}

/// Per-transition rates describing how often continuing helps and how often
/// the gate asks to continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelStats {
    /// Fraction of positive labels at each transition.
    pub help_rate: Vec<f32>,
    /// Fraction of gate probabilities above 0.5.
    pub predicted_rate: Vec<f32>,
    /// Fraction of gate probabilities above 0.3.
    pub predicted_rate_low: Vec<f32>,
}

impl LabelStats {
    /// Summarise `[B, T]` labels against `[B, T]` gate logits.
    pub fn from_pass(labels: ArrayView2<bool>, logits: ArrayView2<f32>) -> ModelResult<Self> {
        if labels.dim() != logits.dim() {
            let (a, b) = labels.dim();
            let (c, d) = logits.dim();
            return Err(ModelError::shape_mismatch(vec![a, b], vec![c, d]));
        }
        let batch = labels.nrows().max(1) as f32;
        let rate = |count: usize| count as f32 / batch;
        let mut stats = LabelStats {
            help_rate: Vec::with_capacity(labels.ncols()),
            predicted_rate: Vec::with_capacity(labels.ncols()),
            predicted_rate_low: Vec::with_capacity(labels.ncols()),
        };
        for (label_col, logit_col) in labels.axis_iter(Axis(1)).zip(logits.axis_iter(Axis(1))) {
            let probs: Vec<f32> = logit_col.iter().map(|&x| sigmoid(x)).collect();
            stats.help_rate.push(rate(label_col.iter().filter(|&&y| y).count()));
            stats
                .predicted_rate
                .push(rate(probs.iter().filter(|&&p| p > DECISION_THRESHOLD).count()));
            stats
                .predicted_rate_low
                .push(rate(probs.iter().filter(|&&p| p > LOW_DECISION_THRESHOLD).count()));
        }
        Ok(stats)
    }
}
