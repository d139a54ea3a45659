//! Training and adaptive-inference orchestration over a set of experts and
//! a transition gate.
//!
//! Both passes are generic over [`ExpertSet`] and [`TransitionGate`] so the
//! control logic can be driven by the native network or by any other
//! implementation with the same data contract.
//!
//! # Training pass
//!
//! Every sample visits every expert in order. After expert `i` the running
//! score is checked against the target and, except after the last expert,
//! the gate is asked whether expert `i + 1` would help. Gate labels are then
//! derived from the correctness matrix (see [`crate::labels`]).
//!
//! # Adaptive pass
//!
//! ```text
//! expert 0 (all rows) ─► gate(0) ─► expert 1 (rows still active) ─► gate(1) ─► …
//!                          │                                          │
//!                          └─ rows with σ(logit) ≤ 0.5 leave ─────────┘
//! ```
//!
//! A row that leaves never re-enters. The loop stops as soon as no row is
//! active.

use ndarray::{Array1, Array2, Array4, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ModelError, ModelResult};
use crate::expert::ExpertOutput;
use crate::labels::{bce_with_logits, continue_decisions, gate_labels, LabelStats};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// An ordered collection of experts sharing one input feature map.
pub trait ExpertSet {
    /// Number of experts.
    fn num_experts(&self) -> usize;

    /// Number of classes every expert scores.
    fn num_classes(&self) -> usize;

    /// Run expert `index` on `shared`, which holds only the rows that should
    /// be evaluated. Scores must already include the expert scale.
    fn run_expert(&self, index: usize, shared: &Array4<f32>) -> ModelResult<ExpertOutput>;
}

/// Predicts, per row, whether evaluating the next expert is worthwhile.
pub trait TransitionGate {
    /// Raw logits for `transition`, one per row of `features`.
    ///
    /// `features` is the feature map of expert `transition` and
    /// `running_mean` the ensemble score over experts `0..=transition`
    /// divided by `transition + 1`, both restricted to the same rows.
    fn gate_logits(
        &self,
        transition: usize,
        features: &Array4<f32>,
        running_mean: &Array2<f32>,
    ) -> ModelResult<Array1<f32>>;
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Inputs the gate saw at one transition of a training pass.
#[derive(Debug, Clone)]
pub struct GateInput {
    /// Feature map of the expert that ended the transition.
    pub features: Array4<f32>,
    /// Running ensemble score divided by the experts evaluated so far.
    pub running_mean: Array2<f32>,
}

/// Result of a training pass.
#[derive(Debug, Clone)]
pub struct TrainingPass {
    /// Mean score over all experts, `[B, classes]`.
    pub scores: Array2<f32>,
    /// Weighted gate BCE averaged over the transitions.
    pub gate_loss: f32,
    /// Gate logits, `[B, N-1]`.
    pub gate_logits: Array2<f32>,
    /// Derived gate targets, `[B, N-1]`.
    pub gate_labels: Array2<bool>,
    /// Correctness of the running ensemble after each expert, `[B, N]`.
    pub correctness: Array2<bool>,
    /// What the gate consumed at each transition.
    pub gate_inputs: Vec<GateInput>,
    /// Help and prediction rates per transition.
    pub diagnostics: LabelStats,
}

/// One gating step of an adaptive pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Transition index (`0` decides whether expert `1` runs).
    pub transition: usize,
    /// Rows the gate was asked to decide; `0` when the gate was skipped.
    pub gated: usize,
    /// Rows that went on to the next expert.
    pub continued: usize,
}

/// Bookkeeping of one adaptive pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTrace {
    /// Rows evaluated by each expert, indexed by expert.
    pub rows_per_expert: Vec<usize>,
    /// One record per gating step that ran.
    pub transitions: Vec<TransitionRecord>,
    /// `true` when the loop stopped because no row remained active.
    pub terminated_early: bool,
}

/// Result of an adaptive pass.
#[derive(Debug, Clone)]
pub struct AdaptivePass {
    /// Per-sample running score divided by that sample's expert count.
    pub scores: Array2<f32>,
    /// Experts evaluated for each sample, in `[1, N]`.
    pub expert_counts: Array1<usize>,
    /// Routing bookkeeping.
    pub trace: RoutingTrace,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Index of the largest value; the first one wins ties.
pub fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

fn check_expert_output(
    out: &ExpertOutput,
    rows: usize,
    num_classes: usize,
) -> ModelResult<()> {
    if out.scores.dim() != (rows, num_classes) {
        let (r, c) = out.scores.dim();
        return Err(ModelError::shape_mismatch(vec![rows, num_classes], vec![r, c]));
    }
    if out.features.dim().0 != rows {
        return Err(ModelError::shape_mismatch(vec![rows], vec![out.features.dim().0]));
    }
    Ok(())
}

fn check_logits(logits: &Array1<f32>, rows: usize) -> ModelResult<()> {
    if logits.len() != rows {
        return Err(ModelError::shape_mismatch(vec![rows], vec![logits.len()]));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Training pass
// ---------------------------------------------------------------------------

/// Run every expert on every sample and compute the gate loss.
///
/// # Errors
///
/// - [`ModelError::TooFewExperts`] with fewer than two experts.
/// - [`ModelError::BatchMismatch`] / [`ModelError::TargetOutOfRange`] for bad
///   targets.
/// - [`ModelError::ShapeMismatch`] when an expert or the gate returns a
///   tensor of the wrong shape.
pub fn train_pass<E, G>(
    experts: &E,
    gate: &G,
    shared: &Array4<f32>,
    targets: &[usize],
    pos_weight: f32,
) -> ModelResult<TrainingPass>
where
    E: ExpertSet + ?Sized,
    G: TransitionGate + ?Sized,
{
    let num_experts = experts.num_experts();
    let num_classes = experts.num_classes();
    let batch = shared.dim().0;
    if num_experts < 2 {
        return Err(ModelError::TooFewExperts { num_experts });
    }
    if targets.len() != batch {
        return Err(ModelError::BatchMismatch { expected: batch, actual: targets.len() });
    }
    if let Some(index) = targets.iter().position(|&t| t >= num_classes) {
        return Err(ModelError::TargetOutOfRange { index, target: targets[index], num_classes });
    }

    let mut running = Array2::<f32>::zeros((batch, num_classes));
    let mut correctness = Array2::from_elem((batch, num_experts), false);
    let mut gate_logits = Array2::<f32>::zeros((batch, num_experts - 1));
    let mut gate_inputs = Vec::with_capacity(num_experts - 1);

    for i in 0..num_experts {
        let out = experts.run_expert(i, shared)?;
        check_expert_output(&out, batch, num_classes)?;
        running += &out.scores;

        for (b, row) in running.outer_iter().enumerate() {
            correctness[[b, i]] = argmax(row) == targets[b];
        }

        if i + 1 < num_experts {
            let running_mean = &running / (i + 1) as f32;
            let logits = gate.gate_logits(i, &out.features, &running_mean)?;
            check_logits(&logits, batch)?;
            gate_logits.column_mut(i).assign(&logits);
            gate_inputs.push(GateInput { features: out.features, running_mean });
        }
    }

    let labels = gate_labels(correctness.view())?;
    let mut loss = 0.0;
    for (logit_col, label_col) in gate_logits.axis_iter(Axis(1)).zip(labels.axis_iter(Axis(1))) {
        loss += bce_with_logits(logit_col, label_col, pos_weight)?;
    }
    let transitions = (num_experts - 1) as f32;

    let stats = LabelStats::from_pass(labels.view(), gate_logits.view())?;
    for (i, (help, pred)) in stats.help_rate.iter().zip(&stats.predicted_rate).enumerate() {
        debug!(transition = i, help_rate = help, predicted_rate = pred, "gate supervision");
    }

    Ok(TrainingPass {
        scores: running / num_experts as f32,
        gate_loss: loss / transitions,
        gate_logits,
        gate_labels: labels,
        correctness,
        gate_inputs,
        diagnostics: stats,
    })
}

// ---------------------------------------------------------------------------
// Adaptive pass
// ---------------------------------------------------------------------------

/// Evaluate experts per sample until the gate says stop.
///
/// With `force_all` the gate is not consulted and every sample receives
/// every expert.
pub fn adaptive_pass<E, G>(
    experts: &E,
    gate: &G,
    shared: &Array4<f32>,
    force_all: bool,
) -> ModelResult<AdaptivePass>
where
    E: ExpertSet + ?Sized,
    G: TransitionGate + ?Sized,
{
    let num_experts = experts.num_experts();
    let num_classes = experts.num_classes();
    let batch = shared.dim().0;
    if num_experts == 0 {
        return Err(ModelError::TooFewExperts { num_experts });
    }

    let first = experts.run_expert(0, shared)?;
    check_expert_output(&first, batch, num_classes)?;
    let mut running = first.scores;
    let mut features = first.features;
    let mut counts = Array1::<usize>::ones(batch);
    let mut active = vec![true; batch];
    let mut trace = RoutingTrace {
        rows_per_expert: vec![0; num_experts],
        ..Default::default()
    };
    trace.rows_per_expert[0] = batch;

    for i in 1..num_experts {
        // Rows of `features` line up with the active rows in ascending order.
        let rows: Vec<usize> = (0..batch).filter(|&b| active[b]).collect();

        if !force_all {
            let running_mean = running.select(Axis(0), &rows) / i as f32;
            let logits = gate.gate_logits(i - 1, &features, &running_mean)?;
            check_logits(&logits, rows.len())?;
            let decisions = continue_decisions(logits.view());
            for (&row, &keep) in rows.iter().zip(decisions.iter()) {
                active[row] = keep;
            }
        }

        let next: Vec<usize> = rows.iter().copied().filter(|&b| active[b]).collect();
        trace.transitions.push(TransitionRecord {
            transition: i - 1,
            gated: if force_all { 0 } else { rows.len() },
            continued: next.len(),
        });
        debug!(
            transition = i - 1,
            active_fraction = next.len() as f32 / batch.max(1) as f32,
            "ensemble routing"
        );

        if next.is_empty() {
            trace.terminated_early = true;
            break;
        }

        let out = experts.run_expert(i, &shared.select(Axis(0), &next))?;
        check_expert_output(&out, next.len(), num_classes)?;
        for (k, &row) in next.iter().enumerate() {
            let mut acc = running.row_mut(row);
            acc += &out.scores.row(k);
            counts[row] += 1;
        }
        trace.rows_per_expert[i] = next.len();
        features = out.features;
    }

    let mut scores = running;
    for (mut row, &count) in scores.outer_iter_mut().zip(counts.iter()) {
        row /= count as f32;
    }

    Ok(AdaptivePass { scores, expert_counts: counts, trace })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    struct Constant {
        scores: Vec<Array2<f32>>,
    }

    impl ExpertSet for Constant {
        fn num_experts(&self) -> usize {
            self.scores.len()
        }

        fn num_classes(&self) -> usize {
            self.scores[0].ncols()
        }

        fn run_expert(&self, index: usize, shared: &Array4<f32>) -> ModelResult<ExpertOutput> {
            // Row identity travels in the first feature value.
            let rows: Vec<usize> = shared.outer_iter().map(|s| s[[0, 0, 0]] as usize).collect();
            Ok(ExpertOutput {
                features: shared.clone(),
                scores: self.scores[index].select(Axis(0), &rows),
            })
        }
    }

    struct Always(f32);

    impl TransitionGate for Always {
        fn gate_logits(
            &self,
            _transition: usize,
            features: &Array4<f32>,
            _running_mean: &Array2<f32>,
        ) -> ModelResult<Array1<f32>> {
            Ok(Array1::from_elem(features.dim().0, self.0))
        }
    }

    fn ids(batch: usize) -> Array4<f32> {
        Array4::from_shape_fn((batch, 1, 1, 1), |(b, _, _, _)| b as f32)
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        assert_eq!(argmax(array![1.0_f32, 3.0, 3.0].view()), 1);
        assert_eq!(argmax(array![2.0_f32].view()), 0);
    }

    #[test]
    fn training_averages_all_experts() {
        let experts = Constant {
            scores: vec![array![[1.0, 0.0]], array![[0.0, 2.0]], array![[3.0, 1.0]]],
        };
        let out = train_pass(&experts, &Always(0.0), &ids(1), &[0], 20.0).unwrap();
        assert_eq!(out.scores, array![[4.0 / 3.0, 1.0]]);
        assert_eq!(out.correctness, array![[true, false, true]]);
        // Right, wrong, right again: continuing past expert 1 helps.
        assert_eq!(out.gate_labels, array![[false, true]]);
    }

    #[test]
    fn gate_loss_averages_transitions() {
        let experts = Constant { scores: vec![array![[0.0, 1.0]], array![[2.0, 0.0]]] };
        let out = train_pass(&experts, &Always(0.0), &ids(1), &[0], 4.0).unwrap();
        // Wrong after expert 0, right after expert 1: positive label, logit 0.
        assert_eq!(out.gate_labels, array![[true]]);
        assert!((out.gate_loss - 4.0 * std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn adaptive_stops_when_gate_closes() {
        let experts = Constant {
            scores: vec![array![[1.0], [2.0]], array![[10.0], [20.0]]],
        };
        let out = adaptive_pass(&experts, &Always(-1.0), &ids(2), false).unwrap();
        assert_eq!(out.expert_counts, array![1, 1]);
        assert_eq!(out.scores, array![[1.0], [2.0]]);
        assert!(out.trace.terminated_early);
        assert_eq!(out.trace.rows_per_expert, vec![2, 0]);
    }

    #[test]
    fn force_all_ignores_gate() {
        let experts = Constant {
            scores: vec![array![[1.0], [2.0]], array![[3.0], [4.0]]],
        };
        let out = adaptive_pass(&experts, &Always(-5.0), &ids(2), true).unwrap();
        assert_eq!(out.expert_counts, array![2, 2]);
        assert_eq!(out.scores, array![[2.0], [3.0]]);
        assert_eq!(
            out.trace.transitions,
            vec![TransitionRecord { transition: 0, gated: 0, continued: 2 }]
        );
    }
}
