//! Transition gate.
//!
//! For transition `t` the gate looks at the feature map of expert `t` and
//! the running ensemble score, and predicts whether evaluating expert
//! `t + 1` would turn a wrong prediction into a right one:
//!
//! ```text
//! features [B, C, h, w] ─ avg pool ─ L2 ─► p [B, C] ─ hidden[t] ─ ReLU ─► h [B, H]
//! running_mean [B, K] ─ top-k (descending) ───────────────────────────► s [B, k]
//!                                      concat [s, h] ─ output[t] ─► logit [B]
//! ```
//!
//! Hidden and output layers are either shared by all transitions or
//! allocated per transition ([`GateSharing`]).

use ndarray::{concatenate, s, Array1, Array2, Array4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::GateSharing;
use crate::ensemble::TransitionGate;
use crate::error::{ModelError, ModelResult};
use crate::layers::{global_avg_pool, l2_normalize_rows, Linear, LinearGrad};

/// Largest `k` values of every row, in descending order.
pub fn top_k(scores: &Array2<f32>, k: usize) -> ModelResult<Array2<f32>> {
    if k == 0 || k > scores.ncols() {
        return Err(ModelError::shape_mismatch(
            vec![scores.nrows(), k],
            vec![scores.nrows(), scores.ncols()],
        ));
    }
    let mut out = Array2::zeros((scores.nrows(), k));
    for (row, mut dst) in scores.outer_iter().zip(out.outer_iter_mut()) {
        let mut sorted = row.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        for (d, v) in dst.iter_mut().zip(sorted) {
            *d = v;
        }
    }
    Ok(out)
}

/// Gradients for every layer of a [`GateNetwork`].
#[derive(Debug, Clone, PartialEq)]
pub struct GateGradients {
    /// One entry per hidden layer.
    pub hidden: Vec<LinearGrad>,
    /// One entry per output layer.
    pub output: Vec<LinearGrad>,
}

impl GateGradients {
    /// Element-wise accumulate `other` into `self`.
    pub fn accumulate(&mut self, other: &GateGradients) -> ModelResult<()> {
        if self.hidden.len() != other.hidden.len() || self.output.len() != other.output.len() {
            return Err(ModelError::shape_mismatch(
                vec![self.hidden.len(), self.output.len()],
                vec![other.hidden.len(), other.output.len()],
            ));
        }
        for (a, b) in self.hidden.iter_mut().zip(&other.hidden) {
            a.accumulate(b);
        }
        for (a, b) in self.output.iter_mut().zip(&other.output) {
            a.accumulate(b);
        }
        Ok(())
    }
}

/// Intermediate values of one forward pass, kept for the backward pass.
struct GateActivations {
    summary: Array2<f32>,
    pre_hidden: Array2<f32>,
    joined: Array2<f32>,
}

/// Small MLP predicting the value of evaluating the next expert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateNetwork {
    hidden: Vec<Linear>,
    output: Vec<Linear>,
    hidden_sharing: GateSharing,
    output_sharing: GateSharing,
    top_k: usize,
    num_transitions: usize,
}

impl GateNetwork {
    /// Build a gate for `num_transitions` transitions over expert feature
    /// maps with `feature_dim` channels.
    pub fn new<R: Rng>(
        rng: &mut R,
        feature_dim: usize,
        num_transitions: usize,
        hidden_dim: usize,
        top_k: usize,
        hidden_sharing: GateSharing,
        output_sharing: GateSharing,
    ) -> Self {
        let hidden = (0..hidden_sharing.layer_count(num_transitions))
            .map(|_| Linear::new(rng, feature_dim, hidden_dim))
            .collect();
        let output = (0..output_sharing.layer_count(num_transitions))
            .map(|_| Linear::new(rng, top_k + hidden_dim, 1))
            .collect();
        GateNetwork { hidden, output, hidden_sharing, output_sharing, top_k, num_transitions }
    }

    /// Number of transitions this gate serves.
    pub fn num_transitions(&self) -> usize {
        self.num_transitions
    }

    /// Number of top scores fed to the output layer.
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Number of learned values.
    pub fn num_parameters(&self) -> usize {
        self.hidden.iter().chain(&self.output).map(Linear::num_parameters).sum()
    }

    /// Check layer counts and widths against the sharing policy and `top_k`.
    pub fn validate(&self) -> ModelResult<()> {
        let expected = (
            self.hidden_sharing.layer_count(self.num_transitions),
            self.output_sharing.layer_count(self.num_transitions),
        );
        if (self.hidden.len(), self.output.len()) != expected {
            return Err(ModelError::shape_mismatch(
                vec![expected.0, expected.1],
                vec![self.hidden.len(), self.output.len()],
            ));
        }
        let hidden_dim = self.hidden.first().map(Linear::out_features).unwrap_or(0);
        for layer in &self.hidden {
            layer.validate()?;
            if layer.out_features() != hidden_dim {
                return Err(ModelError::shape_mismatch(
                    vec![hidden_dim],
                    vec![layer.out_features()],
                ));
            }
        }
        for layer in &self.output {
            layer.validate()?;
            let shape = (layer.out_features(), layer.in_features());
            if shape != (1, self.top_k + hidden_dim) {
                return Err(ModelError::shape_mismatch(
                    vec![1, self.top_k + hidden_dim],
                    vec![shape.0, shape.1],
                ));
            }
        }
        Ok(())
    }

    /// Pooled, L2-normalised summary of a feature map: `[B, C]`.
    pub fn summarize(features: &Array4<f32>) -> Array2<f32> {
        l2_normalize_rows(&global_avg_pool(features))
    }

    fn layers(&self, transition: usize) -> ModelResult<(&Linear, &Linear)> {
        if transition >= self.num_transitions {
            return Err(ModelError::TransitionOutOfRange {
                transition,
                num_transitions: self.num_transitions,
            });
        }
        let hidden = self.hidden.get(self.hidden_sharing.layer_index(transition));
        let output = self.output.get(self.output_sharing.layer_index(transition));
        hidden.zip(output).ok_or_else(|| {
            ModelError::tensor_op(format!("gate has no layers for transition {transition}"))
        })
    }

    fn activations(
        &self,
        transition: usize,
        features: &Array4<f32>,
        running_mean: &Array2<f32>,
    ) -> ModelResult<(GateActivations, Array1<f32>)> {
        let (hidden, output) = self.layers(transition)?;
        if features.dim().0 != running_mean.nrows() {
            return Err(ModelError::BatchMismatch {
                expected: features.dim().0,
                actual: running_mean.nrows(),
            });
        }
        let summary = Self::summarize(features);
        let pre_hidden = hidden.forward(&summary)?;
        let hidden_out = pre_hidden.mapv(|v| v.max(0.0));
        let top = top_k(running_mean, self.top_k)?;
        let joined = concatenate(Axis(1), &[top.view(), hidden_out.view()])?;
        let logits = output.forward(&joined)?.column(0).to_owned();
        Ok((GateActivations { summary, pre_hidden, joined }, logits))
    }

    /// Raw logits for `transition`, one per row.
    ///
    /// # Errors
    ///
    /// [`ModelError::TransitionOutOfRange`], [`ModelError::BatchMismatch`]
    /// when the two inputs disagree on rows, or [`ModelError::ShapeMismatch`]
    /// on a wrong channel count.
    pub fn predict(
        &self,
        transition: usize,
        features: &Array4<f32>,
        running_mean: &Array2<f32>,
    ) -> ModelResult<Array1<f32>> {
        Ok(self.activations(transition, features, running_mean)?.1)
    }

    /// Zero gradients shaped like this gate.
    pub fn zero_gradients(&self) -> GateGradients {
        GateGradients {
            hidden: self.hidden.iter().map(Linear::zero_grad).collect(),
            output: self.output.iter().map(Linear::zero_grad).collect(),
        }
    }

    /// Accumulate into `grads` the parameter gradients of one transition,
    /// given `∂L/∂logit` for each row.
    pub fn backward(
        &self,
        transition: usize,
        features: &Array4<f32>,
        running_mean: &Array2<f32>,
        dlogits: &Array1<f32>,
        grads: &mut GateGradients,
    ) -> ModelResult<()> {
        let (acts, logits) = self.activations(transition, features, running_mean)?;
        if dlogits.len() != logits.len() {
            return Err(ModelError::shape_mismatch(vec![logits.len()], vec![dlogits.len()]));
        }
        let (_, output) = self.layers(transition)?;
        let dl = dlogits.view().insert_axis(Axis(1));

        let out_grad = LinearGrad { weight: dl.t().dot(&acts.joined), bias: dl.sum_axis(Axis(0)) };

        // Top-k scores are inputs, only the hidden half carries gradient.
        let dhidden = dl.dot(output.weight()).slice(s![.., self.top_k..]).to_owned();
        let dpre = dhidden * acts.pre_hidden.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let hidden_grad = LinearGrad {
            weight: dpre.t().dot(&acts.summary),
            bias: dpre.sum_axis(Axis(0)),
        };

        let h = self.hidden_sharing.layer_index(transition);
        let o = self.output_sharing.layer_index(transition);
        match (grads.hidden.get_mut(h), grads.output.get_mut(o)) {
            (Some(gh), Some(go))
                if gh.weight.dim() == hidden_grad.weight.dim()
                    && go.weight.dim() == out_grad.weight.dim() =>
            {
                gh.accumulate(&hidden_grad);
                go.accumulate(&out_grad);
                Ok(())
            }
            _ => Err(ModelError::shape_mismatch(
                vec![self.hidden.len(), self.output.len()],
                vec![grads.hidden.len(), grads.output.len()],
            )),
        }
    }

    /// Plain gradient step on every layer.
    pub fn apply_gradients(&mut self, grads: &GateGradients, lr: f32) -> ModelResult<()> {
        if grads.hidden.len() != self.hidden.len() || grads.output.len() != self.output.len() {
            return Err(ModelError::shape_mismatch(
                vec![self.hidden.len(), self.output.len()],
                vec![grads.hidden.len(), grads.output.len()],
            ));
        }
        for (layer, g) in self.hidden.iter_mut().zip(&grads.hidden) {
            layer.step(g, lr)?;
        }
        for (layer, g) in self.output.iter_mut().zip(&grads.output) {
            layer.step(g, lr)?;
        }
        Ok(())
    }
}

impl TransitionGate for GateNetwork {
    fn gate_logits(
        &self,
        transition: usize,
        features: &Array4<f32>,
        running_mean: &Array2<f32>,
    ) -> ModelResult<Array1<f32>> {
        self.predict(transition, features, running_mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gate(hidden: GateSharing, output: GateSharing) -> GateNetwork {
        let mut rng = StdRng::seed_from_u64(5);
        GateNetwork::new(&mut rng, 4, 2, 3, 2, hidden, output)
    }

    fn inputs() -> (Array4<f32>, Array2<f32>) {
        let features = Array4::from_shape_fn((3, 4, 2, 2), |(b, c, h, w)| {
            ((b * 7 + c * 3 + h + w) % 5) as f32 - 1.5
        });
        let running = array![[0.1, 0.7, -0.2], [1.0, 0.0, 0.5], [-0.3, -0.1, 0.2]];
        (features, running)
    }

    #[test]
    fn top_k_sorts_descending() {
        let scores = array![[0.1, 0.9, 0.5], [3.0, -1.0, 3.0]];
        assert_eq!(top_k(&scores, 2).unwrap(), array![[0.9, 0.5], [3.0, 3.0]]);
        assert!(top_k(&scores, 4).is_err());
    }

    #[test]
    fn layer_counts_follow_sharing() {
        let g = gate(GateSharing::PerTransition, GateSharing::Shared);
        assert_eq!((g.hidden.len(), g.output.len()), (2, 1));
        // hidden: 2 × (4·3 + 3), output: (2 + 3) + 1
        assert_eq!(g.num_parameters(), 2 * 15 + 6);
    }

    #[test]
    fn predict_one_logit_per_row() {
        let g = gate(GateSharing::Shared, GateSharing::PerTransition);
        let (features, running) = inputs();
        assert_eq!(g.predict(1, &features, &running).unwrap().len(), 3);
        assert!(matches!(
            g.predict(2, &features, &running),
            Err(ModelError::TransitionOutOfRange { transition: 2, num_transitions: 2 })
        ));
    }

    #[test]
    fn summary_rows_have_unit_norm() {
        let (features, _) = inputs();
        let summary = GateNetwork::summarize(&features);
        for row in summary.outer_iter() {
            assert_abs_diff_eq!(row.dot(&row), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn output_bias_gradient_matches_finite_difference() {
        let g = gate(GateSharing::PerTransition, GateSharing::PerTransition);
        let (features, running) = inputs();
        // L = Σ logits, so ∂L/∂logit = 1 for every row.
        let ones = Array1::ones(3);
        let mut grads = g.zero_gradients();
        g.backward(0, &features, &running, &ones, &mut grads).unwrap();

        let eps = 1e-2;
        let mut bumped = g.clone();
        let mut delta = g.zero_gradients();
        delta.output[0].bias[0] = -1.0;
        bumped.apply_gradients(&delta, eps).unwrap();
        let before = g.predict(0, &features, &running).unwrap().sum();
        let after = bumped.predict(0, &features, &running).unwrap().sum();
        assert_abs_diff_eq!((after - before) / eps, grads.output[0].bias[0], epsilon = 1e-2);
        assert_abs_diff_eq!(grads.output[0].bias[0], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn hidden_weight_gradient_matches_finite_difference() {
        let g = gate(GateSharing::Shared, GateSharing::Shared);
        let (features, running) = inputs();
        let ones = Array1::ones(3);
        let mut grads = g.zero_gradients();
        g.backward(1, &features, &running, &ones, &mut grads).unwrap();

        let eps = 1e-3;
        for (r, c) in [(0, 0), (1, 2), (2, 3)] {
            let mut delta = g.zero_gradients();
            delta.hidden[0].weight[[r, c]] = -1.0;
            let mut bumped = g.clone();
            bumped.apply_gradients(&delta, eps).unwrap();
            let numeric = (bumped.predict(1, &features, &running).unwrap().sum()
                - g.predict(1, &features, &running).unwrap().sum())
                / eps;
            assert_abs_diff_eq!(numeric, grads.hidden[0].weight[[r, c]], epsilon = 2e-2);
        }
    }

    #[test]
    fn validate_rejects_mismatched_layers() {
        let g = gate(GateSharing::PerTransition, GateSharing::Shared);
        assert!(g.validate().is_ok());

        let mut missing = g.clone();
        missing.hidden.pop();
        assert!(missing.validate().is_err());

        let mut wide = g.clone();
        wide.top_k = 3;
        assert!(wide.validate().is_err());
    }

    #[test]
    fn per_transition_gradients_touch_only_their_layer() {
        let g = gate(GateSharing::PerTransition, GateSharing::PerTransition);
        let (features, running) = inputs();
        let mut grads = g.zero_gradients();
        g.backward(1, &features, &running, &Array1::ones(3), &mut grads).unwrap();
        let zero = g.zero_gradients();
        assert_eq!(grads.hidden[0], zero.hidden[0]);
        assert_eq!(grads.output[0], zero.output[0]);
        assert_ne!(grads.output[1], zero.output[1]);
    }
}
