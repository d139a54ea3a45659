//! The complete adaptive ensemble network.
//!
//! [`EnsembleNet`] owns the shared [`Backbone`], the [`ExpertBank`] and the
//! [`GateNetwork`], and exposes the two forward paths:
//!
//! - [`EnsembleNet::forward_train`]: every expert on every sample, gate loss.
//! - [`EnsembleNet::forward_inference`]: per-sample early exit.
//!
//! Only the gate has a native backward pass; see
//! [`EnsembleNet::gate_gradients`] and [`EnsembleNet::apply_gate_gradients`].

use std::path::Path;

use ndarray::{Array2, Array4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backbone::Backbone;
use crate::config::{EnsembleConfig, Trainability};
use crate::ensemble::{adaptive_pass, train_pass, AdaptivePass, ExpertSet, TrainingPass};
use crate::error::{ModelError, ModelResult};
use crate::expert::ExpertBank;
use crate::gate::{GateGradients, GateNetwork};
use crate::labels::bce_with_logits_grad;

/// Result of [`EnsembleNet::forward_train`].
#[derive(Debug, Clone)]
pub struct TrainingOutput {
    /// Mean ensemble score, `[B, classes]`.
    pub scores: Array2<f32>,
    /// Gate loss averaged over transitions.
    pub gate_loss: f32,
    /// Everything the gate backward pass needs.
    pub pass: TrainingPass,
}

/// Result of [`EnsembleNet::forward_inference`].
pub type InferenceOutput = AdaptivePass;

#[derive(Serialize)]
struct CheckpointRef<'a> {
    version: &'a str,
    config: &'a EnsembleConfig,
    backbone: &'a Backbone,
    experts: &'a ExpertBank,
    gate: &'a GateNetwork,
}

#[derive(Deserialize)]
struct Checkpoint {
    config: EnsembleConfig,
    backbone: Backbone,
    experts: ExpertBank,
    gate: GateNetwork,
}

/// Multi-expert ResNet with a learned early-exit gate.
#[derive(Debug, Clone)]
pub struct EnsembleNet {
    config: EnsembleConfig,
    backbone: Backbone,
    experts: ExpertBank,
    gate: GateNetwork,
    trainability: Trainability,
    training: bool,
}

impl EnsembleNet {
    /// Validate `config` and build the network from `config.seed`.
    pub fn new(config: EnsembleConfig) -> ModelResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let backbone = Backbone::new(&mut rng, &config);
        let experts = ExpertBank::new(&mut rng, &config);
        let gate = GateNetwork::new(
            &mut rng,
            config.layer3_width(),
            config.num_transitions(),
            config.gate_hidden_dim,
            config.gate_top_k,
            config.gate_hidden,
            config.gate_output,
        );
        let net = EnsembleNet {
            trainability: config.trainability(),
            config,
            backbone,
            experts,
            gate,
            training: true,
        };
        info!(
            "Built ensemble: {} experts, {} parameters ({} trainable)",
            net.config.num_experts,
            net.num_parameters(),
            net.num_trainable_parameters()
        );
        Ok(net)
    }

    /// The configuration the network was built from.
    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Resolved per-component trainability.
    pub fn trainability(&self) -> Trainability {
        self.trainability
    }

    /// Shared trunk.
    pub fn backbone(&self) -> &Backbone {
        &self.backbone
    }

    /// The experts in evaluation order.
    pub fn experts(&self) -> &ExpertBank {
        &self.experts
    }

    /// Transition gate.
    pub fn gate(&self) -> &GateNetwork {
        &self.gate
    }

    /// Switch between training and inference mode.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// `true` in training mode (the default after construction).
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Per-iteration hook run before a training step.
    ///
    /// Batch normalization always runs on running statistics here, so frozen
    /// layers cannot drift. Returns the number of such frozen layers.
    pub fn prepare_training_iteration(&self) -> ModelResult<usize> {
        if !self.training {
            return Err(ModelError::NotTraining);
        }
        let mut frozen = 0;
        if !self.trainability.backbone {
            frozen += self.backbone.batch_norm_count();
        }
        if !self.trainability.experts {
            frozen += self.experts.batch_norm_count();
        }
        if frozen > 0 {
            warn!("{frozen} frozen batch-norm layers kept in running-statistics mode");
        }
        Ok(frozen)
    }

    /// Training forward pass: all experts, ensemble mean and gate loss.
    ///
    /// # Errors
    ///
    /// [`ModelError::NotTraining`] outside training mode, plus everything
    /// [`train_pass`] reports.
    pub fn forward_train(
        &self,
        images: &Array4<f32>,
        targets: &[usize],
    ) -> ModelResult<TrainingOutput> {
        if !self.training {
            return Err(ModelError::NotTraining);
        }
        let shared = self.backbone.embed(images)?;
        let pass = train_pass(&self.experts, &self.gate, &shared, targets, self.config.pos_weight)?;
        Ok(TrainingOutput { scores: pass.scores.clone(), gate_loss: pass.gate_loss, pass })
    }

    /// Adaptive forward pass with per-sample early exit.
    pub fn forward_inference(&self, images: &Array4<f32>) -> ModelResult<InferenceOutput> {
        let shared = self.backbone.embed(images)?;
        adaptive_pass(&self.experts, &self.gate, &shared, self.config.force_all)
    }

    /// Closed-form gradient of `pass.gate_loss` with respect to the gate.
    pub fn gate_gradients(&self, pass: &TrainingPass) -> ModelResult<GateGradients> {
        let transitions = pass.gate_inputs.len();
        if transitions != self.gate.num_transitions() {
            return Err(ModelError::shape_mismatch(
                vec![self.gate.num_transitions()],
                vec![transitions],
            ));
        }
        let mut grads = self.gate.zero_gradients();
        for (i, input) in pass.gate_inputs.iter().enumerate() {
            let dlogits = bce_with_logits_grad(
                pass.gate_logits.column(i),
                pass.gate_labels.column(i),
                self.config.pos_weight,
            )? / transitions as f32;
            self.gate.backward(i, &input.features, &input.running_mean, &dlogits, &mut grads)?;
        }
        Ok(grads)
    }

    /// Plain gradient step on the gate.
    ///
    /// # Errors
    ///
    /// [`ModelError::FrozenComponent`] when the gate is not trainable.
    pub fn apply_gate_gradients(&mut self, grads: &GateGradients, lr: f32) -> ModelResult<()> {
        if !self.trainability.gate {
            return Err(ModelError::FrozenComponent("gate"));
        }
        self.gate.apply_gradients(grads, lr)
    }

    /// Number of learned values in the whole network.
    pub fn num_parameters(&self) -> usize {
        self.backbone.num_parameters() + self.experts.num_parameters() + self.gate.num_parameters()
    }

    /// Number of learned values in trainable components.
    pub fn num_trainable_parameters(&self) -> usize {
        let t = self.trainability;
        [
            (t.backbone, self.backbone.num_parameters()),
            (t.experts, self.experts.num_parameters()),
            (t.gate, self.gate.num_parameters()),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, n)| n)
        .sum()
    }

    /// Write the configuration and all weights to `path` as JSON.
    pub fn save(&self, path: &Path) -> ModelResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ModelError::checkpoint(format!("cannot create directory: {e}"), parent)
            })?;
        }
        let json = serde_json::to_string(&CheckpointRef {
            version: crate::VERSION,
            config: &self.config,
            backbone: &self.backbone,
            experts: &self.experts,
            gate: &self.gate,
        })?;
        std::fs::write(path, json)
            .map_err(|e| ModelError::checkpoint(format!("write failed: {e}"), path))?;
        info!("Saved checkpoint to {}", path.display());
        Ok(())
    }

    /// Restore a network written by [`EnsembleNet::save`].
    ///
    /// The loaded network starts in training mode.
    pub fn load(path: &Path) -> ModelResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::checkpoint(format!("read failed: {e}"), path))?;
        let ckpt: Checkpoint = serde_json::from_str(&json)?;
        ckpt.config.validate()?;

        let config = ckpt.config;
        if ckpt.experts.num_experts() != config.num_experts {
            return Err(ModelError::checkpoint(
                format!(
                    "checkpoint holds {} experts but its config expects {}",
                    ckpt.experts.num_experts(),
                    config.num_experts
                ),
                path,
            ));
        }
        if ckpt.gate.num_transitions() != config.num_transitions() {
            return Err(ModelError::checkpoint(
                format!(
                    "gate serves {} transitions but the config implies {}",
                    ckpt.gate.num_transitions(),
                    config.num_transitions()
                ),
                path,
            ));
        }
        if ckpt.backbone.in_channels() != config.input_channels {
            return Err(ModelError::checkpoint("backbone input channels disagree with config", path));
        }
        let layers = [
            ("backbone", ckpt.backbone.validate()),
            ("experts", ckpt.experts.validate()),
            ("gate", ckpt.gate.validate()),
        ];
        for (component, check) in layers {
            if let Err(e) = check {
                return Err(ModelError::checkpoint(format!("invalid {component} weights: {e}"), path));
            }
        }

        info!("Loaded checkpoint from {}", path.display());
        Ok(EnsembleNet {
            trainability: config.trainability(),
            config,
            backbone: ckpt.backbone,
            experts: ckpt.experts,
            gate: ckpt.gate,
            training: true,
        })
    }
}

/// Predicted class per row (first maximum wins).
pub fn predictions(scores: &Array2<f32>) -> Vec<usize> {
    scores.axis_iter(Axis(0)).map(crate::ensemble::argmax).collect()
}
