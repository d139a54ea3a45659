//! Expert branches.
//!
//! Each expert continues the shared trunk with its own second and third
//! stage, pools the result and classifies it:
//!
//! ```text
//! shared [B, stem, H, W]
//!   └─ layer2 (stride 2) ─ layer3 (stride 2) ─► features [B, C3, H/4, W/4]
//!                                                  └─ avg pool ─ head ─ × scale ─► scores [B, classes]
//! ```
//!
//! The feature map is returned alongside the scores because the gate for
//! the following transition consumes it.

use ndarray::{Array2, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::block::Stage;
use crate::config::EnsembleConfig;
use crate::ensemble::ExpertSet;
use crate::error::{ModelError, ModelResult};
use crate::layers::{global_avg_pool, Linear, NormedLinear};

/// What one expert produces for the rows it was run on.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertOutput {
    /// Final feature map, `[rows, C, h, w]`.
    pub features: Array4<f32>,
    /// Scaled class scores, `[rows, num_classes]`.
    pub scores: Array2<f32>,
}

/// Classifier on top of the pooled expert features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClassifierHead {
    /// Plain affine classifier.
    Linear(Linear),
    /// Cosine-similarity classifier.
    Normed(NormedLinear),
}

impl ClassifierHead {
    fn forward(&self, x: &Array2<f32>) -> ModelResult<Array2<f32>> {
        match self {
            ClassifierHead::Linear(l) => l.forward(x),
            ClassifierHead::Normed(l) => l.forward(x),
        }
    }

    fn num_parameters(&self) -> usize {
        match self {
            ClassifierHead::Linear(l) => l.num_parameters(),
            ClassifierHead::Normed(l) => l.num_parameters(),
        }
    }
}

/// One expert: two residual stages, pooling and a scaled classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertBranch {
    layer2: Stage,
    layer3: Stage,
    head: ClassifierHead,
    scale: f32,
}

impl ExpertBranch {
    /// Build an expert for `config`.
    pub fn new<R: Rng>(rng: &mut R, config: &EnsembleConfig) -> Self {
        let (w1, w2, w3) = (config.stem_channels, config.layer2_width(), config.layer3_width());
        let layer2 = Stage::new(rng, w1, w2, config.num_blocks[1], 2, config.shortcut);
        let layer3 = Stage::new(rng, w2, w3, config.num_blocks[2], 2, config.shortcut);
        let head = if config.use_norm {
            ClassifierHead::Normed(NormedLinear::new(rng, w3, config.num_classes))
        } else {
            ClassifierHead::Linear(Linear::new(rng, w3, config.num_classes))
        };
        ExpertBranch { layer2, layer3, head, scale: config.effective_scale() }
    }

    /// Score multiplier applied to the classifier output.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Run the expert on (a subset of rows of) the shared feature map.
    pub fn run(&self, shared: &Array4<f32>) -> ModelResult<ExpertOutput> {
        let features = self.layer3.forward(&self.layer2.forward(shared)?)?;
        let pooled = global_avg_pool(&features);
        let scores = self.head.forward(&pooled)? * self.scale;
        Ok(ExpertOutput { features, scores })
    }

    /// Check stages and head for internal consistency.
    pub fn validate(&self) -> ModelResult<()> {
        self.layer2.validate()?;
        self.layer3.validate()?;
        match &self.head {
            ClassifierHead::Linear(l) => l.validate(),
            ClassifierHead::Normed(_) => Ok(()),
        }
    }

    /// Number of learned values.
    pub fn num_parameters(&self) -> usize {
        self.layer2.num_parameters() + self.layer3.num_parameters() + self.head.num_parameters()
    }

    /// Number of batch-normalization layers.
    pub fn batch_norm_count(&self) -> usize {
        self.layer2.batch_norm_count() + self.layer3.batch_norm_count()
    }
}

/// The ordered list of experts of one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertBank {
    branches: Vec<ExpertBranch>,
    num_classes: usize,
}

impl ExpertBank {
    /// Build `config.num_experts` independent experts.
    pub fn new<R: Rng>(rng: &mut R, config: &EnsembleConfig) -> Self {
        let branches = (0..config.num_experts)
            .map(|_| ExpertBranch::new(rng, config))
            .collect();
        ExpertBank { branches, num_classes: config.num_classes }
    }

    /// The experts in evaluation order.
    pub fn branches(&self) -> &[ExpertBranch] {
        &self.branches
    }

    /// Check every expert for internal consistency.
    pub fn validate(&self) -> ModelResult<()> {
        self.branches.iter().try_for_each(ExpertBranch::validate)
    }

    /// Number of learned values over all experts.
    pub fn num_parameters(&self) -> usize {
        self.branches.iter().map(ExpertBranch::num_parameters).sum()
    }

    /// Number of batch-normalization layers over all experts.
    pub fn batch_norm_count(&self) -> usize {
        self.branches.iter().map(ExpertBranch::batch_norm_count).sum()
    }
}

impl ExpertSet for ExpertBank {
    fn num_experts(&self) -> usize {
        self.branches.len()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn run_expert(&self, index: usize, shared: &Array4<f32>) -> ModelResult<ExpertOutput> {
        let branch = self.branches.get(index).ok_or_else(|| {
            ModelError::tensor_op(format!(
                "expert {index} requested but only {} exist",
                self.branches.len()
            ))
        })?;
        branch.run(shared)
    }
}
