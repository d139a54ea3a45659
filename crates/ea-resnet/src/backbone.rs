//! Shared feature trunk.
//!
//! Input:  `[B, input_channels, H, W]`
//! Output: `[B, stem_channels, H, W]`
//!
//! - Stem:   Conv2d(input→stem, k=3, s=1, p=1) + BN + ReLU
//! - Layer1: `num_blocks[0]` × BasicBlock(stem→stem)

use ndarray::Array4;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::block::Stage;
use crate::config::EnsembleConfig;
use crate::error::{ModelError, ModelResult};
use crate::layers::{relu, BatchNorm2d, Conv2d};

/// Stem plus first stage, shared by every expert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backbone {
    stem_conv: Conv2d,
    stem_bn: BatchNorm2d,
    layer1: Stage,
}

impl Backbone {
    /// Build the trunk described by `config`.
    pub fn new<R: Rng>(rng: &mut R, config: &EnsembleConfig) -> Self {
        let width = config.stem_channels;
        Backbone {
            stem_conv: Conv2d::new(rng, config.input_channels, width, 3, 1, 1),
            stem_bn: BatchNorm2d::new(width),
            layer1: Stage::new(rng, width, width, config.num_blocks[0], 1, config.shortcut),
        }
    }

    /// Expected channels of the input image.
    pub fn in_channels(&self) -> usize {
        self.stem_conv.in_channels()
    }

    /// Channels of the shared feature map.
    pub fn out_channels(&self) -> usize {
        self.stem_conv.out_channels()
    }

    /// Compute the shared feature map for a batch of images.
    pub fn embed(&self, images: &Array4<f32>) -> ModelResult<Array4<f32>> {
        let (batch, channels, h, w) = images.dim();
        if channels != self.in_channels() || h == 0 || w == 0 {
            return Err(ModelError::shape_mismatch(
                vec![batch, self.in_channels(), h.max(1), w.max(1)],
                vec![batch, channels, h, w],
            ));
        }
        let out = relu(self.stem_bn.forward(&self.stem_conv.forward(images)?)?);
        self.layer1.forward(&out)
    }

    /// Check every layer of the trunk for internal consistency.
    pub fn validate(&self) -> ModelResult<()> {
        self.stem_conv.validate()?;
        self.stem_bn.validate()?;
        self.layer1.validate()
    }

    /// Number of learned values.
    pub fn num_parameters(&self) -> usize {
        self.stem_conv.num_parameters() + self.stem_bn.num_parameters() + self.layer1.num_parameters()
    }

    /// Number of batch-normalization layers.
    pub fn batch_norm_count(&self) -> usize {
        1 + self.layer1.batch_norm_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny() -> EnsembleConfig {
        EnsembleConfig { num_blocks: [2, 1, 1], stem_channels: 4, ..Default::default() }
    }

    #[test]
    fn embed_keeps_resolution() {
        let mut rng = StdRng::seed_from_u64(0);
        let backbone = Backbone::new(&mut rng, &tiny());
        let shared = backbone.embed(&Array4::ones((3, 3, 8, 8))).unwrap();
        assert_eq!(shared.dim(), (3, 4, 8, 8));
        assert_eq!(backbone.batch_norm_count(), 5);
    }

    #[test]
    fn embed_is_deterministic_for_a_seed() {
        let x = Array4::from_shape_fn((1, 3, 6, 6), |(_, c, h, w)| (c + h * w) as f32 * 0.1);
        let a = Backbone::new(&mut StdRng::seed_from_u64(9), &tiny()).embed(&x).unwrap();
        let b = Backbone::new(&mut StdRng::seed_from_u64(9), &tiny()).embed(&x).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_input_channels_fail_fast() {
        let mut rng = StdRng::seed_from_u64(0);
        let backbone = Backbone::new(&mut rng, &tiny());
        assert!(matches!(
            backbone.embed(&Array4::ones((1, 1, 8, 8))),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }
}
