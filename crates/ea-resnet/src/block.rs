//! Residual blocks and stages.
//!
//! ```text
//! x ─── Conv3x3(s) ─── BN ─── ReLU ─── Conv3x3(1) ─── BN ──+── ReLU
//!  │                                                        │
//!  └── shortcut (identity | subsample+pad | 1x1 conv+BN) ───┘
//! ```

use ndarray::{s, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ShortcutKind;
use crate::error::{ModelError, ModelResult};
use crate::layers::{relu, BatchNorm2d, Conv2d};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Shortcut {
    Identity,
    /// `x[:, :, ::stride, ::stride]`, zero-padded by `pad` channels per side.
    PadChannels { stride: usize, pad: usize },
    Projection { conv: Conv2d, bn: BatchNorm2d },
}

impl Shortcut {
    fn apply(&self, x: &Array4<f32>) -> ModelResult<Array4<f32>> {
        match self {
            Shortcut::Identity => Ok(x.clone()),
            Shortcut::PadChannels { stride, pad } => {
                let (step, pad) = (*stride as isize, *pad);
                let sub = x.slice(s![.., .., ..;step, ..;step]);
                let (batch, channels, h, w) = sub.dim();
                let mut out = Array4::zeros((batch, channels + 2 * pad, h, w));
                out.slice_mut(s![.., pad..pad + channels, .., ..]).assign(&sub);
                Ok(out)
            }
            Shortcut::Projection { conv, bn } => bn.forward(&conv.forward(x)?),
        }
    }

    fn validate(&self) -> ModelResult<()> {
        match self {
            Shortcut::Identity => Ok(()),
            Shortcut::PadChannels { stride, .. } if *stride == 0 => {
                Err(ModelError::tensor_op("shortcut stride must be > 0"))
            }
            Shortcut::PadChannels { .. } => Ok(()),
            Shortcut::Projection { conv, bn } => {
                conv.validate()?;
                bn.validate()
            }
        }
    }

    fn num_parameters(&self) -> usize {
        match self {
            Shortcut::Projection { conv, bn } => conv.num_parameters() + bn.num_parameters(),
            _ => 0,
        }
    }
}

/// Two 3×3 convolutions with a residual connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    shortcut: Shortcut,
}

impl BasicBlock {
    /// Build a block mapping `in_channels → out_channels` at `stride`.
    pub fn new<R: Rng>(
        rng: &mut R,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        kind: ShortcutKind,
    ) -> Self {
        let shortcut = if stride != 1 || in_channels != out_channels {
            match kind {
                ShortcutKind::A => Shortcut::PadChannels {
                    stride,
                    pad: out_channels.saturating_sub(in_channels) / 2,
                },
                ShortcutKind::B => Shortcut::Projection {
                    conv: Conv2d::new(rng, in_channels, out_channels, 1, stride, 0),
                    bn: BatchNorm2d::new(out_channels),
                },
            }
        } else {
            Shortcut::Identity
        };

        BasicBlock {
            conv1: Conv2d::new(rng, in_channels, out_channels, 3, stride, 1),
            bn1: BatchNorm2d::new(out_channels),
            conv2: Conv2d::new(rng, out_channels, out_channels, 3, 1, 1),
            bn2: BatchNorm2d::new(out_channels),
            shortcut,
        }
    }

    /// Run the block on a `[B, C_in, H, W]` batch.
    pub fn forward(&self, x: &Array4<f32>) -> ModelResult<Array4<f32>> {
        let out = relu(self.bn1.forward(&self.conv1.forward(x)?)?);
        let out = self.bn2.forward(&self.conv2.forward(&out)?)?;
        let residual = self.shortcut.apply(x)?;
        if residual.dim() != out.dim() {
            let (a, b, c, d) = out.dim();
            let (e, f, g, h) = residual.dim();
            return Err(ModelError::shape_mismatch(vec![a, b, c, d], vec![e, f, g, h]));
        }
        Ok(relu(out + residual))
    }

    /// Output channels.
    pub fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }

    /// Check every layer of the block for internal consistency.
    pub fn validate(&self) -> ModelResult<()> {
        self.conv1.validate()?;
        self.bn1.validate()?;
        self.conv2.validate()?;
        self.bn2.validate()?;
        self.shortcut.validate()
    }

    /// Number of learned values.
    pub fn num_parameters(&self) -> usize {
        self.conv1.num_parameters()
            + self.bn1.num_parameters()
            + self.conv2.num_parameters()
            + self.bn2.num_parameters()
            + self.shortcut.num_parameters()
    }

    /// Number of batch-normalization layers in the block.
    pub fn batch_norm_count(&self) -> usize {
        match self.shortcut {
            Shortcut::Projection { .. } => 3,
            _ => 2,
        }
    }
}

/// A run of blocks; the first carries the stage stride.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    blocks: Vec<BasicBlock>,
}

impl Stage {
    /// Build `num_blocks` blocks mapping `in_channels → out_channels`.
    pub fn new<R: Rng>(
        rng: &mut R,
        in_channels: usize,
        out_channels: usize,
        num_blocks: usize,
        stride: usize,
        kind: ShortcutKind,
    ) -> Self {
        let mut blocks = Vec::with_capacity(num_blocks);
        let mut channels = in_channels;
        for i in 0..num_blocks {
            let block_stride = if i == 0 { stride } else { 1 };
            blocks.push(BasicBlock::new(rng, channels, out_channels, block_stride, kind));
            channels = out_channels;
        }
        Stage { blocks }
    }

    /// Run every block in order.
    pub fn forward(&self, x: &Array4<f32>) -> ModelResult<Array4<f32>> {
        let mut out = x.clone();
        for block in &self.blocks {
            out = block.forward(&out)?;
        }
        Ok(out)
    }

    /// Check every block of the stage.
    pub fn validate(&self) -> ModelResult<()> {
        self.blocks.iter().try_for_each(BasicBlock::validate)
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// `true` when the stage has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of learned values.
    pub fn num_parameters(&self) -> usize {
        self.blocks.iter().map(BasicBlock::num_parameters).sum()
    }

    /// Number of batch-normalization layers.
    pub fn batch_norm_count(&self) -> usize {
        self.blocks.iter().map(BasicBlock::batch_norm_count).sum()
    }
}
