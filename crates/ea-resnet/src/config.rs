//! Network configuration for the adaptive expert ensemble.
//!
//! [`EnsembleConfig`] is the single source of truth for the architecture
//! (expert count, stage widths, block counts, classifier head) and for the
//! gating hyper-parameters (top-K, positive-class weight, layer sharing). It
//! is serializable via [`serde`] so it can be stored next to a checkpoint.
//!
//! # Example
//!
//! ```rust
//! use ea_resnet::config::EnsembleConfig;
//!
//! let cfg = EnsembleConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.num_experts, 3);
//! assert_eq!(cfg.layer3_width(), 64);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// How a residual block bridges a change in width or resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShortcutKind {
    /// Strided subsampling plus symmetric zero-padding of the channel axis.
    /// Parameter free.
    #[default]
    A,
    /// 1×1 strided convolution followed by batch normalization.
    B,
}

/// Whether a gate sub-layer is shared by all transitions or owned by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateSharing {
    /// One layer used at every transition.
    Shared,
    /// One layer per transition index.
    PerTransition,
}

impl GateSharing {
    /// Number of layers to allocate for `num_transitions` transitions.
    pub fn layer_count(self, num_transitions: usize) -> usize {
        match self {
            _ if num_transitions == 0 => 0,
            GateSharing::Shared => 1,
            GateSharing::PerTransition => num_transitions,
        }
    }

    /// Layer slot used at `transition`.
    pub fn layer_index(self, transition: usize) -> usize {
        match self {
            GateSharing::Shared => 0,
            GateSharing::PerTransition => transition,
        }
    }
}

/// Per-component trainability, fixed when the network is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trainability {
    /// Stem and first stage.
    pub backbone: bool,
    /// Expert branches and classifier heads.
    pub experts: bool,
    /// Gate network.
    pub gate: bool,
}

impl Trainability {
    /// Only the gate learns; the ensemble itself is frozen.
    pub fn gate_only() -> Self {
        Trainability { backbone: false, experts: false, gate: true }
    }

    /// Every component learns.
    pub fn all() -> Self {
        Trainability { backbone: true, experts: true, gate: true }
    }
}

// ---------------------------------------------------------------------------
// EnsembleConfig
// ---------------------------------------------------------------------------

/// Complete configuration of an adaptive expert ensemble.
///
/// Use [`EnsembleConfig::default()`] (a ResNet-32 with three experts on ten
/// classes) or one of the depth presets as a starting point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    // -----------------------------------------------------------------------
    // Ensemble
    // -----------------------------------------------------------------------
    /// Number of expert branches. Default: **3**.
    pub num_experts: usize,

    /// Number of output classes. Default: **10**.
    pub num_classes: usize,

    // -----------------------------------------------------------------------
    // Architecture
    // -----------------------------------------------------------------------
    /// Channels of the input image. Default: **3**.
    pub input_channels: usize,

    /// Residual blocks in each of the three stages. Default: **[5, 5, 5]**.
    pub num_blocks: [usize; 3],

    /// Width of the stem and of the shared first stage. Default: **16**.
    pub stem_channels: usize,

    /// Use the narrower expert stages (24 / 48 instead of 32 / 64).
    pub reduce_dimension: bool,

    /// Explicit width of each expert's second stage.
    #[serde(default)]
    pub layer2_channels: Option<usize>,

    /// Explicit width of each expert's third stage.
    #[serde(default)]
    pub layer3_channels: Option<usize>,

    /// Shortcut used when a block changes width or resolution. Default: **A**.
    #[serde(default)]
    pub shortcut: ShortcutKind,

    /// Use a cosine-similarity classifier head instead of a plain linear one.
    pub use_norm: bool,

    /// Score multiplier for the cosine head. Ignored (treated as 1) for the
    /// linear head. Default: **30.0**.
    pub scale: f32,

    // -----------------------------------------------------------------------
    // Gate
    // -----------------------------------------------------------------------
    /// Number of top running scores fed to the gate. Default: **5**.
    pub gate_top_k: usize,

    /// Width of the gate's hidden representation. Default: **16**.
    pub gate_hidden_dim: usize,

    /// Positive-class weight of the gate's binary cross-entropy. Default: **20.0**.
    pub pos_weight: f32,

    /// Sharing of the gate's hidden layer. Default: **PerTransition**.
    pub gate_hidden: GateSharing,

    /// Sharing of the gate's output layer. Default: **Shared**.
    pub gate_output: GateSharing,

    /// Ignore the gate at inference time and run every expert for every
    /// sample.
    pub force_all: bool,

    /// Explicit trainability. When absent it is derived from `force_all`.
    #[serde(default)]
    pub trainable: Option<Trainability>,

    // -----------------------------------------------------------------------
    // Reproducibility
    // -----------------------------------------------------------------------
    /// Seed for parameter initialisation. Default: **42**.
    pub seed: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        EnsembleConfig {
            num_experts: 3,
            num_classes: 10,
            input_channels: 3,
            num_blocks: [5, 5, 5],
            stem_channels: 16,
            reduce_dimension: false,
            layer2_channels: None,
            layer3_channels: None,
            shortcut: ShortcutKind::A,
            use_norm: false,
            scale: 30.0,
            gate_top_k: 5,
            gate_hidden_dim: 16,
            pos_weight: 20.0,
            gate_hidden: GateSharing::PerTransition,
            gate_output: GateSharing::Shared,
            force_all: false,
            trainable: None,
            seed: 42,
        }
    }
}

impl EnsembleConfig {
    fn with_depth(blocks: usize) -> Self {
        EnsembleConfig { num_blocks: [blocks; 3], ..Default::default() }
    }

    /// ResNet-20 layout (3 blocks per stage).
    pub fn resnet20() -> Self {
        Self::with_depth(3)
    }

    /// ResNet-32 layout (5 blocks per stage).
    pub fn resnet32(num_classes: usize, use_norm: bool) -> Self {
        EnsembleConfig { num_classes, use_norm, ..Self::with_depth(5) }
    }

    /// ResNet-44 layout (7 blocks per stage).
    pub fn resnet44() -> Self {
        Self::with_depth(7)
    }

    /// ResNet-56 layout (9 blocks per stage).
    pub fn resnet56() -> Self {
        Self::with_depth(9)
    }

    /// ResNet-110 layout (18 blocks per stage).
    pub fn resnet110() -> Self {
        Self::with_depth(18)
    }

    /// ResNet-1202 layout (200 blocks per stage).
    pub fn resnet1202() -> Self {
        Self::with_depth(200)
    }

    /// Width of each expert's second stage.
    pub fn layer2_width(&self) -> usize {
        self.layer2_channels
            .unwrap_or(if self.reduce_dimension { 24 } else { 32 })
    }

    /// Width of each expert's third stage (and of the gate's input feature).
    pub fn layer3_width(&self) -> usize {
        self.layer3_channels
            .unwrap_or(if self.reduce_dimension { 48 } else { 64 })
    }

    /// Multiplier applied to every expert's class scores.
    pub fn effective_scale(&self) -> f32 {
        if self.use_norm {
            self.scale
        } else {
            1.0
        }
    }

    /// Number of gate transitions (`num_experts - 1`).
    pub fn num_transitions(&self) -> usize {
        self.num_experts.saturating_sub(1)
    }

    /// Resolved per-component trainability.
    pub fn trainability(&self) -> Trainability {
        match self.trainable {
            Some(t) => t,
            None if self.force_all => Trainability::all(),
            None => Trainability::gate_only(),
        }
    }

    /// Load an [`EnsembleConfig`] from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed and
    /// [`ConfigError::InvalidValue`] if it fails validation.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: EnsembleConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validate all fields and return an error describing the first problem
    /// found.
    ///
    /// # Validated invariants
    ///
    /// - Expert, class, channel and block counts must be non-zero.
    /// - `gate_top_k` must lie in `[1, num_classes]`.
    /// - `pos_weight` and `scale` must be finite and strictly positive.
    /// - Stage widths must not shrink; with shortcut A every widening must
    ///   be even so the zero-padding splits symmetrically.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_experts == 0 {
            return Err(ConfigError::invalid_value("num_experts", "must be > 0"));
        }
        if self.num_classes == 0 {
            return Err(ConfigError::invalid_value("num_classes", "must be > 0"));
        }
        if self.input_channels == 0 {
            return Err(ConfigError::invalid_value("input_channels", "must be > 0"));
        }
        if self.num_blocks.iter().any(|&n| n == 0) {
            return Err(ConfigError::invalid_value(
                "num_blocks",
                "every stage needs at least one block",
            ));
        }
        if self.stem_channels == 0 {
            return Err(ConfigError::invalid_value("stem_channels", "must be > 0"));
        }

        // Gate
        if self.gate_top_k == 0 || self.gate_top_k > self.num_classes {
            return Err(ConfigError::invalid_value(
                "gate_top_k",
                format!("must be in [1, num_classes = {}]", self.num_classes),
            ));
        }
        if self.gate_hidden_dim == 0 {
            return Err(ConfigError::invalid_value("gate_hidden_dim", "must be > 0"));
        }
        if !self.pos_weight.is_finite() || self.pos_weight <= 0.0 {
            return Err(ConfigError::invalid_value("pos_weight", "must be > 0.0"));
        }
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(ConfigError::invalid_value("scale", "must be > 0.0"));
        }

        // Stage widths
        let widths = [self.stem_channels, self.layer2_width(), self.layer3_width()];
        for pair in widths.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if to < from {
                return Err(ConfigError::invalid_value(
                    "layer2_channels / layer3_channels",
                    format!("stage widths must not shrink ({from} -> {to})"),
                ));
            }
            if self.shortcut == ShortcutKind::A && (to - from) % 2 != 0 {
                return Err(ConfigError::invalid_value(
                    "shortcut",
                    format!("shortcut A needs an even widening ({from} -> {to})"),
                ));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        EnsembleConfig::default()
            .validate()
            .expect("default config should be valid");
    }

    #[test]
    fn json_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut original = EnsembleConfig::resnet32(100, true);
        original.gate_hidden = GateSharing::Shared;
        original.trainable = Some(Trainability::all());
        original.to_json(&path).expect("serialization should succeed");

        let loaded = EnsembleConfig::from_json(&path).expect("deserialization should succeed");
        assert_eq!(loaded, original);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            EnsembleConfig::from_json(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn stage_widths_follow_reduce_dimension() {
        let mut cfg = EnsembleConfig::default();
        assert_eq!((cfg.layer2_width(), cfg.layer3_width()), (32, 64));
        cfg.reduce_dimension = true;
        assert_eq!((cfg.layer2_width(), cfg.layer3_width()), (24, 48));
        cfg.layer3_channels = Some(40);
        assert_eq!(cfg.layer3_width(), 40);
    }

    #[test]
    fn linear_head_forces_unit_scale() {
        let mut cfg = EnsembleConfig::default();
        assert_eq!(cfg.effective_scale(), 1.0);
        cfg.use_norm = true;
        assert_eq!(cfg.effective_scale(), 30.0);
    }

    #[test]
    fn trainability_derives_from_force_all() {
        let mut cfg = EnsembleConfig::default();
        assert_eq!(cfg.trainability(), Trainability::gate_only());
        cfg.force_all = true;
        assert_eq!(cfg.trainability(), Trainability::all());
        cfg.trainable = Some(Trainability { backbone: false, experts: true, gate: false });
        assert!(!cfg.trainability().gate);
    }

    #[test]
    fn top_k_larger_than_classes_is_invalid() {
        let mut cfg = EnsembleConfig::default();
        cfg.num_classes = 4;
        assert!(cfg.validate().is_err());
        cfg.gate_top_k = 4;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn odd_widening_is_invalid_for_shortcut_a_only() {
        let mut cfg = EnsembleConfig::default();
        cfg.layer2_channels = Some(33);
        assert!(cfg.validate().is_err());
        cfg.shortcut = ShortcutKind::B;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn shrinking_stage_is_invalid() {
        let mut cfg = EnsembleConfig::default();
        cfg.layer3_channels = Some(16);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_positive_pos_weight_is_invalid() {
        let mut cfg = EnsembleConfig::default();
        cfg.pos_weight = 0.0;
        assert!(cfg.validate().is_err());
        cfg.pos_weight = f32::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn depth_presets_set_block_counts() {
        assert_eq!(EnsembleConfig::resnet20().num_blocks, [3, 3, 3]);
        assert_eq!(EnsembleConfig::resnet44().num_blocks, [7, 7, 7]);
        assert_eq!(EnsembleConfig::resnet56().num_blocks, [9, 9, 9]);
        assert_eq!(EnsembleConfig::resnet110().num_blocks, [18, 18, 18]);
        assert_eq!(EnsembleConfig::resnet1202().num_blocks, [200, 200, 200]);
        let r32 = EnsembleConfig::resnet32(100, true);
        assert_eq!((r32.num_blocks, r32.num_classes, r32.use_norm), ([5, 5, 5], 100, true));
    }

    #[test]
    fn gate_sharing_layer_layout() {
        assert_eq!(GateSharing::Shared.layer_count(4), 1);
        assert_eq!(GateSharing::PerTransition.layer_count(4), 4);
        assert_eq!(GateSharing::Shared.layer_count(0), 0);
        assert_eq!(GateSharing::Shared.layer_index(3), 0);
        assert_eq!(GateSharing::PerTransition.layer_index(3), 3);
    }
}
