//! Error types for the adaptive expert ensemble.
//!
//! Every fallible operation in the crate returns [`ModelResult`]. Lower-level
//! configuration problems are reported as [`ConfigError`] and coerced into
//! [`ModelError`] via [`From`].
//!
//! ## Hierarchy
//!
//! ```text
//! ModelError (top-level)
//! ├── ConfigError   (validation / file loading)
//! ├── shape and batch mismatches
//! ├── invalid use   (training path outside training mode, frozen updates)
//! └── checkpoint    (JSON persistence)
//! ```

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ModelResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used throughout the crate.
pub type ModelResult<T> = Result<T, ModelError>;

// ---------------------------------------------------------------------------
// ModelError
// ---------------------------------------------------------------------------

/// Top-level error type for network construction, forward passes and
/// checkpointing.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Two tensors that must agree in shape do not.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// The training path was invoked while the network is in inference mode.
    #[error("Training forward pass requires training mode; call set_training(true) first")]
    NotTraining,

    /// Gate labels and gate loss need at least two experts.
    #[error("Gating requires at least 2 experts, got {num_experts}")]
    TooFewExperts {
        /// Number of experts available.
        num_experts: usize,
    },

    /// A transition index outside `[0, num_experts - 1)` was requested.
    #[error("Transition {transition} out of range (network has {num_transitions} transitions)")]
    TransitionOutOfRange {
        /// Requested transition.
        transition: usize,
        /// Number of transitions the gate was built for.
        num_transitions: usize,
    },

    /// A class label is outside `[0, num_classes)`.
    #[error("Target {target} at sample {index} is out of range for {num_classes} classes")]
    TargetOutOfRange {
        /// Sample position inside the batch.
        index: usize,
        /// Offending label.
        target: usize,
        /// Number of classes the network predicts.
        num_classes: usize,
    },

    /// The number of targets does not match the batch size.
    #[error("Batch mismatch: expected {expected} samples, got {actual}")]
    BatchMismatch {
        /// Batch size of the input tensor.
        expected: usize,
        /// Number of targets supplied.
        actual: usize,
    },

    /// A per-sample expert count fell outside `[1, num_experts]`.
    #[error("Expert count {count} is outside [1, {num_experts}]")]
    InvalidExpertCount {
        /// Offending count.
        count: usize,
        /// Number of experts in the ensemble.
        num_experts: usize,
    },

    /// A parameter update was requested for a component that is frozen.
    #[error("Component `{0}` is frozen and cannot be updated")]
    FrozenComponent(&'static str),

    /// An ndarray operation failed.
    #[error("Tensor operation error: {0}")]
    TensorOp(String),

    /// A checkpoint could not be saved or loaded.
    #[error("Checkpoint error: {message} (path: {path:?})")]
    Checkpoint {
        /// Human-readable description.
        message: String,
        /// Path that was being accessed.
        path: PathBuf,
    },

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    /// Construct a [`ModelError::ShapeMismatch`].
    pub fn shape_mismatch(expected: Vec<usize>, actual: Vec<usize>) -> Self {
        ModelError::ShapeMismatch { expected, actual }
    }

    /// Construct a [`ModelError::TensorOp`].
    pub fn tensor_op<S: Into<String>>(msg: S) -> Self {
        ModelError::TensorOp(msg.into())
    }

    /// Construct a [`ModelError::Checkpoint`].
    pub fn checkpoint<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        ModelError::Checkpoint { message: msg.into(), path: path.into() }
    }
}

impl From<ndarray::ShapeError> for ModelError {
    fn from(err: ndarray::ShapeError) -> Self {
        ModelError::TensorOp(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating an [`EnsembleConfig`].
///
/// [`EnsembleConfig`]: crate::config::EnsembleConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from or written to disk.
    #[error("Cannot access config file `{path}`: {source}")]
    FileRead {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}
