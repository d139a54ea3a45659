//! # EA-ResNet: adaptive multi-expert ResNet ensembles
//!
//! A CIFAR-scale residual network whose late stages are replicated into
//! several experts, plus a small gate that decides per sample whether the
//! next expert is worth evaluating.
//!
//! ## Architecture
//!
//! ```text
//! images ──► Backbone (stem + layer1) ──► shared features
//!                                           │
//!             ┌─────────────────────────────┼──────────────────────┐
//!             ▼                             ▼                      ▼
//!         Expert 0 ──► gate(0) ──►      Expert 1 ──► gate(1) ──►  Expert 2 …
//!        (layer2, layer3, head)
//!             │                             │                      │
//!             └──────────── running ensemble score / experts used ─┘
//! ```
//!
//! During training every sample visits every expert and the gate learns
//! from derived "would continuing help" labels ([`labels`]). During
//! inference samples leave the ensemble as soon as the gate says stop
//! ([`ensemble::adaptive_pass`]).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use ea_resnet::{EnsembleConfig, EnsembleNet};
//! use ndarray::Array4;
//!
//! let mut net = EnsembleNet::new(EnsembleConfig::resnet20()).unwrap();
//! net.set_training(false);
//! let out = net.forward_inference(&Array4::zeros((8, 3, 32, 32))).unwrap();
//! println!("experts per sample: {:?}", out.expert_counts);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backbone;
pub mod block;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod expert;
pub mod gate;
pub mod labels;
pub mod layers;
pub mod model;
pub mod routing;

pub use config::{EnsembleConfig, GateSharing, ShortcutKind, Trainability};
pub use ensemble::{
    adaptive_pass, train_pass, AdaptivePass, ExpertSet, RoutingTrace, TrainingPass, TransitionGate,
};
pub use error::{ConfigError, ModelError, ModelResult};
pub use expert::ExpertOutput;
pub use gate::{GateGradients, GateNetwork};
pub use model::{EnsembleNet, InferenceOutput, TrainingOutput};
pub use routing::ExpertUsage;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
