//! # Eye Condition CNN
//!
//! Transfer-learning trainer for eye-fundus images built on the Burn
//! framework. A frozen EfficientNet-B0 backbone feeds a small trainable head
//! (Dense 256 + dropout + Dense N softmax); the classes are the
//! subdirectories of the dataset root.
//!
//! ## Modules
//!
//! - `config`: run configuration (defaults, TOML, CLI overrides)
//! - `dataset`: class discovery, seeded split, augmentation, Burn datasets
//! - `model`: backbone, classifier and summary table
//! - `training`: fit loop, callbacks, checkpoints, history
//! - `inference`: single-image prediction from a checkpoint
//! - `backend`: compile-time backend selection
//! - `utils`: errors, logging and formatting helpers

pub mod backend;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

pub use config::{AppConfig, ConfigOverrides};
pub use dataset::{ClassIndex, DatasetGenerators, FundusBatch, FundusBatcher, FundusDataset};
pub use inference::{PredictionResult, Predictor};
pub use model::{EyeConditionCnn, EyeConditionCnnConfig, ModelSummary};
pub use training::{run_training, FitOutcome, Trainer, TrainingReport};
pub use utils::error::{EyeConditionError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default square input side
pub const IMAGE_SIZE: u32 = 224;
