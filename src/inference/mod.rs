//! Inference on saved checkpoints
//!
//! Mirrors the frontend's prediction path: resize, divide by 255, softmax,
//! then rank the classes.

pub mod predictor;

pub use predictor::{PredictionResult, Predictor};

/// Number of classes the CLI prints unless told otherwise
pub const DEFAULT_TOP_K: usize = 3;
