//! Error Handling Module
//!
//! Defines the error type shared by every stage of the training pipeline.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for eye-condition training and inference
#[derive(Error, Debug)]
pub enum EyeConditionError {
    /// The configured dataset root is missing
    #[error("Dataset root does not exist: {0}")]
    DatasetNotFound(PathBuf),

    /// Error with dataset discovery or splitting
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error loading or decoding an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error with model construction or weight loading
    #[error("Model error: {0}")]
    Model(String),

    /// Error raised by the training loop
    #[error("Training error: {0}")]
    Training(String),

    /// Error writing or reading a checkpoint
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience Result type for eye-condition operations
pub type Result<T> = std::result::Result<T, EyeConditionError>;

impl From<serde_json::Error> for EyeConditionError {
    fn from(err: serde_json::Error) -> Self {
        EyeConditionError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for EyeConditionError {
    fn from(err: toml::de::Error) -> Self {
        EyeConditionError::Config(err.to_string())
    }
}

impl From<image::ImageError> for EyeConditionError {
    fn from(err: image::ImageError) -> Self {
        EyeConditionError::Dataset(format!("image processing failed: {}", err))
    }
}

/// Extension trait for attaching a path to image decoding failures
pub trait ImageResultExt<T> {
    /// Map the error into [`EyeConditionError::ImageLoad`] for `path`
    fn for_image(self, path: &std::path::Path) -> Result<T>;
}

impl<T, E: std::fmt::Display> ImageResultExt<T> for std::result::Result<T, E> {
    fn for_image(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| EyeConditionError::ImageLoad(path.to_path_buf(), e.to_string()))
    }
}
