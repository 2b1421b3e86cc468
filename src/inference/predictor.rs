//! Single-image prediction from a saved checkpoint.
//!
//! Preprocessing matches the validation path: decode, RGB, bilinear resize
//! to the checkpoint's image size, scale to `[0, 1]`. ImageNet
//! normalisation happens inside the model.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::burn_dataset::{load_rgb, rgb_to_chw, CHANNELS};
use crate::model::classifier::EyeConditionCnn;
use crate::training::checkpoint::{load_checkpoint, CheckpointMetadata};
use crate::utils::error::{EyeConditionError, Result};

/// Outcome of one prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub image_path: Option<PathBuf>,
    /// Every class with its probability, most likely first
    pub ranked: Vec<(String, f32)>,
    pub inference_time_ms: f64,
}

impl PredictionResult {
    fn new(class_names: &[String], probabilities: Vec<f32>, elapsed: Duration, path: &Path) -> Self {
        let mut ranked: Vec<(String, f32)> = class_names
            .iter()
            .cloned()
            .zip(probabilities)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        Self {
            image_path: Some(path.to_path_buf()),
            ranked,
            inference_time_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }

    /// Most likely class and its probability
    pub fn top(&self) -> Option<(&str, f32)> {
        self.ranked.first().map(|(name, p)| (name.as_str(), *p))
    }

    pub fn top_k(&self, k: usize) -> &[(String, f32)] {
        &self.ranked[..k.min(self.ranked.len())]
    }

    /// Render the first `k` classes as percentages
    pub fn display_top_k(&self, k: usize) -> String {
        let mut output = String::new();
        if let Some(path) = &self.image_path {
            output.push_str(&format!("Image: {}\n", path.display()));
        }
        for (i, (name, prob)) in self.top_k(k).iter().enumerate() {
            output.push_str(&format!("  {}. {:<24} {:>6.2}%\n", i + 1, name, prob * 100.0));
        }
        output.push_str(&format!("Inference time: {:.2} ms", self.inference_time_ms));
        output
    }
}

impl fmt::Display for PredictionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_top_k(self.ranked.len()))
    }
}

/// A trained classifier plus the metadata needed to interpret its output
pub struct Predictor<B: Backend> {
    model: EyeConditionCnn<B>,
    metadata: CheckpointMetadata,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    /// Load a checkpoint by stem or by its `.mpk` / `.json` path
    pub fn from_checkpoint(path: &Path, device: B::Device) -> Result<Self> {
        let (model, metadata) = load_checkpoint::<B>(path, &device)?;
        if metadata.classes.len() != metadata.num_classes {
            return Err(EyeConditionError::Checkpoint(format!(
                "sidecar lists {} class names for {} outputs",
                metadata.classes.len(),
                metadata.num_classes
            )));
        }
        Ok(Self {
            model,
            metadata,
            device,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.metadata.classes
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    fn image_tensor(&self, path: &Path) -> Result<Tensor<B, 4>> {
        let [height, width] = self.metadata.image_size;
        let img = load_rgb(path, self.metadata.image_size)?;
        Ok(Tensor::<B, 4>::from_data(
            TensorData::new(
                rgb_to_chw(&img),
                [1, CHANNELS, height as usize, width as usize],
            ),
            &self.device,
        ))
    }

    /// Class probabilities for one image, sorted descending
    pub fn predict_path(&self, path: &Path) -> Result<PredictionResult> {
        let start = Instant::now();
        let images = self.image_tensor(path)?;
        let probabilities = self
            .model
            .forward(images)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| EyeConditionError::Model(format!("cannot read probabilities: {:?}", e)))?;

        let result =
            PredictionResult::new(&self.metadata.classes, probabilities, start.elapsed(), path);
        debug!(
            "Predicted {:?} for {} in {:.2} ms",
            result.top(),
            path.display(),
            result.inference_time_ms
        );
        Ok(result)
    }

    /// The `feature_vector` embedding for one image
    pub fn feature_vector(&self, path: &Path) -> Result<Vec<f32>> {
        let images = self.image_tensor(path)?;
        self.model
            .embed(images)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| EyeConditionError::Model(format!("cannot read embedding: {:?}", e)))
    }
}
