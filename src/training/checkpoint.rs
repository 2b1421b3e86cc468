//! Model checkpointing.
//!
//! A checkpoint is one Burn record file (`<stem>.mpk`) plus a JSON sidecar
//! (`<stem>.json`) with everything needed to rebuild the network:
//! architecture, class names, and input size. The best checkpoint's record
//! carries the optimizer state next to the model weights, so a run leaves
//! exactly two `.mpk` files behind.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::AutodiffBackend;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::OutputConfig;
use crate::model::classifier::{
    EyeConditionCnn, EyeConditionCnnConfig, EyeConditionCnnRecord, MODEL_NAME,
};
use crate::utils::error::{EyeConditionError, Result};

/// Recorder used for every file this crate writes
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Contents of a weights-only checkpoint file.
///
/// Reading a best checkpoint through this record skips its optimizer entry,
/// which is how inference loads either kind.
#[derive(Record)]
pub struct ModelCheckpointRecord<B: Backend> {
    pub model: EyeConditionCnnRecord<B>,
}

/// Contents of the best checkpoint file: model weights and optimizer state
#[derive(Record)]
pub struct TrainingCheckpointRecord<B: Backend, O: Record<B>> {
    pub model: EyeConditionCnnRecord<B>,
    pub optimizer: O,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Best,
    Final,
}

/// Sidecar written next to each weights file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_name: String,
    pub kind: CheckpointKind,
    pub num_classes: usize,
    pub feature_units: usize,
    pub dropout: f64,
    /// Class names in label order
    pub classes: Vec<String>,
    /// `[height, width]`
    pub image_size: [u32; 2],
    /// Epoch whose weights are stored (1-based)
    pub epoch: usize,
    pub val_accuracy: f64,
    pub val_loss: f64,
    pub includes_optimizer: bool,
    pub timestamp: String,
}

impl CheckpointMetadata {
    pub fn new(
        kind: CheckpointKind,
        model: &EyeConditionCnnConfig,
        classes: Vec<String>,
        image_size: [u32; 2],
    ) -> Self {
        Self {
            model_name: MODEL_NAME.to_string(),
            kind,
            num_classes: model.num_classes,
            feature_units: model.feature_units,
            dropout: model.dropout,
            classes,
            image_size,
            epoch: 0,
            val_accuracy: 0.0,
            val_loss: 0.0,
            includes_optimizer: false,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Copy stamped with the metrics of `epoch`
    pub fn at_epoch(&self, epoch: usize, val_accuracy: f64, val_loss: f64) -> Self {
        Self {
            epoch,
            val_accuracy,
            val_loss,
            timestamp: Utc::now().to_rfc3339(),
            ..self.clone()
        }
    }

    pub fn model_config(&self) -> EyeConditionCnnConfig {
        EyeConditionCnnConfig::new(self.num_classes)
            .with_feature_units(self.feature_units)
            .with_dropout(self.dropout)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        debug!("Checkpoint metadata saved to {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            EyeConditionError::Checkpoint(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// `<stem>.mpk`
pub fn weights_file(stem: &Path) -> PathBuf {
    stem.with_extension("mpk")
}

/// `<stem>.json`
pub fn metadata_file(stem: &Path) -> PathBuf {
    stem.with_extension("json")
}

fn record_error(action: &str, stem: &Path, e: impl std::fmt::Debug) -> EyeConditionError {
    EyeConditionError::Checkpoint(format!("failed to {} {}: {:?}", action, stem.display(), e))
}

/// Write the weights of `model` to `<stem>.mpk`
pub fn save_weights<B: Backend>(model: &EyeConditionCnn<B>, stem: &Path) -> Result<PathBuf> {
    if let Some(parent) = stem.parent() {
        fs::create_dir_all(parent)?;
    }
    let record = ModelCheckpointRecord {
        model: model.clone().into_record(),
    };
    Recorder::<B>::record(&CheckpointRecorder::new(), record, stem.to_path_buf())
        .map_err(|e| record_error("save", stem, e))?;
    Ok(weights_file(stem))
}

/// Rebuild a model from a checkpoint stem (or its `.mpk` / `.json` path)
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(EyeConditionCnn<B>, CheckpointMetadata)> {
    let stem = path.with_extension("");
    let metadata = CheckpointMetadata::load(&metadata_file(&stem))?;
    let config = metadata.model_config();
    config.validate()?;

    let record: ModelCheckpointRecord<B> =
        Recorder::<B>::load(&CheckpointRecorder::new(), stem.clone(), device)
            .map_err(|e| record_error("load", &stem, e))?;
    let model = config.init::<B>(device).load_record(record.model);

    info!(
        "Loaded {} checkpoint from {:?} (epoch {}, val_accuracy {:.4})",
        match metadata.kind {
            CheckpointKind::Best => "best",
            CheckpointKind::Final => "final",
        },
        weights_file(&stem),
        metadata.epoch,
        metadata.val_accuracy
    );
    Ok((model, metadata))
}

/// Restore the model and optimizer stored in a best checkpoint.
///
/// `optimizer` must be freshly built with the same configuration as the one
/// that wrote the file.
pub fn load_training_state<B, O>(
    path: &Path,
    optimizer: O,
    device: &B::Device,
) -> Result<(EyeConditionCnn<B>, O, CheckpointMetadata)>
where
    B: AutodiffBackend,
    O: Optimizer<EyeConditionCnn<B>, B>,
{
    let stem = path.with_extension("");
    let metadata = CheckpointMetadata::load(&metadata_file(&stem))?;
    if !metadata.includes_optimizer {
        return Err(EyeConditionError::Checkpoint(format!(
            "{} holds no optimizer state",
            weights_file(&stem).display()
        )));
    }
    let config = metadata.model_config();
    config.validate()?;

    let record: TrainingCheckpointRecord<B, O::Record> =
        Recorder::<B>::load(&CheckpointRecorder::new(), stem.clone(), device)
            .map_err(|e| record_error("load", &stem, e))?;
    let model = config.init::<B>(device).load_record(record.model);
    let optimizer = optimizer.load_record(record.optimizer);

    debug!("Restored model and optimizer state from {:?}", weights_file(&stem));
    Ok((model, optimizer, metadata))
}

/// Writes the best and final checkpoints of one run
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    best_stem: PathBuf,
    final_stem: PathBuf,
}

impl CheckpointWriter {
    pub fn new(output: &OutputConfig) -> Self {
        Self {
            best_stem: output.best_checkpoint_path(),
            final_stem: output.final_checkpoint_path(),
        }
    }

    pub fn best_weights(&self) -> PathBuf {
        weights_file(&self.best_stem)
    }

    pub fn final_weights(&self) -> PathBuf {
        weights_file(&self.final_stem)
    }

    /// Overwrite the best checkpoint with weights, optimizer state and sidecar
    pub fn save_best<B, O>(
        &self,
        model: &EyeConditionCnn<B>,
        optimizer: &O,
        metadata: &CheckpointMetadata,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<EyeConditionCnn<B>, B>,
    {
        if let Some(parent) = self.best_stem.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = TrainingCheckpointRecord {
            model: model.clone().into_record(),
            optimizer: optimizer.to_record(),
        };
        Recorder::<B>::record(&CheckpointRecorder::new(), record, self.best_stem.clone())
            .map_err(|e| record_error("save", &self.best_stem, e))?;
        let path = weights_file(&self.best_stem);

        let metadata = CheckpointMetadata {
            kind: CheckpointKind::Best,
            includes_optimizer: true,
            ..metadata.clone()
        };
        metadata.save(&metadata_file(&self.best_stem))?;

        info!("Saved best checkpoint to {:?}", path);
        Ok(())
    }

    /// Write the final weights-only checkpoint
    pub fn save_final<B: Backend>(
        &self,
        model: &EyeConditionCnn<B>,
        metadata: &CheckpointMetadata,
    ) -> Result<()> {
        let path = save_weights(model, &self.final_stem)?;
        let metadata = CheckpointMetadata {
            kind: CheckpointKind::Final,
            includes_optimizer: false,
            ..metadata.clone()
        };
        metadata.save(&metadata_file(&self.final_stem))?;

        info!("Saved final checkpoint to {:?}", path);
        Ok(())
    }
}

/// Write `labels.json`: the class names in label order
pub fn write_labels(path: &Path, classes: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(classes)?)?;
    info!("Class labels saved to {:?}", path);
    Ok(())
}
