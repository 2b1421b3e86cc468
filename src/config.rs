//! Run configuration.
//!
//! Every setting has a default
//! (224×224 images, batch 32, 3 epochs, 20% validation, seed 42, Adam 1e-3,
//! patience 3, ImageNet backbone from `weights/efficientnet_b0.safetensors`).
//! A TOML file can replace any subset of them and CLI flags are applied last
//! through [`ConfigOverrides`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::augmentation::AugmentationConfig;
use crate::utils::error::{EyeConditionError, Result};

/// Smallest image side the backbone can reduce to a valid feature map
pub const MIN_IMAGE_SIDE: u32 = 32;

/// Where training looks for the ImageNet backbone unless told otherwise
pub const DEFAULT_BACKBONE_WEIGHTS: &str = "weights/efficientnet_b0.safetensors";

/// Stems taken by `labels.json` and `training_history.csv`
pub const RESERVED_STEMS: [&str; 2] = ["labels", "training_history"];

/// Complete configuration for one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Seed for the split, loader shuffling and augmentation
    pub seed: u64,
    pub data: DataConfig,
    pub augmentation: AugmentationConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub output: OutputConfig,
}

/// Dataset location and preprocessing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root directory; each immediate subdirectory is one class
    pub root: PathBuf,
    /// Target size as `[height, width]`
    pub image_size: [u32; 2],
    /// Fraction of every class held out for validation
    pub validation_split: f64,
}

/// Classification head and backbone weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Width of the `feature_vector` embedding layer
    pub feature_units: usize,
    /// Dropout rate applied after the embedding during training
    pub dropout: f64,
    /// ImageNet EfficientNet-B0 weights: a torchvision/timm `.safetensors`
    /// export or a Burn record of the backbone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backbone_weights: Option<PathBuf>,
    /// Train on a randomly initialised backbone; `backbone_weights` is ignored
    pub random_backbone: bool,
}

/// Optimisation and callback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    /// Maximum number of epochs
    pub epochs: usize,
    pub learning_rate: f64,
    /// Epochs without `val_accuracy` improvement before stopping
    pub early_stopping_patience: usize,
}

/// Where artifacts are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// File stem of the best-by-validation-accuracy checkpoint
    pub best_checkpoint: String,
    /// File stem of the last-epoch checkpoint
    pub final_checkpoint: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            data: DataConfig::default(),
            augmentation: AugmentationConfig::default(),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("dataset"),
            image_size: [crate::IMAGE_SIZE, crate::IMAGE_SIZE],
            validation_split: 0.2,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            feature_units: 256,
            dropout: 0.3,
            backbone_weights: Some(PathBuf::from(DEFAULT_BACKBONE_WEIGHTS)),
            random_backbone: false,
        }
    }
}

impl ModelConfig {
    /// Weights the backbone is initialised from, `None` for a random backbone
    pub fn pretrained_backbone(&self) -> Option<&Path> {
        if self.random_backbone {
            None
        } else {
            self.backbone_weights.as_deref()
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 3,
            learning_rate: 1e-3,
            early_stopping_patience: 3,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            best_checkpoint: "eye_condition_model".to_string(),
            final_checkpoint: "eye_condition_model_final".to_string(),
        }
    }
}

impl OutputConfig {
    /// Path stem of the best checkpoint (the recorder adds `.mpk`)
    pub fn best_checkpoint_path(&self) -> PathBuf {
        self.dir.join(&self.best_checkpoint)
    }

    /// Path stem of the final checkpoint
    pub fn final_checkpoint_path(&self) -> PathBuf {
        self.dir.join(&self.final_checkpoint)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.dir.join("labels.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join("training_history.csv")
    }
}

impl AppConfig {
    /// Load a configuration from a TOML file; missing keys keep their defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EyeConditionError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;

        let config: AppConfig = toml::from_str(&content).map_err(|e| {
            EyeConditionError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Check value ranges. Does not touch the filesystem.
    pub fn validate(&self) -> Result<()> {
        let split = self.data.validation_split;
        if !(split > 0.0 && split < 1.0) {
            return Err(EyeConditionError::Config(format!(
                "validation_split must be in (0, 1), got {}",
                split
            )));
        }

        let [height, width] = self.data.image_size;
        if height < MIN_IMAGE_SIDE || width < MIN_IMAGE_SIDE {
            return Err(EyeConditionError::Config(format!(
                "image_size must be at least {}x{}, got {}x{}",
                MIN_IMAGE_SIDE, MIN_IMAGE_SIDE, height, width
            )));
        }

        if self.training.batch_size == 0 {
            return Err(EyeConditionError::Config("batch_size must be > 0".into()));
        }
        if self.training.epochs == 0 {
            return Err(EyeConditionError::Config("epochs must be > 0".into()));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(EyeConditionError::Config(format!(
                "learning_rate must be positive, got {}",
                self.training.learning_rate
            )));
        }

        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(EyeConditionError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }
        if self.model.feature_units == 0 {
            return Err(EyeConditionError::Config("feature_units must be > 0".into()));
        }
        if !self.model.random_backbone && self.model.backbone_weights.is_none() {
            return Err(EyeConditionError::Config(
                "backbone_weights is required unless random_backbone is set".into(),
            ));
        }

        self.augmentation.validate()?;

        for name in [&self.output.best_checkpoint, &self.output.final_checkpoint] {
            if name.is_empty() || name.contains(['.', '/', '\\']) {
                return Err(EyeConditionError::Config(format!(
                    "checkpoint name must be a bare file stem, got {:?}",
                    name
                )));
            }
            if RESERVED_STEMS.contains(&name.as_str()) {
                return Err(EyeConditionError::Config(format!(
                    "checkpoint name {:?} would overwrite another run artifact",
                    name
                )));
            }
        }
        if self.output.best_checkpoint == self.output.final_checkpoint {
            return Err(EyeConditionError::Config(
                "best_checkpoint and final_checkpoint must differ".into(),
            ));
        }

        Ok(())
    }

    /// Fail when the dataset root is missing
    pub fn ensure_dataset_root(&self) -> Result<()> {
        if self.data.root.is_dir() {
            Ok(())
        } else {
            Err(EyeConditionError::DatasetNotFound(self.data.root.clone()))
        }
    }

    /// Fail when the configured backbone weights file is missing
    pub fn ensure_backbone_weights(&self) -> Result<()> {
        match self.model.pretrained_backbone() {
            Some(path) if !path.is_file() => Err(EyeConditionError::Config(format!(
                "pretrained backbone weights not found at {}; download an ImageNet \
                 EfficientNet-B0 .safetensors export (torchvision or timm) or pass \
                 --random-backbone",
                path.display()
            ))),
            _ => Ok(()),
        }
    }

    /// Apply CLI overrides on top of the current values
    pub fn apply_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(root) = &overrides.data_dir {
            self.data.root = root.clone();
        }
        if let Some(split) = overrides.validation_split {
            self.data.validation_split = split;
        }
        if let Some(epochs) = overrides.epochs {
            self.training.epochs = epochs;
        }
        if let Some(batch_size) = overrides.batch_size {
            self.training.batch_size = batch_size;
        }
        if let Some(lr) = overrides.learning_rate {
            self.training.learning_rate = lr;
        }
        if let Some(patience) = overrides.patience {
            self.training.early_stopping_patience = patience;
        }
        if let Some(seed) = overrides.seed {
            self.seed = seed;
        }
        if let Some(dir) = &overrides.output_dir {
            self.output.dir = dir.clone();
        }
        if let Some(weights) = &overrides.backbone_weights {
            self.model.backbone_weights = Some(weights.clone());
        }
        if overrides.random_backbone {
            self.model.random_backbone = true;
        }
        self
    }
}

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub validation_split: Option<f64>,
    pub epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub learning_rate: Option<f64>,
    pub patience: Option<usize>,
    pub seed: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub backbone_weights: Option<PathBuf>,
    pub random_backbone: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.data.image_size, [224, 224]);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.data.validation_split, 0.2);
        assert_eq!(config.seed, 42);
        assert_eq!(config.training.learning_rate, 1e-3);
        assert_eq!(config.training.early_stopping_patience, 3);
        assert_eq!(config.model.feature_units, 256);
        assert_eq!(config.model.dropout, 0.3);
        assert_eq!(
            config.model.pretrained_backbone(),
            Some(Path::new(DEFAULT_BACKBONE_WEIGHTS))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backbone_weights_are_required() {
        let mut config = AppConfig::default();
        config.model.backbone_weights = Some(PathBuf::from("/nonexistent/b0.safetensors"));
        assert!(matches!(
            config.ensure_backbone_weights(),
            Err(EyeConditionError::Config(_))
        ));

        config.model.backbone_weights = None;
        assert!(matches!(config.validate(), Err(EyeConditionError::Config(_))));

        config.model.random_backbone = true;
        assert!(config.validate().is_ok());
        assert!(config.ensure_backbone_weights().is_ok());
        assert_eq!(config.model.pretrained_backbone(), None);
    }

    #[test]
    fn test_existing_backbone_weights_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("efficientnet_b0.safetensors");
        fs::write(&path, b"").unwrap();

        let mut config = AppConfig::default();
        config.model.backbone_weights = Some(path);
        assert!(config.ensure_backbone_weights().is_ok());
    }

    #[test]
    fn test_checkpoint_names_cannot_clobber_artifacts() {
        for reserved in RESERVED_STEMS {
            let mut config = AppConfig::default();
            config.output.best_checkpoint = reserved.to_string();
            assert!(matches!(config.validate(), Err(EyeConditionError::Config(_))));

            let mut config = AppConfig::default();
            config.output.final_checkpoint = reserved.to_string();
            assert!(matches!(config.validate(), Err(EyeConditionError::Config(_))));
        }
    }

    #[test]
    fn test_checkpoint_paths() {
        let mut output = OutputConfig::default();
        output.dir = PathBuf::from("artifacts");
        assert_eq!(
            output.best_checkpoint_path(),
            PathBuf::from("artifacts/eye_condition_model")
        );
        assert_eq!(
            output.final_checkpoint_path(),
            PathBuf::from("artifacts/eye_condition_model_final")
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            seed = 7

            [training]
            epochs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.training.epochs, 10);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.data.image_size, [224, 224]);
    }

    #[test]
    fn test_toml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");

        let mut config = AppConfig::default();
        config.model.backbone_weights = Some(PathBuf::from("weights/b0_imagenet.safetensors"));
        config.training.batch_size = 16;
        fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = AppConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_config_file_is_config_error() {
        let err = AppConfig::from_toml_file(Path::new("/nonexistent/train.toml")).unwrap_err();
        assert!(matches!(err, EyeConditionError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.data.validation_split = 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.data.image_size = [16, 224];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.dropout = 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.output.final_checkpoint = config.output.best_checkpoint.clone();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.output.best_checkpoint = "model.h5".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_root_is_dataset_not_found() {
        let mut config = AppConfig::default();
        config.data.root = PathBuf::from("/definitely/not/a/dataset");
        assert!(matches!(
            config.ensure_dataset_root(),
            Err(EyeConditionError::DatasetNotFound(_))
        ));
    }

    #[test]
    fn test_random_backbone_override() {
        let overrides = ConfigOverrides {
            random_backbone: true,
            ..Default::default()
        };
        let config = AppConfig::default().apply_overrides(&overrides);
        assert!(config.model.random_backbone);
        assert_eq!(config.model.pretrained_backbone(), None);
    }

    #[test]
    fn test_overrides_win() {
        let overrides = ConfigOverrides {
            epochs: Some(12),
            seed: Some(1),
            data_dir: Some(PathBuf::from("fundus")),
            ..Default::default()
        };
        let config = AppConfig::default().apply_overrides(&overrides);
        assert_eq!(config.training.epochs, 12);
        assert_eq!(config.seed, 1);
        assert_eq!(config.data.root, PathBuf::from("fundus"));
        assert_eq!(config.training.batch_size, 32);
    }
}
