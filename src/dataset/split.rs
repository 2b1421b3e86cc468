//! Training / validation split.
//!
//! Each class is split on its own: its sorted paths are shuffled with a
//! seeded ChaCha8 generator and the first `floor(n * fraction)` become
//! validation data. The same seed always yields the same split for the
//! same directory contents.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dataset::loader::{FundusDirectory, LabeledImage};
use crate::utils::error::{EyeConditionError, Result};

/// Configuration for the split
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Fraction of each class held out for validation
    pub validation_fraction: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            seed: 42,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(EyeConditionError::Config(format!(
                "validation fraction must be in (0, 1), got {}",
                self.validation_fraction
            )));
        }
        Ok(())
    }
}

/// Per-class counts after splitting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSplit {
    pub class_name: String,
    pub training: usize,
    pub validation: usize,
}

/// The two disjoint subsets
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub training: Vec<LabeledImage>,
    pub validation: Vec<LabeledImage>,
    pub per_class: Vec<ClassSplit>,
}

impl DatasetSplit {
    /// Split every class of `directory`
    pub fn from_directory(directory: &FundusDirectory, config: SplitConfig) -> Result<Self> {
        config.validate()?;

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut training = Vec::new();
        let mut validation = Vec::new();
        let mut per_class = Vec::with_capacity(directory.num_classes());

        for (label, files) in directory.files_by_class.iter().enumerate() {
            let mut shuffled = files.clone();
            shuffled.sort();
            shuffled.shuffle(&mut rng);

            let n_val = validation_count(shuffled.len(), config.validation_fraction);
            let (val_paths, train_paths) = shuffled.split_at(n_val);

            validation.extend(val_paths.iter().map(|p| LabeledImage {
                path: p.clone(),
                label,
            }));
            training.extend(train_paths.iter().map(|p| LabeledImage {
                path: p.clone(),
                label,
            }));

            let class_name = directory.classes.name(label).unwrap_or_default().to_string();
            if n_val == 0 {
                warn!(
                    "Class '{}' has {} images; none were held out for validation",
                    class_name,
                    files.len()
                );
            }
            per_class.push(ClassSplit {
                class_name,
                training: train_paths.len(),
                validation: val_paths.len(),
            });
        }

        let split = Self {
            training,
            validation,
            per_class,
        };
        split.check_disjoint()?;

        if split.validation.is_empty() {
            return Err(EyeConditionError::Dataset(
                "validation subset is empty; add images or raise the validation split".into(),
            ));
        }
        if split.training.is_empty() {
            return Err(EyeConditionError::Dataset("training subset is empty".into()));
        }

        Ok(split)
    }

    /// Error when any path appears in both subsets
    pub fn check_disjoint(&self) -> Result<()> {
        let train_paths: HashSet<_> = self.training.iter().map(|img| &img.path).collect();
        let overlap = self
            .validation
            .iter()
            .filter(|img| train_paths.contains(&img.path))
            .count();
        if overlap > 0 {
            return Err(EyeConditionError::Dataset(format!(
                "{} images appear in both the training and validation subsets",
                overlap
            )));
        }
        Ok(())
    }

    /// Classes that contributed nothing to validation
    pub fn classes_without_validation(&self) -> Vec<&str> {
        self.per_class
            .iter()
            .filter(|c| c.validation == 0)
            .map(|c| c.class_name.as_str())
            .collect()
    }
}

/// `floor(n * fraction)`
pub fn validation_count(n: usize, fraction: f64) -> usize {
    ((n as f64) * fraction).floor() as usize
}
