//! Training and validation sequences built from a dataset root.

use colored::Colorize;
use tracing::info;

use crate::config::DataConfig;
use crate::dataset::augmentation::{AugmentationConfig, Augmenter};
use crate::dataset::burn_dataset::{FundusBatcher, FundusDataset};
use crate::dataset::loader::{ClassIndex, FundusDirectory};
use crate::dataset::split::{DatasetSplit, SplitConfig};
use crate::utils::error::Result;

/// The two subsets of one dataset root plus the class mapping
#[derive(Debug, Clone)]
pub struct DatasetGenerators {
    pub classes: ClassIndex,
    /// Augmented
    pub training: FundusDataset,
    pub validation: FundusDataset,
    pub split: DatasetSplit,
}

impl DatasetGenerators {
    /// Scan `data.root`, split it, and wrap both halves as Burn datasets
    pub fn from_directory(
        data: &DataConfig,
        augmentation: &AugmentationConfig,
        seed: u64,
    ) -> Result<Self> {
        let directory = FundusDirectory::scan(&data.root)?;
        let split = DatasetSplit::from_directory(
            &directory,
            SplitConfig {
                validation_fraction: data.validation_split,
                seed,
            },
        )?;

        let training = FundusDataset::new(split.training.clone(), data.image_size)
            .with_augmentation(Augmenter::new(augmentation.clone()), seed);
        let validation = FundusDataset::new(split.validation.clone(), data.image_size);

        info!(
            "Split {} images into {} training / {} validation",
            directory.total_images(),
            split.training.len(),
            split.validation.len()
        );

        Ok(Self {
            classes: directory.classes,
            training,
            validation,
            split,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn batcher(&self) -> FundusBatcher {
        FundusBatcher::new(self.num_classes(), self.training.image_size())
    }

    /// Batches per pass over the training subset
    pub fn steps_per_epoch(&self, batch_size: usize) -> usize {
        self.split.training.len().div_ceil(batch_size)
    }

    /// Batches per pass over the validation subset
    pub fn validation_steps(&self, batch_size: usize) -> usize {
        self.split.validation.len().div_ceil(batch_size)
    }

    /// Print the subset sizes and the class mapping
    pub fn print_summary(&self) {
        let k = self.num_classes();
        println!(
            "Found {} images belonging to {} classes.",
            self.split.training.len(),
            k
        );
        println!(
            "Found {} images belonging to {} classes.",
            self.split.validation.len(),
            k
        );
        println!("{} {}", "Classes:".cyan().bold(), self.classes);

        let missing = self.split.classes_without_validation();
        if !missing.is_empty() {
            println!(
                "{} no validation images for: {}",
                "Warning:".yellow(),
                missing.join(", ")
            );
        }
    }

    /// Per-class split table for the `classes` subcommand
    pub fn print_split_table(&self) {
        println!("{}", "Split per class:".cyan().bold());
        println!("  {:>5}  {:<28} {:>8} {:>10}", "index", "class", "train", "validation");
        for (label, class) in self.split.per_class.iter().enumerate() {
            println!(
                "  {:>5}  {:<28} {:>8} {:>10}",
                label, class.class_name, class.training, class.validation
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::loader::tests::write_class;

    #[test]
    fn test_generators_from_directory() {
        let root = tempfile::tempdir().unwrap();
        write_class(root.path(), "Healthy", 10);
        write_class(root.path(), "Glaucoma", 5);
        write_class(root.path(), "Myopia", 5);

        let data = DataConfig {
            root: root.path().to_path_buf(),
            image_size: [32, 32],
            validation_split: 0.2,
        };
        let generators =
            DatasetGenerators::from_directory(&data, &AugmentationConfig::default(), 42).unwrap();

        assert_eq!(generators.num_classes(), 3);
        assert_eq!(generators.classes.names(), &["Glaucoma", "Healthy", "Myopia"]);
        assert!(generators.training.is_augmented());
        assert!(!generators.validation.is_augmented());
        assert_eq!(generators.split.validation.len(), 4);
        assert_eq!(generators.steps_per_epoch(4), 4);
        assert_eq!(generators.validation_steps(32), 1);
    }

    #[test]
    fn test_missing_root_fails() {
        let data = DataConfig {
            root: "/no/such/fundus/root".into(),
            ..DataConfig::default()
        };
        assert!(DatasetGenerators::from_directory(&data, &AugmentationConfig::none(), 42).is_err());
    }
}
