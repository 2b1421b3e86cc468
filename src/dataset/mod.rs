//! Dataset discovery, splitting, augmentation, and Burn integration
//!
//! - `loader`: class folder discovery and the class index
//! - `split`: seeded per-class training/validation split
//! - `augmentation`: random affine transforms for training images
//! - `burn_dataset`: Burn `Dataset` and `Batcher` implementations
//! - `generator`: wires the above into the two training sequences

pub mod augmentation;
pub mod burn_dataset;
pub mod generator;
pub mod loader;
pub mod split;

pub use augmentation::{AugmentationConfig, Augmenter, FillMode};
pub use burn_dataset::{FundusBatch, FundusBatcher, FundusDataset, FundusItem};
pub use generator::DatasetGenerators;
pub use loader::{ClassIndex, FundusDirectory, LabeledImage};
pub use split::{DatasetSplit, SplitConfig};
