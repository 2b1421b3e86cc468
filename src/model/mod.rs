//! Model module for the eye-condition classifier using the Burn framework
//!
//! - `backbone`: EfficientNet-B0 feature extractor (frozen during training)
//! - `classifier`: the full network with its trainable head
//! - `pretrained`: ImageNet weights from PyTorch safetensors exports
//! - `summary`: layer and parameter table

pub mod backbone;
pub mod classifier;
pub mod pretrained;
pub mod summary;

pub use backbone::{EfficientNetBackbone, EfficientNetConfig, WeightSlot, FEATURE_DIM};
pub use classifier::{EyeConditionCnn, EyeConditionCnnConfig, MODEL_NAME};
pub use pretrained::{PretrainedWeights, WeightLayout};
pub use summary::ModelSummary;
