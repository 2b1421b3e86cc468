//! Eye-condition classifier: frozen backbone plus a trainable head.
//!
//! ```text
//! images [B, 3, H, W] in [0, 1]
//!   → ImageNet normalisation
//!   → EfficientNet-B0 backbone (frozen)      [B, 1280]
//!   → feature_vector: Dense 256 + ReLU        [B, 256]
//!   → Dropout 0.3 (training only)
//!   → predictions: Dense N + softmax          [B, N]
//! ```

use std::path::Path;

use burn::module::{AutodiffModule, Module};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, softmax};
use burn::tensor::backend::AutodiffBackend;
use tracing::{info, warn};

use crate::model::backbone::{EfficientNetBackbone, EfficientNetConfig, FEATURE_DIM};
use crate::utils::error::{self, EyeConditionError};

/// Per-channel ImageNet statistics expected by the backbone
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Name the network is exported under
pub const MODEL_NAME: &str = "eye_condition_cnn";

/// Configuration for the classifier
#[derive(Config, Debug)]
pub struct EyeConditionCnnConfig {
    /// Number of output classes (at least 2)
    pub num_classes: usize,
    /// Width of the reusable embedding layer
    #[config(default = 256)]
    pub feature_units: usize,
    #[config(default = 0.3)]
    pub dropout: f64,
}

impl EyeConditionCnnConfig {
    /// Build the network with a randomly initialised, frozen backbone
    pub fn init<B: Backend>(&self, device: &B::Device) -> EyeConditionCnn<B> {
        let backbone = EfficientNetConfig::new().init(device).no_grad();

        EyeConditionCnn {
            backbone,
            feature_vector: LinearConfig::new(FEATURE_DIM, self.feature_units).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            predictions: LinearConfig::new(self.feature_units, self.num_classes).init(device),
            num_classes: self.num_classes,
        }
    }

    pub fn validate(&self) -> error::Result<()> {
        if self.num_classes < 2 {
            return Err(EyeConditionError::Model(format!(
                "at least 2 classes are required, found {}",
                self.num_classes
            )));
        }
        Ok(())
    }
}

/// Transfer-learning classifier for fundus images
#[derive(Module, Debug)]
pub struct EyeConditionCnn<B: Backend> {
    pub backbone: EfficientNetBackbone<B>,
    /// Embedding layer reused by the frontend
    pub feature_vector: Linear<B>,
    pub dropout: Dropout,
    pub predictions: Linear<B>,
    num_classes: usize,
}

/// Map `[0, 1]` pixels to the backbone's input distribution
pub fn imagenet_normalize<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let mean = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]), &device);
    let std = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]), &device);
    (images - mean) / std
}

impl<B: Backend> EyeConditionCnn<B> {
    /// Load pretrained backbone weights and keep the backbone frozen.
    ///
    /// `weights` is a torchvision/timm `.safetensors` export or a Burn
    /// record of the backbone. `None` keeps the random initialisation.
    pub fn with_backbone_weights(mut self, weights: Option<&Path>, device: &B::Device) -> error::Result<Self> {
        match weights {
            Some(path) => {
                self.backbone = self.backbone.load_any(path, device)?.no_grad();
            }
            None => {
                warn!(
                    "Training on a randomly initialised backbone; features will not be ImageNet features"
                );
            }
        }
        Ok(self)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Pooled backbone features, `[batch, 1280]`
    pub fn backbone_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.backbone.forward(imagenet_normalize(images))
    }

    fn head(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = relu(self.feature_vector.forward(features));
        let x = self.dropout.forward(x);
        self.predictions.forward(x)
    }

    /// Unnormalised class scores, `[batch, num_classes]`
    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head(self.backbone_features(images))
    }

    /// Class probabilities; each row sums to 1
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward_logits(images), 1)
    }

    /// Output of the `feature_vector` layer, `[batch, feature_units]`
    pub fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        relu(self.feature_vector.forward(self.backbone_features(images)))
    }

    /// Parameters updated by the optimiser
    pub fn trainable_params(&self) -> usize {
        self.feature_vector.num_params() + self.predictions.num_params()
    }

    /// Parameters of the frozen backbone
    pub fn frozen_params(&self) -> usize {
        self.backbone.num_params()
    }
}

impl<B: AutodiffBackend> EyeConditionCnn<B> {
    /// Training-mode logits.
    ///
    /// The backbone runs on the inner backend: no gradient reaches it and
    /// its batch-norm statistics stay fixed. Dropout in the head is active.
    pub fn forward_training(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let backbone = self.backbone.valid();
        let features = backbone.forward(imagenet_normalize(images.inner()));
        self.head(Tensor::from_inner(features))
    }
}

/// Log the trainable / frozen parameter split
pub fn log_parameter_split<B: Backend>(model: &EyeConditionCnn<B>) {
    info!(
        "Parameters: {} trainable, {} frozen",
        model.trainable_params(),
        model.frozen_params()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    #[test]
    fn test_config_defaults() {
        let config = EyeConditionCnnConfig::new(4);
        assert_eq!(config.feature_units, 256);
        assert_eq!(config.dropout, 0.3);
        assert!(config.validate().is_ok());
        assert!(EyeConditionCnnConfig::new(1).validate().is_err());
    }

    #[test]
    fn test_forward_shapes_and_softmax() {
        let device = Default::default();
        let model = EyeConditionCnnConfig::new(4).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let probs = model.forward(images.clone());
        assert_eq!(probs.dims(), [2, 4]);
        let sums = probs.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-4);
        }

        let embedding = model.embed(images);
        assert_eq!(embedding.dims(), [2, 256]);
        let values = embedding.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_parameter_split() {
        let device = Default::default();
        let model = EyeConditionCnnConfig::new(4).init::<TestBackend>(&device);
        assert_eq!(model.trainable_params(), (1280 * 256 + 256) + (256 * 4 + 4));
        assert_eq!(model.frozen_params(), model.backbone.num_params());
        assert_eq!(model.num_classes(), 4);
    }

    #[test]
    fn test_normalize_zero_image() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 1, 1], &device);
        let values = imagenet_normalize(images).into_data().to_vec::<f32>().unwrap();
        assert!((values[0] + 0.485 / 0.229).abs() < 1e-5);
        assert!((values[2] + 0.406 / 0.225).abs() < 1e-5);
    }

    #[test]
    fn test_backbone_receives_no_gradient() {
        let device = Default::default();
        let model = EyeConditionCnnConfig::new(3).init::<TestAutodiffBackend>(&device);
        let images = Tensor::<TestAutodiffBackend, 4>::ones([2, 3, 32, 32], &device);

        let loss = model.forward_training(images).sum();
        let grads = loss.backward();

        assert!(model.backbone.stem.conv_weight().grad(&grads).is_none());
        assert!(model.predictions.weight.val().grad(&grads).is_some());
    }

    #[test]
    fn test_imagenet_export_reaches_the_frozen_backbone() {
        use crate::model::backbone::tests::write_pytorch_export;
        use crate::model::pretrained::WeightLayout;

        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("efficientnet_b0.safetensors");
        let source = EfficientNetConfig::new().init::<TestBackend>(&device);
        write_pytorch_export(&source, WeightLayout::Torchvision, &path);

        let model = EyeConditionCnnConfig::new(3)
            .init::<TestAutodiffBackend>(&device)
            .with_backbone_weights(Some(&path), &device)
            .unwrap();

        let loaded = model.backbone.stem.conv_weight().inner();
        assert_eq!(
            loaded.into_data().to_vec::<f32>().unwrap(),
            source.stem.conv_weight().into_data().to_vec::<f32>().unwrap()
        );

        // still frozen after the weights were replaced
        let images = Tensor::<TestAutodiffBackend, 4>::ones([1, 3, 32, 32], &device);
        let grads = model.forward_training(images).sum().backward();
        assert!(model.backbone.stem.conv_weight().grad(&grads).is_none());
    }

    #[test]
    fn test_missing_backbone_weights_warns_only() {
        let device = Default::default();
        let model = EyeConditionCnnConfig::new(3)
            .init::<TestBackend>(&device)
            .with_backbone_weights(None, &device);
        assert!(model.is_ok());
    }
}
