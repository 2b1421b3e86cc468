//! Layer table printed before training starts.

use std::fmt;

use burn::module::Module;
use burn::prelude::*;

use crate::model::backbone::FEATURE_DIM;
use crate::model::classifier::{EyeConditionCnn, MODEL_NAME};
use crate::utils::format_count;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSummary {
    pub name: String,
    pub kind: String,
    pub output_shape: String,
    pub params: usize,
}

/// Per-layer output shapes and parameter counts
#[derive(Debug, Clone)]
pub struct ModelSummary {
    pub name: String,
    pub layers: Vec<LayerSummary>,
    pub trainable: usize,
    pub non_trainable: usize,
}

impl ModelSummary {
    pub fn from_model<B: Backend>(model: &EyeConditionCnn<B>, image_size: [u32; 2]) -> Self {
        let [height, width] = image_size;
        let units = model.feature_vector.weight.val().dims()[1];
        let classes = model.num_classes();

        let layer = |name: &str, kind: &str, shape: String, params: usize| LayerSummary {
            name: name.to_string(),
            kind: kind.to_string(),
            output_shape: shape,
            params,
        };

        let layers = vec![
            layer("input", "Input", format!("[B, 3, {}, {}]", height, width), 0),
            layer("preprocess", "ImageNetNormalize", format!("[B, 3, {}, {}]", height, width), 0),
            layer(
                "efficientnetb0",
                "EfficientNetBackbone",
                format!("[B, {}]", FEATURE_DIM),
                model.backbone.num_params(),
            ),
            layer(
                "feature_vector",
                "Linear+ReLU",
                format!("[B, {}]", units),
                model.feature_vector.num_params(),
            ),
            layer("dropout", "Dropout", format!("[B, {}]", units), 0),
            layer(
                "predictions",
                "Linear+Softmax",
                format!("[B, {}]", classes),
                model.predictions.num_params(),
            ),
        ];

        Self {
            name: MODEL_NAME.to_string(),
            layers,
            trainable: model.trainable_params(),
            non_trainable: model.frozen_params(),
        }
    }

    pub fn total_params(&self) -> usize {
        self.trainable + self.non_trainable
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "─".repeat(78);
        writeln!(f, "Model: \"{}\"", self.name)?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "{:<40} {:<22} {:>14}", "Layer (type)", "Output Shape", "Param #")?;
        writeln!(f, "{}", rule)?;
        for layer in &self.layers {
            writeln!(
                f,
                "{:<40} {:<22} {:>14}",
                format!("{} ({})", layer.name, layer.kind),
                layer.output_shape,
                format_count(layer.params)
            )?;
        }
        writeln!(f, "{}", rule)?;
        writeln!(f, " Total params: {}", format_count(self.total_params()))?;
        writeln!(f, " Trainable params: {}", format_count(self.trainable))?;
        write!(f, " Non-trainable params: {}", format_count(self.non_trainable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::classifier::EyeConditionCnnConfig;
    use burn::backend::NdArray;

    #[test]
    fn test_summary_counts() {
        let device = Default::default();
        let model = EyeConditionCnnConfig::new(4).init::<NdArray>(&device);
        let summary = ModelSummary::from_model(&model, [224, 224]);

        let layer_total: usize = summary.layers.iter().map(|l| l.params).sum();
        assert_eq!(layer_total, summary.total_params());
        assert_eq!(summary.trainable, 1280 * 256 + 256 + 256 * 4 + 4);

        let text = summary.to_string();
        assert!(text.contains("feature_vector"));
        assert!(text.contains("[B, 4]"));
        assert!(text.contains("Trainable params: 328,964"));
    }
}
