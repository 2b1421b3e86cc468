//! ImageNet weights published for PyTorch.
//!
//! Reads an EfficientNet-B0 `.safetensors` export, either torchvision's
//! (`features.*`) or timm's (`conv_stem`, `blocks.*`, `conv_head`), and
//! hands the tensors out under the names the backbone asks for. Classifier
//! entries and batch-norm counters in the file are never requested.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use bytemuck::pod_collect_to_vec;
use half::{bf16, f16};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::utils::error::{EyeConditionError, Result};

/// Naming scheme of a PyTorch EfficientNet-B0 state dict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// `torchvision.models.efficientnet_b0`
    Torchvision,
    /// `timm` `efficientnet_b0`
    Timm,
}

/// Tensor prefixes of one convolution and its batch norm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvBnKeys {
    pub conv: String,
    pub bn: String,
}

impl ConvBnKeys {
    fn new(conv: impl Into<String>, bn: impl Into<String>) -> Self {
        Self {
            conv: conv.into(),
            bn: bn.into(),
        }
    }
}

/// Tensor prefixes of one MBConv block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbConvKeys {
    pub expand: Option<ConvBnKeys>,
    pub depthwise: ConvBnKeys,
    pub se_reduce: String,
    pub se_expand: String,
    pub project: ConvBnKeys,
}

impl WeightLayout {
    /// Recognise the layout from the stem tensor name
    pub fn detect<'a>(mut names: impl Iterator<Item = &'a str>) -> Option<Self> {
        names.find_map(|name| match name {
            "features.0.0.weight" => Some(Self::Torchvision),
            "conv_stem.weight" => Some(Self::Timm),
            _ => None,
        })
    }

    pub fn stem(self) -> ConvBnKeys {
        match self {
            Self::Torchvision => ConvBnKeys::new("features.0.0", "features.0.1"),
            Self::Timm => ConvBnKeys::new("conv_stem", "bn1"),
        }
    }

    pub fn head(self) -> ConvBnKeys {
        match self {
            Self::Torchvision => ConvBnKeys::new("features.8.0", "features.8.1"),
            Self::Timm => ConvBnKeys::new("conv_head", "bn2"),
        }
    }

    /// Keys of block `index` within `stage` (both 0-based)
    pub fn block(self, stage: usize, index: usize, expands: bool) -> MbConvKeys {
        match self {
            Self::Torchvision => {
                let p = format!("features.{}.{}.block", stage + 1, index);
                let offset = usize::from(expands);
                MbConvKeys {
                    expand: expands.then(|| ConvBnKeys::new(format!("{p}.0.0"), format!("{p}.0.1"))),
                    depthwise: ConvBnKeys::new(
                        format!("{p}.{offset}.0"),
                        format!("{p}.{offset}.1"),
                    ),
                    se_reduce: format!("{p}.{}.fc1", offset + 1),
                    se_expand: format!("{p}.{}.fc2", offset + 1),
                    project: ConvBnKeys::new(
                        format!("{p}.{}.0", offset + 2),
                        format!("{p}.{}.1", offset + 2),
                    ),
                }
            }
            Self::Timm => {
                let p = format!("blocks.{}.{}", stage, index);
                if expands {
                    MbConvKeys {
                        expand: Some(ConvBnKeys::new(format!("{p}.conv_pw"), format!("{p}.bn1"))),
                        depthwise: ConvBnKeys::new(format!("{p}.conv_dw"), format!("{p}.bn2")),
                        se_reduce: format!("{p}.se.conv_reduce"),
                        se_expand: format!("{p}.se.conv_expand"),
                        project: ConvBnKeys::new(format!("{p}.conv_pwl"), format!("{p}.bn3")),
                    }
                } else {
                    MbConvKeys {
                        expand: None,
                        depthwise: ConvBnKeys::new(format!("{p}.conv_dw"), format!("{p}.bn1")),
                        se_reduce: format!("{p}.se.conv_reduce"),
                        se_expand: format!("{p}.se.conv_expand"),
                        project: ConvBnKeys::new(format!("{p}.conv_pw"), format!("{p}.bn2")),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredTensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

/// Float tensors of a `.safetensors` file, decoded to `f32`
#[derive(Debug, Clone)]
pub struct PretrainedWeights {
    source: PathBuf,
    layout: WeightLayout,
    tensors: HashMap<String, StoredTensor>,
}

impl PretrainedWeights {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            EyeConditionError::Model(format!(
                "cannot read pretrained weights {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_bytes(&bytes, path)
    }

    /// Decode an in-memory file; `source` is only used in messages
    pub fn from_bytes(bytes: &[u8], source: &Path) -> Result<Self> {
        let file = SafeTensors::deserialize(bytes).map_err(|e| {
            EyeConditionError::Model(format!(
                "{} is not a safetensors file: {:?}",
                source.display(),
                e
            ))
        })?;

        let layout = WeightLayout::detect(file.names().into_iter().map(String::as_str))
            .ok_or_else(|| {
                EyeConditionError::Model(format!(
                    "{} is not an EfficientNet-B0 export from torchvision or timm",
                    source.display()
                ))
            })?;

        let mut tensors = HashMap::new();
        for (name, view) in file.tensors() {
            let data = view.data();
            let values: Vec<f32> = match view.dtype() {
                Dtype::F32 => pod_collect_to_vec::<u8, f32>(data),
                Dtype::F16 => pod_collect_to_vec::<u8, u16>(data)
                    .into_iter()
                    .map(|bits| f16::from_bits(bits).to_f32())
                    .collect(),
                Dtype::BF16 => pod_collect_to_vec::<u8, u16>(data)
                    .into_iter()
                    .map(|bits| bf16::from_bits(bits).to_f32())
                    .collect(),
                other => {
                    debug!("Skipping tensor {} with dtype {:?}", name, other);
                    continue;
                }
            };
            tensors.insert(
                name,
                StoredTensor {
                    shape: view.shape().to_vec(),
                    values,
                },
            );
        }

        info!(
            "Read {} float tensors ({:?} layout) from {:?}",
            tensors.len(),
            layout,
            source
        );
        Ok(Self {
            source: source.to_path_buf(),
            layout,
            tensors,
        })
    }

    pub fn layout(&self) -> WeightLayout {
        self.layout
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor `key`, which must have exactly `shape`
    pub fn tensor<B: Backend, const D: usize>(
        &self,
        key: &str,
        shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        let stored = self.tensors.get(key).ok_or_else(|| {
            EyeConditionError::Model(format!(
                "{} has no tensor named {}",
                self.source.display(),
                key
            ))
        })?;
        if stored.shape.as_slice() != shape.as_slice() {
            return Err(EyeConditionError::Model(format!(
                "{}: {} has shape {:?}, the backbone expects {:?}",
                self.source.display(),
                key,
                stored.shape,
                shape
            )));
        }
        Ok(Tensor::from_floats(
            TensorData::new(stored.values.clone(), shape),
            device,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use safetensors::tensor::TensorView;

    type TestBackend = NdArray;

    fn write(path: &Path, entries: &[(&str, Dtype, Vec<usize>, Vec<u8>)]) {
        let views: HashMap<String, TensorView> = entries
            .iter()
            .map(|(name, dtype, shape, bytes)| {
                (
                    name.to_string(),
                    TensorView::new(*dtype, shape.clone(), bytes).unwrap(),
                )
            })
            .collect();
        safetensors::serialize_to_file(&views, &None, path).unwrap();
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    #[test]
    fn test_torchvision_block_keys() {
        let first = WeightLayout::Torchvision.block(0, 0, false);
        assert!(first.expand.is_none());
        assert_eq!(first.depthwise.conv, "features.1.0.block.0.0");
        assert_eq!(first.se_reduce, "features.1.0.block.1.fc1");
        assert_eq!(first.project.bn, "features.1.0.block.2.1");

        let later = WeightLayout::Torchvision.block(5, 3, true);
        assert_eq!(later.expand.unwrap().conv, "features.6.3.block.0.0");
        assert_eq!(later.depthwise.bn, "features.6.3.block.1.1");
        assert_eq!(later.se_expand, "features.6.3.block.2.fc2");
        assert_eq!(later.project.conv, "features.6.3.block.3.0");
    }

    #[test]
    fn test_timm_block_keys() {
        let first = WeightLayout::Timm.block(0, 0, false);
        assert_eq!(first.depthwise.conv, "blocks.0.0.conv_dw");
        assert_eq!(first.project.conv, "blocks.0.0.conv_pw");
        assert_eq!(first.project.bn, "blocks.0.0.bn2");

        let later = WeightLayout::Timm.block(2, 1, true);
        assert_eq!(later.expand.unwrap().bn, "blocks.2.1.bn1");
        assert_eq!(later.project.conv, "blocks.2.1.conv_pwl");
        assert_eq!(later.se_reduce, "blocks.2.1.se.conv_reduce");
        assert_eq!(WeightLayout::Timm.head().bn, "bn2");
    }

    #[test]
    fn test_detect_layout() {
        let names = ["classifier.1.weight", "features.0.0.weight"];
        assert_eq!(
            WeightLayout::detect(names.into_iter()),
            Some(WeightLayout::Torchvision)
        );
        assert_eq!(
            WeightLayout::detect(["conv_stem.weight"].into_iter()),
            Some(WeightLayout::Timm)
        );
        assert_eq!(WeightLayout::detect(["fc.weight"].into_iter()), None);
    }

    #[test]
    fn test_half_precision_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b0.safetensors");
        let halves: Vec<u16> = [0.5f32, -2.0, 1.25]
            .iter()
            .map(|&v| f16::from_f32(v).to_bits())
            .collect();
        write(
            &path,
            &[
                ("conv_stem.weight", Dtype::F32, vec![1, 1, 1, 2], f32_bytes(&[1.0, 2.0])),
                ("bn1.weight", Dtype::F16, vec![3], bytemuck::cast_slice(&halves).to_vec()),
                ("bn1.num_batches_tracked", Dtype::I64, vec![], 7i64.to_le_bytes().to_vec()),
            ],
        );

        let weights = PretrainedWeights::from_file(&path).unwrap();
        assert_eq!(weights.layout(), WeightLayout::Timm);
        assert_eq!(weights.len(), 2);

        let gamma = weights
            .tensor::<TestBackend, 1>("bn1.weight", [3], &Default::default())
            .unwrap();
        assert_eq!(
            gamma.into_data().to_vec::<f32>().unwrap(),
            vec![0.5, -2.0, 1.25]
        );
    }

    #[test]
    fn test_shape_mismatch_and_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b0.safetensors");
        write(
            &path,
            &[(
                "features.0.0.weight",
                Dtype::F32,
                vec![2, 1, 1, 1],
                f32_bytes(&[1.0, 2.0]),
            )],
        );
        let weights = PretrainedWeights::from_file(&path).unwrap();
        let device = Default::default();

        let wrong = weights.tensor::<TestBackend, 4>("features.0.0.weight", [1, 2, 1, 1], &device);
        assert!(matches!(wrong, Err(EyeConditionError::Model(_))));
        let missing = weights.tensor::<TestBackend, 1>("features.0.1.weight", [2], &device);
        assert!(matches!(missing, Err(EyeConditionError::Model(_))));
    }

    #[test]
    fn test_rejects_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("resnet.safetensors");
        write(&other, &[("fc.weight", Dtype::F32, vec![1], f32_bytes(&[0.0]))]);
        assert!(matches!(
            PretrainedWeights::from_file(&other),
            Err(EyeConditionError::Model(_))
        ));

        let garbage = dir.path().join("garbage.safetensors");
        fs::write(&garbage, b"not a tensor file").unwrap();
        assert!(PretrainedWeights::from_file(&garbage).is_err());
        assert!(PretrainedWeights::from_file(&dir.path().join("absent.safetensors")).is_err());
    }
}
