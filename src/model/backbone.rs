//! EfficientNet-B0 feature extractor.
//!
//! The network stops after global average pooling and returns a
//! 1280-dimensional feature vector per image. There is no classification
//! layer; the eye-condition head sits on top of it.
//!
//! Architecture:
//! - Stem: Conv 3x3 (32), stride 2
//! - 16 MBConv blocks in 7 stages with squeeze-and-excitation
//! - Head: Conv 1x1 (1280)
//! - Global average pooling
//!
//! ImageNet weights come from a torchvision or timm `.safetensors` export
//! (see [`crate::model::pretrained`]); a Burn record of this exact layout
//! is accepted too.

use std::path::Path;

use burn::module::{Module, Param, RunningState};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::activation::{sigmoid, silu};
use tracing::info;

use crate::model::pretrained::{ConvBnKeys, MbConvKeys, PretrainedWeights, WeightLayout};
use crate::utils::error::{self, EyeConditionError};

/// Width of the pooled feature vector
pub const FEATURE_DIM: usize = 1280;

/// `(expand ratio, kernel, stride, output channels, repeats)` per stage
const B0_STAGES: [(usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 16, 1),
    (6, 3, 2, 24, 2),
    (6, 5, 2, 40, 2),
    (6, 3, 2, 80, 3),
    (6, 5, 1, 112, 3),
    (6, 5, 2, 192, 4),
    (6, 3, 1, 320, 1),
];

const STEM_CHANNELS: usize = 32;
const SE_RATIO: f64 = 0.25;

/// One backbone tensor, borrowed mutably while walking a pretrained layout
pub enum WeightSlot<'a, B: Backend> {
    Kernel(&'a mut Param<Tensor<B, 4>>),
    Vector(&'a mut Param<Tensor<B, 1>>),
    Running(&'a mut RunningState<Tensor<B, 1>>),
}

/// Callback receiving each tensor name of a layout with its slot
pub type SlotVisitor<'v, B> = dyn FnMut(&str, WeightSlot<'_, B>) -> error::Result<()> + 'v;

fn visit_conv<B: Backend>(
    conv: &mut Conv2d<B>,
    prefix: &str,
    visit: &mut SlotVisitor<'_, B>,
) -> error::Result<()> {
    visit(&format!("{prefix}.weight"), WeightSlot::Kernel(&mut conv.weight))?;
    if let Some(bias) = conv.bias.as_mut() {
        visit(&format!("{prefix}.bias"), WeightSlot::Vector(bias))?;
    }
    Ok(())
}

/// Convolution followed by batch normalisation
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let pad = (kernel - 1) / 2;
        let conv = Conv2dConfig::new(channels, [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(channels[1]).init(device);
        Self { conv, bn }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }

    pub fn conv_weight(&self) -> Tensor<B, 4> {
        self.conv.weight.val()
    }

    fn forward_silu(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        silu(self.forward(x))
    }

    fn visit_pretrained(
        &mut self,
        keys: &ConvBnKeys,
        visit: &mut SlotVisitor<'_, B>,
    ) -> error::Result<()> {
        visit_conv(&mut self.conv, &keys.conv, visit)?;
        let bn = &keys.bn;
        visit(&format!("{bn}.weight"), WeightSlot::Vector(&mut self.bn.gamma))?;
        visit(&format!("{bn}.bias"), WeightSlot::Vector(&mut self.bn.beta))?;
        visit(
            &format!("{bn}.running_mean"),
            WeightSlot::Running(&mut self.bn.running_mean),
        )?;
        visit(
            &format!("{bn}.running_var"),
            WeightSlot::Running(&mut self.bn.running_var),
        )
    }
}

/// Channel attention: pool, reduce, expand, gate
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(channels: usize, squeezed: usize, device: &B::Device) -> Self {
        Self {
            reduce: Conv2dConfig::new([channels, squeezed], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeezed, channels], [1, 1]).init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(x.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        x * scale
    }
}

/// Mobile inverted bottleneck block
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    se: SqueezeExcite<B>,
    project: ConvBn<B>,
    residual: bool,
}

impl<B: Backend> MbConv<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand =
            (expand_ratio != 1).then(|| ConvBn::new([in_channels, hidden], 1, 1, 1, device));
        let depthwise = ConvBn::new([hidden, hidden], kernel, stride, hidden, device);
        let squeezed = ((in_channels as f64 * SE_RATIO) as usize).max(1);
        let se = SqueezeExcite::new(hidden, squeezed, device);
        let project = ConvBn::new([hidden, out_channels], 1, 1, 1, device);

        Self {
            expand,
            depthwise,
            se,
            project,
            residual: stride == 1 && in_channels == out_channels,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward_silu(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward_silu(x);
        let x = self.se.forward(x);
        let x = self.project.forward(x);

        if self.residual {
            x + input
        } else {
            x
        }
    }

    fn visit_pretrained(
        &mut self,
        keys: &MbConvKeys,
        visit: &mut SlotVisitor<'_, B>,
    ) -> error::Result<()> {
        if let (Some(expand), Some(expand_keys)) = (self.expand.as_mut(), keys.expand.as_ref()) {
            expand.visit_pretrained(expand_keys, visit)?;
        }
        self.depthwise.visit_pretrained(&keys.depthwise, visit)?;
        visit_conv(&mut self.se.reduce, &keys.se_reduce, visit)?;
        visit_conv(&mut self.se.expand, &keys.se_expand, visit)?;
        self.project.visit_pretrained(&keys.project, visit)
    }
}

/// Configuration for [`EfficientNetBackbone`]
#[derive(Config, Debug)]
pub struct EfficientNetConfig {
    #[config(default = 3)]
    pub in_channels: usize,
}

impl EfficientNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNetBackbone<B> {
        let stem = ConvBn::new([self.in_channels, STEM_CHANNELS], 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut channels = STEM_CHANNELS;
        for (expand_ratio, kernel, stride, out_channels, repeats) in B0_STAGES {
            for i in 0..repeats {
                let block_stride = if i == 0 { stride } else { 1 };
                blocks.push(MbConv::new(
                    channels,
                    out_channels,
                    expand_ratio,
                    kernel,
                    block_stride,
                    device,
                ));
                channels = out_channels;
            }
        }

        let head = ConvBn::new([channels, FEATURE_DIM], 1, 1, 1, device);

        EfficientNetBackbone {
            stem,
            blocks,
            head,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }
}

/// EfficientNet-B0 without its classifier, pooled to `[batch, 1280]`
#[derive(Module, Debug)]
pub struct EfficientNetBackbone<B: Backend> {
    pub stem: ConvBn<B>,
    pub blocks: Vec<MbConv<B>>,
    pub head: ConvBn<B>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> EfficientNetBackbone<B> {
    /// `[batch, 3, H, W]` normalised images to `[batch, 1280]` features
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem.forward_silu(images);
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.head.forward_silu(x);
        let x = self.pool.forward(x);

        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }

    /// Hand every tensor to `visit` under its name in `layout`
    pub fn visit_pretrained(
        &mut self,
        layout: WeightLayout,
        visit: &mut SlotVisitor<'_, B>,
    ) -> error::Result<()> {
        self.stem.visit_pretrained(&layout.stem(), visit)?;

        let mut blocks = self.blocks.iter_mut();
        for (stage, &(_, _, _, _, repeats)) in B0_STAGES.iter().enumerate() {
            for index in 0..repeats {
                let block = blocks.next().ok_or_else(|| {
                    EyeConditionError::Model("backbone has fewer blocks than EfficientNet-B0".into())
                })?;
                let keys = layout.block(stage, index, block.expand.is_some());
                block.visit_pretrained(&keys, visit)?;
            }
        }

        self.head.visit_pretrained(&layout.head(), visit)
    }

    /// Copy ImageNet weights into every layer; any missing tensor or shape
    /// mismatch is an error
    pub fn load_pretrained(
        mut self,
        weights: &PretrainedWeights,
        device: &B::Device,
    ) -> error::Result<Self> {
        let mut copied = 0usize;
        self.visit_pretrained(weights.layout(), &mut |key: &str, slot: WeightSlot<'_, B>| -> error::Result<()> {
            match slot {
                WeightSlot::Kernel(param) => {
                    let shape = param.val().dims();
                    *param = Param::from_tensor(weights.tensor(key, shape, device)?);
                }
                WeightSlot::Vector(param) => {
                    let shape = param.val().dims();
                    *param = Param::from_tensor(weights.tensor(key, shape, device)?);
                }
                WeightSlot::Running(state) => {
                    let shape = state.value().dims();
                    *state = RunningState::new(weights.tensor(key, shape, device)?);
                }
            }
            copied += 1;
            Ok(())
        })?;

        info!(
            "Loaded {} pretrained tensors into the backbone from {:?}",
            copied,
            weights.source()
        );
        Ok(self)
    }

    /// Load a `.safetensors` ImageNet export or a Burn record of this layout
    pub fn load_any(self, path: &Path, device: &B::Device) -> error::Result<Self> {
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            let weights = PretrainedWeights::from_file(path)?;
            self.load_pretrained(&weights, device)
        } else {
            self.load_weights(path, device)
        }
    }

    /// Replace all weights with the record stored at `path`
    pub fn load_weights(self, path: &Path, device: &B::Device) -> error::Result<Self> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let loaded = self
            .load_file(path.to_path_buf(), &recorder, device)
            .map_err(|e| {
                EyeConditionError::Model(format!(
                    "failed to load backbone weights from {}: {:?}",
                    path.display(),
                    e
                ))
            })?;
        info!("Loaded backbone weights from {:?}", path);
        Ok(loaded)
    }

    /// Write the current weights in the format read by [`Self::load_weights`]
    pub fn save_weights(&self, path: &Path) -> error::Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|e| {
                EyeConditionError::Model(format!(
                    "failed to save backbone weights to {}: {:?}",
                    path.display(),
                    e
                ))
            })
    }
}
