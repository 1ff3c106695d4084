//! Small-image ResNet encoders.
//!
//! The stem is a 3x3 stride-1 convolution (no max pool), the variant commonly
//! used for 32-96 pixel inputs. Each encoder keeps its parameters in a
//! [`VarMap`] so callers can enumerate, snapshot, and overwrite them by name.

use candle_core::{DType, Device, Error, Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear,
    Module, ModuleT, VarBuilder, VarMap,
};

use crate::config::{resnet_expansion, EncoderConfig};

/// Ordered top-level stages of the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Conv1,
    Layer1,
    Layer2,
    Layer3,
    Layer4,
    AvgPool,
    Fc,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Conv1,
        Stage::Layer1,
        Stage::Layer2,
        Stage::Layer3,
        Stage::Layer4,
        Stage::AvgPool,
        Stage::Fc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Conv1 => "conv1",
            Stage::Layer1 => "layer1",
            Stage::Layer2 => "layer2",
            Stage::Layer3 => "layer3",
            Stage::Layer4 => "layer4",
            Stage::AvgPool => "avgpool",
            Stage::Fc => "fc",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Position in the ordered stage list.
    pub fn index(&self) -> usize {
        Stage::ALL.iter().position(|s| s == self).unwrap_or(0)
    }

    /// Resolves a signed position, counting from the end for negatives, the
    /// way children lists are indexed.
    pub fn from_index(index: i64) -> Option<Stage> {
        let len = Stage::ALL.len() as i64;
        let resolved = if index < 0 { len + index } else { index };
        if (0..len).contains(&resolved) {
            Some(Stage::ALL[resolved as usize])
        } else {
            None
        }
    }
}

struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    fn new(vb: VarBuilder, in_ch: usize, planes: usize, stride: usize) -> Result<Self> {
        let conv1 = conv2d_no_bias(
            in_ch,
            planes,
            3,
            Conv2dConfig {
                padding: 1,
                stride,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let bn1 = batch_norm(planes, BatchNormConfig::default(), vb.pp("bn1"))?;
        let conv2 = conv2d_no_bias(
            planes,
            planes,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let bn2 = batch_norm(planes, BatchNormConfig::default(), vb.pp("bn2"))?;
        let downsample = if stride != 1 || in_ch != planes {
            let conv = conv2d_no_bias(
                in_ch,
                planes,
                1,
                Conv2dConfig {
                    stride,
                    ..Default::default()
                },
                vb.pp("downsample.0"),
            )?;
            let bn = batch_norm(planes, BatchNormConfig::default(), vb.pp("downsample.1"))?;
            Some((conv, bn))
        } else {
            None
        };
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let shortcut = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        let ys = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let ys = self.bn2.forward_t(&self.conv2.forward(&ys)?, train)?;
        (ys + shortcut)?.relu()
    }
}

struct Bottleneck {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl Bottleneck {
    fn new(vb: VarBuilder, in_ch: usize, planes: usize, stride: usize) -> Result<Self> {
        let out_ch = planes * resnet_expansion(true);
        let conv1 = conv2d_no_bias(in_ch, planes, 1, Conv2dConfig::default(), vb.pp("conv1"))?;
        let bn1 = batch_norm(planes, BatchNormConfig::default(), vb.pp("bn1"))?;
        let conv2 = conv2d_no_bias(
            planes,
            planes,
            3,
            Conv2dConfig {
                padding: 1,
                stride,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let bn2 = batch_norm(planes, BatchNormConfig::default(), vb.pp("bn2"))?;
        let conv3 = conv2d_no_bias(planes, out_ch, 1, Conv2dConfig::default(), vb.pp("conv3"))?;
        let bn3 = batch_norm(out_ch, BatchNormConfig::default(), vb.pp("bn3"))?;
        let downsample = if stride != 1 || in_ch != out_ch {
            let conv = conv2d_no_bias(
                in_ch,
                out_ch,
                1,
                Conv2dConfig {
                    stride,
                    ..Default::default()
                },
                vb.pp("downsample.0"),
            )?;
            let bn = batch_norm(out_ch, BatchNormConfig::default(), vb.pp("downsample.1"))?;
            Some((conv, bn))
        } else {
            None
        };
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            downsample,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let shortcut = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        let ys = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let ys = self.bn2.forward_t(&self.conv2.forward(&ys)?, train)?.relu()?;
        let ys = self.bn3.forward_t(&self.conv3.forward(&ys)?, train)?;
        (ys + shortcut)?.relu()
    }
}

enum Block {
    Basic(BasicBlock),
    Bottleneck(Bottleneck),
}

impl Block {
    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Block::Basic(block) => block.forward(xs, train),
            Block::Bottleneck(block) => block.forward(xs, train),
        }
    }
}

/// ResNet-style encoder with named, individually runnable stages.
pub struct Encoder {
    config: EncoderConfig,
    conv1: Conv2d,
    bn1: BatchNorm,
    layers: Vec<Vec<Block>>,
    fc: Linear,
    vars: VarMap,
    device: Device,
}

impl Encoder {
    /// Builds the encoder with freshly initialized parameters.
    pub fn new(config: EncoderConfig, device: &Device) -> Result<Self> {
        let vars = VarMap::new();
        Self::from_vars(config, vars, device)
    }

    /// Rebuilds the module structure over an existing parameter map. Entries
    /// already present in `vars` are reused, which is how snapshots and
    /// checkpoint restores share weights with a live structure.
    pub fn from_vars(config: EncoderConfig, vars: VarMap, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_varmap(&vars, DType::F32, device);

        let conv1 = conv2d_no_bias(
            config.in_channels,
            64,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let bn1 = batch_norm(64, BatchNormConfig::default(), vb.pp("bn1"))?;

        let bottleneck = config.arch.bottleneck();
        let block_counts = config.arch.blocks();
        let planes = [64usize, 128, 256, 512];
        let mut layers = Vec::with_capacity(4);
        let mut in_ch = 64;
        for (stage, (&count, &width)) in block_counts.iter().zip(planes.iter()).enumerate() {
            let stride = if stage == 0 { 1 } else { 2 };
            let vb_stage = vb.pp(format!("layer{}", stage + 1));
            let mut blocks = Vec::with_capacity(count);
            for idx in 0..count {
                let block_stride = if idx == 0 { stride } else { 1 };
                let vb_block = vb_stage.pp(idx.to_string());
                let block = if bottleneck {
                    Block::Bottleneck(Bottleneck::new(vb_block, in_ch, width, block_stride)?)
                } else {
                    Block::Basic(BasicBlock::new(vb_block, in_ch, width, block_stride)?)
                };
                in_ch = width * resnet_expansion(bottleneck);
                blocks.push(block);
            }
            layers.push(blocks);
        }

        let fc = linear(config.arch.feature_dim(), config.num_classes, vb.pp("fc"))?;

        Ok(Self {
            config,
            conv1,
            bn1,
            layers,
            fc,
            vars,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter map holding every weight of this encoder.
    pub fn vars(&self) -> &VarMap {
        &self.vars
    }

    /// Ordered stage names, for index-based stage selection.
    pub fn stages() -> Vec<&'static str> {
        Stage::ALL.iter().map(|s| s.name()).collect()
    }

    /// Full forward pass to classifier logits.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_to(xs, Stage::Fc, train)
    }

    /// Runs the encoder up to and including `stage`, returning that stage's
    /// output flattened to `(batch, features)`.
    pub fn forward_to(&self, xs: &Tensor, stage: Stage, train: bool) -> Result<Tensor> {
        let dims = xs.dims();
        if dims.len() != 4 {
            return Err(Error::Msg(format!(
                "encoder expects (batch, channels, height, width) input, got {:?}",
                dims
            )));
        }

        let mut hidden = self
            .bn1
            .forward_t(&self.conv1.forward(xs)?, train)?
            .relu()?;
        if stage == Stage::Conv1 {
            return hidden.flatten_from(1);
        }

        for (idx, blocks) in self.layers.iter().enumerate() {
            for block in blocks {
                hidden = block.forward(&hidden, train)?;
            }
            let reached = match idx {
                0 => Stage::Layer1,
                1 => Stage::Layer2,
                2 => Stage::Layer3,
                _ => Stage::Layer4,
            };
            if stage == reached {
                return hidden.flatten_from(1);
            }
        }

        // Global average pool collapses the spatial dims to (batch, channels).
        let pooled = hidden.mean(D::Minus1)?.mean(D::Minus1)?;
        if stage == Stage::AvgPool {
            return Ok(pooled);
        }

        self.fc.forward(&pooled)
    }
}
