//! Residual convolutional network used to predict coupling parameters.
//!
//! The network maps `(batch, in_channels, height, width)` to
//! `(batch, out_channels, height, width)`; spatial dims are preserved because
//! every convolution uses "same" padding. The layout follows the RealNVP
//! reference architecture:
//!
//! ```text
//! x -> in_norm -> (x2 if double_after_norm) -> relu(cat(x, -x)) -> in_conv
//!   -> skip = in_skip(x)
//!   -> for each block: x = block(x); skip += skip_conv(x)
//!   -> out_norm(skip) -> relu -> out_conv
//! ```
//!
//! Each [`ResidualBlock`] is `norm -> relu -> conv -> norm -> relu -> conv`
//! added back onto its input.

use std::sync::Arc;

use candle_core::{Error, Result, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    checks,
    conv::{ConvConfig, WeightNormConv2d},
    dtypes::PrecisionPolicy,
    norm::{BatchNorm2d, NormConfig},
};

/// Hyper-parameters shared by every residual network instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResNetConfig {
    /// Width of the hidden feature maps.
    pub mid_channels: usize,
    /// Number of residual blocks.
    pub num_blocks: usize,
    /// Kernel size of the input and block convolutions.
    pub kernel_size: usize,
    /// Padding of the input and block convolutions.
    pub padding: usize,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self {
            mid_channels: 64,
            num_blocks: 8,
            kernel_size: 3,
            padding: 1,
        }
    }
}

impl ResNetConfig {
    /// Returns every structural problem with the configuration.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.mid_channels == 0 {
            problems.push("mid_channels must be greater than zero".to_string());
        }
        if self.kernel_size == 0 {
            problems.push("kernel_size must be greater than zero".to_string());
        } else if self.kernel_size % 2 == 0 {
            problems.push(format!("kernel_size ({}) must be odd", self.kernel_size));
        } else if 2 * self.padding + 1 != self.kernel_size {
            problems.push(format!(
                "padding ({}) must keep spatial dims for kernel_size ({})",
                self.padding, self.kernel_size
            ));
        }
        problems
    }

    /// Validate structural invariants, joining every problem into one error.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Msg(problems.join("; ")))
        }
    }
}

/// Pre-activation residual block operating at a fixed channel width.
#[derive(Debug)]
pub struct ResidualBlock {
    in_norm: BatchNorm2d,
    in_conv: WeightNormConv2d,
    out_norm: BatchNorm2d,
    out_conv: WeightNormConv2d,
    activation: Arc<dyn Activation>,
}

impl ResidualBlock {
    /// Builds a block with `channels` in and out.
    pub fn new(channels: usize, config: &ResNetConfig, vb: VarBuilder) -> Result<Self> {
        let conv = |bias: bool| {
            let cfg = ConvConfig::new(channels, channels, config.kernel_size, config.padding);
            if bias {
                cfg
            } else {
                cfg.without_bias()
            }
        };
        Ok(Self {
            in_norm: BatchNorm2d::new(NormConfig::new(channels), vb.pp("in_norm"))?,
            in_conv: WeightNormConv2d::new(conv(false), vb.pp("in_conv"))?,
            out_norm: BatchNorm2d::new(NormConfig::new(channels), vb.pp("out_norm"))?,
            out_conv: WeightNormConv2d::new(conv(true), vb.pp("out_conv"))?,
            activation: builtin(ActivationKind::Relu),
        })
    }

    /// Applies the block and adds the input back.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let hidden = self.in_norm.forward(input, policy)?;
        let hidden = self.activation.forward(&hidden, policy)?;
        let hidden = self.in_conv.forward(&hidden, policy)?;
        let hidden = self.out_norm.forward(&hidden, policy)?;
        let hidden = self.activation.forward(&hidden, policy)?;
        let hidden = self.out_conv.forward(&hidden, policy)?;
        hidden.add(input)
    }

    fn set_training(&self, training: bool) {
        self.in_norm.set_training(training);
        self.out_norm.set_training(training);
    }
}

/// Residual network predicting `out_channels` feature maps per input pixel.
#[derive(Debug)]
pub struct ResNet {
    config: ResNetConfig,
    in_channels: usize,
    out_channels: usize,
    double_after_norm: bool,
    in_norm: BatchNorm2d,
    in_conv: WeightNormConv2d,
    in_skip: WeightNormConv2d,
    blocks: Vec<ResidualBlock>,
    skips: Vec<WeightNormConv2d>,
    out_norm: BatchNorm2d,
    out_conv: WeightNormConv2d,
    concat_relu: Arc<dyn Activation>,
    relu: Arc<dyn Activation>,
}

impl ResNet {
    /// Builds the network, registering every parameter under `vb`.
    ///
    /// `double_after_norm` scales the normalised input by two before the
    /// concatenated ReLU, which compensates for checkerboard masks zeroing half
    /// of every channel.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        double_after_norm: bool,
        config: ResNetConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        if in_channels == 0 || out_channels == 0 {
            return Err(Error::Msg(
                "resnet channel counts must be greater than zero".into(),
            ));
        }
        let mid = config.mid_channels;
        let concat_relu = builtin(ActivationKind::ConcatRelu);

        let in_norm = BatchNorm2d::new(NormConfig::new(in_channels), vb.pp("in_norm"))?;
        let in_conv = WeightNormConv2d::new(
            ConvConfig::new(
                concat_relu.kind().output_channels(in_channels),
                mid,
                config.kernel_size,
                config.padding,
            ),
            vb.pp("in_conv"),
        )?;
        let in_skip = WeightNormConv2d::new(ConvConfig::pointwise(mid, mid), vb.pp("in_skip"))?;

        let mut blocks = Vec::with_capacity(config.num_blocks);
        let mut skips = Vec::with_capacity(config.num_blocks);
        for idx in 0..config.num_blocks {
            blocks.push(ResidualBlock::new(mid, &config, vb.pp(format!("blocks.{idx}")))?);
            skips.push(WeightNormConv2d::new(
                ConvConfig::pointwise(mid, mid),
                vb.pp(format!("skips.{idx}")),
            )?);
        }

        let out_norm = BatchNorm2d::new(NormConfig::new(mid), vb.pp("out_norm"))?;
        let out_conv =
            WeightNormConv2d::new(ConvConfig::pointwise(mid, out_channels), vb.pp("out_conv"))?;

        log::debug!(
            "resnet init in={} out={} mid={} blocks={} double_after_norm={}",
            in_channels,
            out_channels,
            mid,
            config.num_blocks,
            double_after_norm
        );

        Ok(Self {
            config,
            in_channels,
            out_channels,
            double_after_norm,
            in_norm,
            in_conv,
            in_skip,
            blocks,
            skips,
            out_norm,
            out_conv,
            concat_relu,
            relu: builtin(ActivationKind::Relu),
        })
    }

    /// Returns the hyper-parameters used to build the network.
    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    /// Expected input channel count.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Produced output channel count.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Whether the normalised input is doubled before the first convolution.
    pub fn double_after_norm(&self) -> bool {
        self.double_after_norm
    }

    /// Whether the normalisation layers use batch statistics.
    pub fn is_training(&self) -> bool {
        self.in_norm.is_training()
    }

    /// Toggles batch statistics in every normalisation layer.
    pub fn set_training(&self, training: bool) {
        self.in_norm.set_training(training);
        self.out_norm.set_training(training);
        for block in &self.blocks {
            block.set_training(training);
        }
    }

    /// Runs the network.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_nchw("resnet.input", input, self.in_channels)?;

        let mut hidden = self.in_norm.forward(input, policy)?;
        if self.double_after_norm {
            hidden = hidden.affine(2.0, 0.0)?;
        }
        let hidden = self.concat_relu.forward(&hidden, policy)?;
        let mut hidden = self.in_conv.forward(&hidden, policy)?;
        let mut skip = self.in_skip.forward(&hidden, policy)?;

        for (block, skip_conv) in self.blocks.iter().zip(&self.skips) {
            hidden = block.forward(&hidden, policy)?;
            skip = skip.add(&skip_conv.forward(&hidden, policy)?)?;
        }

        let hidden = self.out_norm.forward(&skip, policy)?;
        let hidden = self.relu.forward(&hidden, policy)?;
        self.out_conv.forward(&hidden, policy)
    }
}
