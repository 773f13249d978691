//! Weight-normalised 2D convolutions.
//!
//! Convolutions consume `(batch, in_channels, height, width)` tensors and
//! produce `(batch, out_channels, height', width')`. The kernel is stored as a
//! direction `v` and a per-output-channel magnitude `g`; the effective kernel is
//! `w = g * v / ||v||` so gradient steps on `g` and `v` stay decoupled. Both
//! tensors are created through a [`VarBuilder`], which keeps them trainable when
//! the builder is backed by a `VarMap`.

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

const NORM_EPSILON: f64 = 1e-12;

/// Configuration for a square-kernel convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvConfig {
    /// Incoming channel count.
    pub in_channels: usize,
    /// Outgoing channel count.
    pub out_channels: usize,
    /// Side length of the square kernel.
    pub kernel_size: usize,
    /// Zero padding applied on every spatial border.
    pub padding: usize,
    /// Whether a learnable bias vector is added.
    pub bias: bool,
}

impl ConvConfig {
    /// Creates a biased `kernel_size x kernel_size` convolution configuration.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, padding: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            padding,
            bias: true,
        }
    }

    /// Disables the bias term.
    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }

    /// Pointwise (1x1) convolution with bias.
    pub fn pointwise(in_channels: usize, out_channels: usize) -> Self {
        Self::new(in_channels, out_channels, 1, 0)
    }
}

/// Convolution whose kernel is reparameterised as `g * v / ||v||`.
#[derive(Debug, Clone)]
pub struct WeightNormConv2d {
    config: ConvConfig,
    direction: Tensor,
    magnitude: Tensor,
    bias: Option<Tensor>,
}

impl WeightNormConv2d {
    /// Builds the layer, pulling `weight_v`, `weight_g` and `bias` from `vb`.
    ///
    /// Directions start as `N(0, 0.05)` samples and magnitudes at one, so every
    /// output filter initially has unit norm.
    pub fn new(config: ConvConfig, vb: VarBuilder) -> Result<Self> {
        let k = config.kernel_size;
        let direction = vb.get_with_hints(
            (config.out_channels, config.in_channels, k, k),
            "weight_v",
            Init::Randn {
                mean: 0.0,
                stdev: 0.05,
            },
        )?;
        let magnitude = vb.get_with_hints((config.out_channels, 1, 1, 1), "weight_g", Init::Const(1.0))?;
        let bias = if config.bias {
            Some(vb.get_with_hints(config.out_channels, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Self::from_parts(config, direction, magnitude, bias)
    }

    /// Constructs a convolution from pre-existing parameters.
    pub fn from_parts(
        config: ConvConfig,
        direction: Tensor,
        magnitude: Tensor,
        bias: Option<Tensor>,
    ) -> Result<Self> {
        let k = config.kernel_size;
        checks::expect_shape(
            "conv.weight_v",
            &direction,
            &[config.out_channels, config.in_channels, k, k],
        )?;
        checks::expect_shape("conv.weight_g", &magnitude, &[config.out_channels, 1, 1, 1])?;
        checks::expect_same_dtype("conv.weight_g", &magnitude, "conv.weight_v", &direction)?;
        match (&bias, config.bias) {
            (Some(bias), true) => checks::expect_shape("conv.bias", bias, &[config.out_channels])?,
            (None, false) => {}
            (Some(_), false) => {
                return Err(candle_core::Error::Msg(
                    "bias provided but config disables bias".into(),
                ))
            }
            (None, true) => {
                return Err(candle_core::Error::Msg(
                    "config expects bias but none supplied".into(),
                ))
            }
        }
        Ok(Self {
            config,
            direction,
            magnitude,
            bias,
        })
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    /// Materialises the effective kernel `g * v / ||v||`.
    pub fn weight(&self) -> Result<Tensor> {
        let out = self.config.out_channels;
        let norm = self
            .direction
            .flatten_from(1)?
            .sqr()?
            .sum_keepdim(1)?
            .sqrt()?
            .reshape((out, 1, 1, 1))?;
        let norm = (norm + NORM_EPSILON)?;
        self.direction
            .broadcast_div(&norm)?
            .broadcast_mul(&self.magnitude)
    }

    /// Applies the convolution in the compute dtype and casts back to storage.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_nchw("conv.input", input, self.config.in_channels)?;
        let input = policy.cast_for_compute(input)?;
        let weight = policy.cast_for_compute(&self.weight()?)?;
        let mut output = input.conv2d(&weight, self.config.padding, 1, 1, 1)?;
        if let Some(bias) = &self.bias {
            let bias = policy
                .cast_for_compute(bias)?
                .reshape((1, self.config.out_channels, 1, 1))?;
            output = output.broadcast_add(&bias)?;
        }
        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn same_padding_preserves_spatial_dims() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = WeightNormConv2d::new(ConvConfig::new(3, 8, 3, 1), vb.pp("conv"))?;
        let input = Tensor::randn(0f32, 1.0, (2, 3, 5, 4), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = conv.forward(&input, &policy)?;
        assert_eq!(output.dims(), &[2, 8, 5, 4]);
        assert_eq!(varmap.all_vars().len(), 3);
        Ok(())
    }

    #[test]
    fn effective_kernel_has_magnitude_norm() -> Result<()> {
        let device = Device::Cpu;
        let config = ConvConfig::new(2, 3, 3, 1).without_bias();
        let direction = Tensor::randn(0f32, 1.0, (3, 2, 3, 3), &device)?;
        let magnitude = Tensor::from_vec(vec![0.5f32, 1.0, 2.0], (3, 1, 1, 1), &device)?;
        let conv = WeightNormConv2d::from_parts(config, direction, magnitude, None)?;

        let norms = conv
            .weight()?
            .flatten_from(1)?
            .sqr()?
            .sum(1)?
            .sqrt()?
            .to_vec1::<f32>()?;
        for (norm, expected) in norms.iter().zip([0.5f32, 1.0, 2.0]) {
            assert!((norm - expected).abs() < 1e-5, "norm {norm} vs {expected}");
        }
        Ok(())
    }

    #[test]
    fn pointwise_conv_matches_channel_matmul() -> Result<()> {
        let device = Device::Cpu;
        let direction = Tensor::from_vec(vec![3.0f32, 4.0], (1, 2, 1, 1), &device)?;
        let magnitude = Tensor::ones((1, 1, 1, 1), DType::F32, &device)?;
        let bias = Tensor::from_vec(vec![0.25f32], (1,), &device)?;
        let conv = WeightNormConv2d::from_parts(ConvConfig::pointwise(2, 1), direction, magnitude, Some(bias))?;

        let input = Tensor::from_vec(vec![1.0f32, 2.0], (1, 2, 1, 1), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let value = conv.forward(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?[0];
        // (3 * 1 + 4 * 2) / 5 + 0.25
        assert!((value - 2.45).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn mismatched_bias_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let direction = Tensor::ones((1, 1, 1, 1), DType::F32, &device)?;
        let magnitude = Tensor::ones((1, 1, 1, 1), DType::F32, &device)?;
        let config = ConvConfig::pointwise(1, 1).without_bias();
        let bias = Tensor::zeros((1,), DType::F32, &device)?;
        assert!(WeightNormConv2d::from_parts(config, direction, magnitude, Some(bias)).is_err());
        Ok(())
    }
}
