//! Per-channel batch normalisation for `(batch, channels, height, width)` inputs.
//!
//! Statistics are taken over the batch and spatial axes, one mean/variance per
//! channel, and promoted to [`PrecisionPolicy::reduction`] before the output is
//! cast back. In training mode the batch statistics normalise the input and are
//! folded into running estimates; in evaluation mode the running estimates are
//! used as-is, which makes the forward pass a pure function of its input.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use candle_core::{DType, Device, Error, Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for [`BatchNorm2d`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Number of channels being normalised.
    pub num_channels: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Weight of the newest batch in the running statistics.
    pub momentum: f64,
    /// Whether a learnable per-channel scale and shift follow normalisation.
    pub affine: bool,
}

impl NormConfig {
    /// Creates a configuration with PyTorch-style defaults.
    pub fn new(num_channels: usize) -> Self {
        Self {
            num_channels,
            epsilon: 1e-5,
            momentum: 0.1,
            affine: true,
        }
    }
}

/// Running mean and (unbiased) variance, stored as `(1, C, 1, 1)` tensors.
#[derive(Debug, Clone)]
struct RunningStats {
    mean: Tensor,
    var: Tensor,
}

/// Batch normalisation over the channel axis of image-like tensors.
pub struct BatchNorm2d {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    running: Mutex<RunningStats>,
    training: AtomicBool,
}

impl fmt::Debug for BatchNorm2d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchNorm2d")
            .field("config", &self.config)
            .field("training", &self.is_training())
            .finish()
    }
}

impl BatchNorm2d {
    /// Builds the layer with `weight` (ones) and `bias` (zeros) pulled from `vb`.
    pub fn new(config: NormConfig, vb: VarBuilder) -> Result<Self> {
        let (weight, bias) = if config.affine {
            let weight = vb.get_with_hints(config.num_channels, "weight", Init::Const(1.0))?;
            let bias = vb.get_with_hints(config.num_channels, "bias", Init::Const(0.0))?;
            (Some(weight), Some(bias))
        } else {
            (None, None)
        };
        let device = vb.device().clone();
        Self::from_parts(config, weight, bias, &device)
    }

    /// Constructs the layer from explicit affine parameters.
    pub fn from_parts(
        config: NormConfig,
        weight: Option<Tensor>,
        bias: Option<Tensor>,
        device: &Device,
    ) -> Result<Self> {
        match (&weight, &bias, config.affine) {
            (Some(weight), Some(bias), true) => {
                checks::expect_shape("norm.weight", weight, &[config.num_channels])?;
                checks::expect_shape("norm.bias", bias, &[config.num_channels])?;
            }
            (None, None, false) => {}
            _ => {
                return Err(Error::Msg(
                    "affine norms need both weight and bias, non-affine norms neither".into(),
                ))
            }
        }
        let shape = (1, config.num_channels, 1, 1);
        let running = RunningStats {
            mean: Tensor::zeros(shape, DType::F32, device)?,
            var: Tensor::ones(shape, DType::F32, device)?,
        };
        Ok(Self {
            config,
            weight,
            bias,
            running: Mutex::new(running),
            training: AtomicBool::new(true),
        })
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Switches between batch statistics (training) and running statistics.
    ///
    /// New layers start in training mode.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    /// Whether batch statistics are currently used.
    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Returns clones of the running `(mean, var)` tensors.
    pub fn running_stats(&self) -> Result<(Tensor, Tensor)> {
        let guard = self
            .running
            .lock()
            .map_err(|_| Error::Msg("batch norm running stats mutex poisoned".into()))?;
        Ok((guard.mean.clone(), guard.var.clone()))
    }

    /// Normalises `input` per channel.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_nchw("norm.input", input, self.config.num_channels)?;
        let compute = policy.cast_for_reduction(input)?;

        let (mean, var) = if self.is_training() {
            let mean = channel_mean(&compute)?;
            let var = channel_mean(&compute.broadcast_sub(&mean)?.sqr()?)?;
            self.update_running(&mean, &var, input.elem_count() / self.config.num_channels)?;
            (mean, var)
        } else {
            let (mean, var) = self.running_stats()?;
            (mean.to_dtype(compute.dtype())?, var.to_dtype(compute.dtype())?)
        };

        let denom = (var + self.config.epsilon)?.sqrt()?;
        let mut normalized = compute.broadcast_sub(&mean)?.broadcast_div(&denom)?;
        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }

        if let (Some(weight), Some(bias)) = (&self.weight, &self.bias) {
            let shape = (1, self.config.num_channels, 1, 1);
            let weight = weight.to_dtype(normalized.dtype())?.reshape(shape)?;
            let bias = bias.to_dtype(normalized.dtype())?.reshape(shape)?;
            normalized = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&normalized)
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor, count: usize) -> Result<()> {
        let momentum = self.config.momentum;
        let correction = if count > 1 {
            count as f64 / (count - 1) as f64
        } else {
            1.0
        };
        let mean = mean.detach().to_dtype(DType::F32)?;
        let var = var.detach().to_dtype(DType::F32)?.affine(correction, 0.0)?;

        let mut guard = self
            .running
            .lock()
            .map_err(|_| Error::Msg("batch norm running stats mutex poisoned".into()))?;
        let next_mean = (guard.mean.affine(1.0 - momentum, 0.0)? + mean.affine(momentum, 0.0)?)?;
        let next_var = (guard.var.affine(1.0 - momentum, 0.0)? + var.affine(momentum, 0.0)?)?;
        guard.mean = next_mean;
        guard.var = next_var;
        Ok(())
    }
}

/// Mean over batch and spatial axes, kept as `(1, C, 1, 1)`.
fn channel_mean(tensor: &Tensor) -> Result<Tensor> {
    tensor.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)
}
