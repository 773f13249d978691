//! Activation catalogue for the convolutional parameter networks.
//!
//! Activations consume `(batch, channels, height, width)` tensors. Element-wise
//! kinds keep the layout; [`ActivationKind::ConcatRelu`] doubles the channel
//! axis by evaluating `relu(cat(x, -x))`, which lets the first convolution of a
//! residual network see both signs of a masked input. Each implementation
//! promotes to [`PrecisionPolicy::compute`] before evaluating the
//! non-linearity, then casts back to the storage dtype.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// ReLU, zeroes negative values.
    Relu,
    /// ReLU applied to `x` and `-x` concatenated along the channel axis.
    ConcatRelu,
}

impl ActivationKind {
    /// Number of output channels produced for `channels` input channels.
    pub fn output_channels(&self, channels: usize) -> usize {
        match self {
            ActivationKind::ConcatRelu => 2 * channels,
            ActivationKind::Relu => channels,
        }
    }
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection when wiring composite blocks.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

impl std::fmt::Debug for dyn Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self.kind {
            ActivationKind::Relu => {
                let compute = policy.cast_for_compute(input)?;
                policy.cast_to_storage(&compute.relu()?)
            }
            ActivationKind::ConcatRelu => {
                let compute = policy.cast_for_compute(input)?;
                let both = Tensor::cat(&[&compute, &compute.neg()?], 1)?;
                policy.cast_to_storage(&both.relu()?)
            }
        }
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}
