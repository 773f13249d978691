//! Adapters turning arbitrary differentiable functions into scale/translate
//! predictors.
//!
//! A coupling layer only needs "map the masked input to `(s, t)`". That
//! capability is the [`ParameterNetwork`] trait; [`ParameterNets`] records,
//! once at construction, whether two split networks, one combined network, or
//! the default residual network provides it.

use std::{fmt, sync::Arc};

use candle_core::Tensor;
use candle_nn::Module;
use layers::{PrecisionPolicy, ResNet};

use crate::error::{CouplingError, Result};

/// A differentiable map from a `(batch, C, H, W)` tensor to a parameter tensor.
///
/// Split networks return `(batch, C, H, W)`; combined networks return
/// `(batch, 2C, H, W)` with scale channels first.
pub trait ParameterNetwork: Send + Sync {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor>;

    /// Switches between training and evaluation behaviour, if the network has any.
    fn set_training(&self, _training: bool) {}
}

/// Wraps a closure as a [`ParameterNetwork`].
pub struct FnNetwork<F>(F);

/// Builds a [`ParameterNetwork`] from a closure.
pub fn from_fn<F>(f: F) -> FnNetwork<F>
where
    F: Fn(&Tensor) -> candle_core::Result<Tensor> + Send + Sync,
{
    FnNetwork(f)
}

impl<F> ParameterNetwork for FnNetwork<F>
where
    F: Fn(&Tensor) -> candle_core::Result<Tensor> + Send + Sync,
{
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        (self.0)(input)
    }
}

/// Wraps any `candle_nn::Module` (e.g. a `Sequential` or `Conv2d`).
pub struct ModuleNetwork<M>(pub M);

impl<M> ParameterNetwork for ModuleNetwork<M>
where
    M: Module + Send + Sync,
{
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        self.0.forward(input)
    }
}

/// The default residual network, run under a policy derived from each input.
pub struct ResNetNetwork {
    net: ResNet,
}

impl ResNetNetwork {
    pub fn new(net: ResNet) -> Self {
        Self { net }
    }

    pub fn resnet(&self) -> &ResNet {
        &self.net
    }
}

impl ParameterNetwork for ResNetNetwork {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let policy = PrecisionPolicy::from_parameter_dtype(input.dtype());
        self.net.forward(input, &policy)
    }

    fn set_training(&self, training: bool) {
        self.net.set_training(training);
    }
}

/// Which kind of network configuration is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Split,
    Combined,
    Default,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkMode::Split => "split",
            NetworkMode::Combined => "combined",
            NetworkMode::Default => "default",
        };
        f.write_str(name)
    }
}

/// The network configuration, chosen once and fixed for the layer's lifetime.
#[derive(Clone)]
pub enum ParameterNets {
    /// Independent scale and translate networks.
    Split {
        scale: Arc<dyn ParameterNetwork>,
        translate: Arc<dyn ParameterNetwork>,
    },
    /// One network whose output channels are split into scale then translate.
    Combined(Arc<dyn ParameterNetwork>),
    /// The default residual network (combined output).
    Default(Arc<ResNetNetwork>),
}

impl fmt::Debug for ParameterNets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterNets::Default(net) => f
                .debug_tuple("Default")
                .field(net.resnet().config())
                .finish(),
            other => write!(f, "{}", other.mode()),
        }
    }
}

impl ParameterNets {
    pub fn split(scale: Arc<dyn ParameterNetwork>, translate: Arc<dyn ParameterNetwork>) -> Self {
        Self::Split { scale, translate }
    }

    pub fn combined(net: Arc<dyn ParameterNetwork>) -> Self {
        Self::Combined(net)
    }

    pub fn mode(&self) -> NetworkMode {
        match self {
            ParameterNets::Split { .. } => NetworkMode::Split,
            ParameterNets::Combined(_) => NetworkMode::Combined,
            ParameterNets::Default(_) => NetworkMode::Default,
        }
    }

    pub fn set_training(&self, training: bool) {
        match self {
            ParameterNets::Split { scale, translate } => {
                scale.set_training(training);
                translate.set_training(training);
            }
            ParameterNets::Combined(net) => net.set_training(training),
            ParameterNets::Default(net) => net.set_training(training),
        }
    }

    /// Predicts raw `(scale, translate)` for `masked`, each shaped like `masked`.
    ///
    /// Values on the identity region are not zeroed here.
    pub fn predict(&self, masked: &Tensor) -> Result<(Tensor, Tensor)> {
        let expected = masked.dims();
        match self {
            ParameterNets::Split { scale, translate } => {
                let s = scale.forward(masked)?;
                let t = translate.forward(masked)?;
                expect_same_dims("scale network output", &s, expected)?;
                expect_same_dims("translate network output", &t, expected)?;
                Ok((s, t))
            }
            ParameterNets::Combined(net) => split_combined(&net.forward(masked)?, expected),
            ParameterNets::Default(net) => split_combined(&net.forward(masked)?, expected),
        }
    }
}

fn split_combined(output: &Tensor, expected: &[usize]) -> Result<(Tensor, Tensor)> {
    let mut doubled = expected.to_vec();
    doubled[1] *= 2;
    if output.dims() != doubled.as_slice() {
        return Err(CouplingError::shape(
            "combined network output",
            format!("{doubled:?}"),
            output.dims(),
        ));
    }
    let mut halves = output.chunk(2, 1)?.into_iter();
    match (halves.next(), halves.next()) {
        (Some(s), Some(t)) => Ok((s, t)),
        _ => Err(CouplingError::shape(
            "combined network output",
            format!("{doubled:?}"),
            output.dims(),
        )),
    }
}

fn expect_same_dims(context: &'static str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(CouplingError::shape(context, format!("{expected:?}"), tensor.dims()))
    }
}
