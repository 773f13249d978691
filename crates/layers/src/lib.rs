//! Building blocks for the parameter networks of coupling layers.
//!
//! Everything here consumes `(batch, channels, height, width)` tensors and is
//! assembled from Candle primitives. Trainable parameters are registered
//! through `candle_nn::VarBuilder`, so a `VarMap` backing the builder collects
//! them for an optimizer. Forward passes take a [`dtypes::PrecisionPolicy`]
//! describing which dtype to compute and reduce in.

pub mod activations;
pub mod checks;
pub mod conv;
pub mod dtypes;
pub mod norm;
pub mod residual;

pub use conv::{ConvConfig, WeightNormConv2d};
pub use dtypes::PrecisionPolicy;
pub use norm::{BatchNorm2d, NormConfig};
pub use residual::{ResNet, ResNetConfig, ResidualBlock};
