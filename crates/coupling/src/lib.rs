//! Affine coupling layers for normalizing flows.
//!
//! A coupling layer splits its input with a binary [`mask`] into an identity
//! part and a transformed part. A parameter network looks only at the identity
//! part and predicts a log-scale `s` and a shift `t`, which are applied to the
//! transformed part. Because the network input survives the transform
//! untouched, the inverse is available in closed form and the Jacobian
//! log-determinant is just the sum of `s`.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use coupling::{AffineCouplingLayer, Flow};
//!
//! # fn main() -> coupling::Result<()> {
//! let layer = AffineCouplingLayer::builder(4)
//!     .mask_type("checkerboard")
//!     .build()?;
//! let x = Tensor::randn(0f32, 1.0, (2, 4, 8, 8), &Device::Cpu)?;
//! let out = layer.forward(&x, true)?;
//! let restored = layer.inverse(&out.z)?;
//! assert_eq!(restored.dtype(), DType::F32);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod layer;
pub mod mask;
pub mod network;

pub use config::CouplingConfig;
pub use error::{CouplingError, Result};
pub use layer::{AffineCouplingLayer, CouplingLayerBuilder, CouplingParameters, Flow, FlowOutput};
pub use mask::{build_mask, channel_wise_mask, checkerboard_mask, MaskType};
pub use network::{
    from_fn, FnNetwork, ModuleNetwork, NetworkMode, ParameterNets, ParameterNetwork, ResNetNetwork,
};
