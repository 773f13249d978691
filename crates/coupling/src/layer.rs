//! The affine coupling layer.
//!
//! Given a mask `m`, the forward transform is
//!
//! ```text
//! z = m * x + (1 - m) * x * exp(s) + t,    (s, t) = net(m * x)
//! ```
//!
//! with `s` and `t` zeroed wherever `m = 1`. The identity region is never
//! altered, so `net(m * z) == net(m * x)` and the inverse
//! `x = m * z + ((1 - m) * z - t) * exp(-s)` is exact in closed form whatever
//! the network computes. The Jacobian is diagonal with entries `exp(s)`, so the
//! log-determinant of each sample is the sum of its `s`.

use std::{fmt, sync::Arc};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use layers::{PrecisionPolicy, ResNet, ResNetConfig};

use crate::{
    config::CouplingConfig,
    error::{CouplingError, Result},
    mask::{build_mask, MaskType},
    network::{NetworkMode, ParameterNets, ParameterNetwork, ResNetNetwork},
};

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct FlowOutput {
    /// Transformed tensor, shaped like the input.
    pub z: Tensor,
    /// Per-sample `log |det J|`, shape `(batch,)`, when requested.
    pub logdet: Option<Tensor>,
}

/// An invertible transform with a tractable Jacobian.
pub trait Flow: Send + Sync {
    /// Maps `x` to `z`, optionally returning the log-determinant of the Jacobian.
    fn forward(&self, x: &Tensor, compute_jacobian: bool) -> Result<FlowOutput>;

    /// Maps `z` back to `x`.
    fn inverse(&self, z: &Tensor) -> Result<Tensor>;
}

/// Everything derived from one input before the affine step.
#[derive(Debug, Clone)]
pub struct CouplingParameters {
    /// Mask broadcastable to the input (`1` = identity).
    pub mask: Tensor,
    /// Log-scale, zero on the identity region.
    pub scale: Tensor,
    /// Shift, zero on the identity region.
    pub translate: Tensor,
    /// `mask * x`.
    pub masked: Tensor,
    /// `(1 - mask) * x`.
    pub complement: Tensor,
}

/// Affine coupling layer over `(batch, C, H, W)` inputs.
///
/// Rank-2 `(batch, C)` inputs are accepted with channel-wise masks and are
/// treated as `(batch, C, 1, 1)`.
pub struct AffineCouplingLayer {
    in_channels: usize,
    mask_type: MaskType,
    inverse_mask: bool,
    nets: ParameterNets,
    varmap: Option<VarMap>,
}

impl fmt::Debug for AffineCouplingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffineCouplingLayer")
            .field("in_channels", &self.in_channels)
            .field("mask_type", &self.mask_type)
            .field("inverse_mask", &self.inverse_mask)
            .field("nets", &self.nets)
            .finish()
    }
}

impl fmt::Display for AffineCouplingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in_channels={}, mask_type={}, inverse_mask={}",
            self.in_channels, self.mask_type, self.inverse_mask
        )
    }
}

impl AffineCouplingLayer {
    /// Starts a builder mirroring the keyword-style construction options.
    pub fn builder<'a>(in_channels: usize) -> CouplingLayerBuilder<'a> {
        CouplingLayerBuilder::new(in_channels)
    }

    /// Builds a layer around explicitly supplied networks.
    ///
    /// `config.network` is ignored since no default network is constructed.
    pub fn new(config: &CouplingConfig, nets: ParameterNets) -> Result<Self> {
        config.validate()?;
        log::debug!(
            "coupling layer init in_channels={} mask_type={} inverse_mask={} nets={}",
            config.in_channels,
            config.mask_type,
            config.inverse_mask,
            nets.mode()
        );
        Ok(Self {
            in_channels: config.in_channels,
            mask_type: config.mask_type,
            inverse_mask: config.inverse_mask,
            nets,
            varmap: None,
        })
    }

    /// Builds a layer with the default residual network, registering its
    /// parameters under `vb`.
    pub fn from_config(config: &CouplingConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let nets = default_nets(config, vb)?;
        Self::new(config, nets)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn mask_type(&self) -> MaskType {
        self.mask_type
    }

    pub fn inverse_mask(&self) -> bool {
        self.inverse_mask
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.nets.mode()
    }

    pub fn nets(&self) -> &ParameterNets {
        &self.nets
    }

    /// Parameters of a default network the layer created for itself.
    ///
    /// `None` when networks were supplied or built from a caller's `VarBuilder`.
    pub fn varmap(&self) -> Option<&VarMap> {
        self.varmap.as_ref()
    }

    /// Forwards the training flag to the parameter network(s).
    pub fn set_training(&self, training: bool) {
        self.nets.set_training(training);
    }

    /// Builds the mask for `x`, broadcastable to its image view.
    pub fn build_mask(&self, x: &Tensor) -> Result<Tensor> {
        let (image, _) = self.as_image(x)?;
        build_mask(&image, self.mask_type, self.inverse_mask)
    }

    /// Computes the mask, the masked halves of `x`, and the zeroed `(s, t)`.
    ///
    /// Tensors are shaped like the image view of `x`.
    pub fn parameters(&self, x: &Tensor) -> Result<CouplingParameters> {
        let (image, _) = self.as_image(x)?;
        self.image_parameters(&image)
    }

    fn image_parameters(&self, x: &Tensor) -> Result<CouplingParameters> {
        let mask = build_mask(x, self.mask_type, self.inverse_mask)?;
        let inverse = mask.affine(-1.0, 1.0)?;
        let masked = x.broadcast_mul(&mask)?;
        let complement = x.broadcast_mul(&inverse)?;

        let (scale, translate) = self.nets.predict(&masked)?;
        let scale = scale.to_dtype(x.dtype())?.broadcast_mul(&inverse)?;
        let translate = translate.to_dtype(x.dtype())?.broadcast_mul(&inverse)?;

        Ok(CouplingParameters {
            mask,
            scale,
            translate,
            masked,
            complement,
        })
    }

    /// Returns the `(batch, C, H, W)` view of `x` plus the original dims when
    /// a reshape was needed.
    fn as_image(&self, x: &Tensor) -> Result<(Tensor, Option<Vec<usize>>)> {
        match x.dims() {
            &[_, channels, _, _] if channels == self.in_channels => Ok((x.clone(), None)),
            &[batch, channels] if channels == self.in_channels => {
                if self.mask_type == MaskType::Checkerboard {
                    return Err(CouplingError::shape(
                        "coupling input",
                        format!("(batch, {}, height, width) for checkerboard masks", self.in_channels),
                        x.dims(),
                    ));
                }
                let image = x.reshape((batch, channels, 1, 1))?;
                Ok((image, Some(x.dims().to_vec())))
            }
            dims => Err(CouplingError::shape(
                "coupling input",
                format!(
                    "(batch, {0}, height, width) or (batch, {0})",
                    self.in_channels
                ),
                dims,
            )),
        }
    }
}

impl Flow for AffineCouplingLayer {
    fn forward(&self, x: &Tensor, compute_jacobian: bool) -> Result<FlowOutput> {
        let (image, original) = self.as_image(x)?;
        let policy = PrecisionPolicy::from_parameter_dtype(image.dtype());
        let params = self.image_parameters(&image)?;

        let scale = policy.cast_for_compute(&params.scale)?;
        let translate = policy.cast_for_compute(&params.translate)?;
        let masked = policy.cast_for_compute(&params.masked)?;
        let complement = policy.cast_for_compute(&params.complement)?;

        let z = masked.add(&complement.mul(&scale.exp()?)?.add(&translate)?)?;
        let mut z = policy.cast_to_storage(&z)?;
        if let Some(dims) = original {
            z = z.reshape(dims)?;
        }

        let logdet = if compute_jacobian {
            Some(policy.reduce_per_sample(&params.scale)?)
        } else {
            None
        };

        Ok(FlowOutput { z, logdet })
    }

    fn inverse(&self, z: &Tensor) -> Result<Tensor> {
        let (image, original) = self.as_image(z)?;
        let policy = PrecisionPolicy::from_parameter_dtype(image.dtype());
        let params = self.image_parameters(&image)?;

        let scale = policy.cast_for_compute(&params.scale)?;
        let translate = policy.cast_for_compute(&params.translate)?;
        let masked = policy.cast_for_compute(&params.masked)?;
        let complement = policy.cast_for_compute(&params.complement)?;

        let x = masked.add(&complement.sub(&translate)?.mul(&scale.neg()?.exp()?)?)?;
        let x = policy.cast_to_storage(&x)?;
        match original {
            Some(dims) => Ok(x.reshape(dims)?),
            None => Ok(x),
        }
    }
}

fn default_nets(config: &CouplingConfig, vb: VarBuilder) -> Result<ParameterNets> {
    let net = ResNet::new(
        config.in_channels,
        2 * config.in_channels,
        config.mask_type == MaskType::Checkerboard,
        config.network.clone(),
        vb,
    )?;
    Ok(ParameterNets::Default(Arc::new(ResNetNetwork::new(net))))
}

/// Keyword-style construction: `in_channels`, `mask_type`, `inverse_mask`, and
/// at most one of {`scale_net` + `translate_net`, `scale_translate_net`}.
/// With neither, the default residual network is built.
pub struct CouplingLayerBuilder<'a> {
    in_channels: usize,
    mask_type: Option<String>,
    inverse_mask: bool,
    scale_net: Option<Arc<dyn ParameterNetwork>>,
    translate_net: Option<Arc<dyn ParameterNetwork>>,
    scale_translate_net: Option<Arc<dyn ParameterNetwork>>,
    network: ResNetConfig,
    var_builder: Option<VarBuilder<'a>>,
    device: Device,
    dtype: DType,
}

impl<'a> CouplingLayerBuilder<'a> {
    pub fn new(in_channels: usize) -> Self {
        Self {
            in_channels,
            mask_type: None,
            inverse_mask: false,
            scale_net: None,
            translate_net: None,
            scale_translate_net: None,
            network: ResNetConfig::default(),
            var_builder: None,
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    /// Mask type by name; validated in [`build`](Self::build).
    pub fn mask_type(mut self, mask_type: impl Into<String>) -> Self {
        self.mask_type = Some(mask_type.into());
        self
    }

    pub fn mask(self, mask_type: MaskType) -> Self {
        self.mask_type(mask_type.as_str())
    }

    pub fn inverse_mask(mut self, inverse_mask: bool) -> Self {
        self.inverse_mask = inverse_mask;
        self
    }

    pub fn scale_net(mut self, net: Arc<dyn ParameterNetwork>) -> Self {
        self.scale_net = Some(net);
        self
    }

    pub fn translate_net(mut self, net: Arc<dyn ParameterNetwork>) -> Self {
        self.translate_net = Some(net);
        self
    }

    pub fn scale_translate_net(mut self, net: Arc<dyn ParameterNetwork>) -> Self {
        self.scale_translate_net = Some(net);
        self
    }

    /// Hyper-parameters of the default residual network.
    pub fn network_config(mut self, network: ResNetConfig) -> Self {
        self.network = network;
        self
    }

    /// Registers default-network parameters under `vb` instead of a private `VarMap`.
    pub fn var_builder(mut self, vb: VarBuilder<'a>) -> Self {
        self.var_builder = Some(vb);
        self
    }

    /// Device and dtype of a privately owned default network.
    pub fn device(mut self, device: &Device, dtype: DType) -> Self {
        self.device = device.clone();
        self.dtype = dtype;
        self
    }

    pub fn build(self) -> Result<AffineCouplingLayer> {
        let mask_type: MaskType = self
            .mask_type
            .as_deref()
            .ok_or_else(|| CouplingError::configuration("mask_type is required"))?
            .parse()?;
        let config = CouplingConfig {
            in_channels: self.in_channels,
            mask_type,
            inverse_mask: self.inverse_mask,
            network: self.network,
        };
        config.validate()?;

        let (nets, varmap) = match (self.scale_net, self.translate_net, self.scale_translate_net) {
            (Some(scale), Some(translate), None) => (ParameterNets::split(scale, translate), None),
            (None, None, Some(net)) => (ParameterNets::combined(net), None),
            (None, None, None) => {
                log::info!(
                    "no parameter network supplied, building default resnet (mid_channels={}, num_blocks={})",
                    config.network.mid_channels,
                    config.network.num_blocks
                );
                match self.var_builder {
                    Some(vb) => (default_nets(&config, vb)?, None),
                    None => {
                        let varmap = VarMap::new();
                        let vb = VarBuilder::from_varmap(&varmap, self.dtype, &self.device);
                        (default_nets(&config, vb)?, Some(varmap))
                    }
                }
            }
            (Some(_), Some(_), Some(_)) => {
                return Err(CouplingError::configuration(
                    "supply either scale_net and translate_net or scale_translate_net, not both",
                ))
            }
            (Some(_), None, _) | (None, Some(_), _) => {
                return Err(CouplingError::configuration(
                    "scale_net and translate_net must be supplied together",
                ))
            }
        };

        let mut layer = AffineCouplingLayer::new(&config, nets)?;
        layer.varmap = varmap;
        Ok(layer)
    }
}
