//! Binary masks partitioning an input into identity and transformed elements.
//!
//! A mask holds `1.0` where the coupling layer passes the input through
//! unchanged and `0.0` where it applies the affine transform. Masks are cheap
//! to rebuild, so they are regenerated on every call from the input shape.

use std::{fmt, str::FromStr};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{CouplingError, Result};

/// Which axis the mask alternates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MaskType {
    /// Spatial mask alternating by parity of `row + col`.
    Checkerboard,
    /// Channel mask splitting the channel axis into two contiguous halves.
    ChannelWise,
}

impl MaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaskType::Checkerboard => "checkerboard",
            MaskType::ChannelWise => "channel_wise",
        }
    }
}

impl fmt::Display for MaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaskType {
    type Err = CouplingError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "checkerboard" => Ok(MaskType::Checkerboard),
            "channel_wise" => Ok(MaskType::ChannelWise),
            other => Err(CouplingError::configuration(format!(
                "unknown mask_type '{other}', expected 'channel_wise' or 'checkerboard'"
            ))),
        }
    }
}

impl TryFrom<String> for MaskType {
    type Error = CouplingError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MaskType> for String {
    fn from(value: MaskType) -> Self {
        value.as_str().to_string()
    }
}

/// Checkerboard mask of shape `(height, width)`.
///
/// Cell `(i, j)` is `((!inverse) + i + j) mod 2`: with `inverse = false` the
/// top-left cell is `1`.
pub fn checkerboard_mask(height: usize, width: usize, inverse: bool, device: &Device) -> Result<Tensor> {
    let offset = usize::from(!inverse);
    let data = (0..height)
        .flat_map(|i| (0..width).map(move |j| ((offset + i + j) % 2) as f32))
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(data, (height, width), device)?)
}

/// Channel mask of shape `(channels,)`.
///
/// The first `channels / 2` entries are `1` and the rest `0`; `inverse` swaps
/// which side is `1`. For odd counts the split point is still `channels / 2`.
pub fn channel_wise_mask(channels: usize, inverse: bool, device: &Device) -> Result<Tensor> {
    let split = channels / 2;
    let data = (0..channels)
        .map(|c| if (c < split) != inverse { 1.0f32 } else { 0.0 })
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(data, channels, device)?)
}

/// Builds the mask for an `(batch, channels, height, width)` input.
///
/// Checkerboard masks come back as `(1, 1, H, W)` and channel masks as
/// `(1, C, 1, 1)`, both on the input's device and in its dtype.
pub fn build_mask(x: &Tensor, mask_type: MaskType, inverse: bool) -> Result<Tensor> {
    let (_, channels, height, width) = match x.dims() {
        &[b, c, h, w] => (b, c, h, w),
        dims => {
            return Err(CouplingError::shape(
                "mask input",
                "(batch, channels, height, width)",
                dims,
            ))
        }
    };
    let device = x.device();
    let mask = match mask_type {
        MaskType::Checkerboard => {
            checkerboard_mask(height, width, inverse, device)?.reshape((1, 1, height, width))?
        }
        MaskType::ChannelWise => {
            channel_wise_mask(channels, inverse, device)?.reshape((1, channels, 1, 1))?
        }
    };
    Ok(mask.to_dtype(x.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, IndexOp};

    #[test]
    fn checkerboard_starts_with_one_and_alternates() -> Result<()> {
        let device = Device::Cpu;
        let mask = checkerboard_mask(5, 4, false, &device)?;
        assert_eq!(mask.dims(), &[5, 4]);
        assert_eq!(
            mask.to_vec2::<f32>()?,
            vec![
                vec![1.0, 0.0, 1.0, 0.0],
                vec![0.0, 1.0, 0.0, 1.0],
                vec![1.0, 0.0, 1.0, 0.0],
                vec![0.0, 1.0, 0.0, 1.0],
                vec![1.0, 0.0, 1.0, 0.0],
            ]
        );
        Ok(())
    }

    #[test]
    fn inverse_checkerboard_is_the_complement() -> Result<()> {
        let device = Device::Cpu;
        let mask = checkerboard_mask(5, 4, false, &device)?;
        let inverse = checkerboard_mask(5, 4, true, &device)?;
        let sum = (mask + &inverse)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sum.iter().all(|v| *v == 1.0));
        assert_eq!(inverse.i((0, 0))?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn channel_wise_splits_into_halves() -> Result<()> {
        let device = Device::Cpu;
        assert_eq!(
            channel_wise_mask(6, false, &device)?.to_vec1::<f32>()?,
            vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(
            channel_wise_mask(6, true, &device)?.to_vec1::<f32>()?,
            vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]
        );
        Ok(())
    }

    #[test]
    fn odd_channel_counts_split_at_floor_half() -> Result<()> {
        let device = Device::Cpu;
        assert_eq!(
            channel_wise_mask(5, false, &device)?.to_vec1::<f32>()?,
            vec![1.0, 1.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(
            channel_wise_mask(5, true, &device)?.to_vec1::<f32>()?,
            vec![0.0, 0.0, 1.0, 1.0, 1.0]
        );
        assert_eq!(channel_wise_mask(1, false, &device)?.to_vec1::<f32>()?, vec![0.0]);
        Ok(())
    }

    #[test]
    fn masks_partition_every_element() -> Result<()> {
        let device = Device::Cpu;
        let masks = [
            checkerboard_mask(3, 7, false, &device)?,
            checkerboard_mask(6, 2, true, &device)?,
            channel_wise_mask(7, false, &device)?,
            channel_wise_mask(4, true, &device)?,
        ];
        for mask in masks {
            let complement = mask.affine(-1.0, 1.0)?;
            let union = (&mask + &complement)?.flatten_all()?.to_vec1::<f32>()?;
            let overlap = (&mask * &complement)?.flatten_all()?.to_vec1::<f32>()?;
            assert!(union.iter().all(|v| *v == 1.0));
            assert!(overlap.iter().all(|v| *v == 0.0));
        }
        Ok(())
    }

    #[test]
    fn build_mask_reshapes_for_broadcasting() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 4, 3, 5), DType::F16, &device)?;

        let spatial = build_mask(&x, MaskType::Checkerboard, true)?;
        assert_eq!(spatial.dims(), &[1, 1, 3, 5]);
        assert_eq!(spatial.dtype(), DType::F16);

        let channel = build_mask(&x, MaskType::ChannelWise, false)?;
        assert_eq!(channel.dims(), &[1, 4, 1, 1]);
        assert_eq!(
            channel.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
            vec![1.0, 1.0, 0.0, 0.0]
        );
        Ok(())
    }

    #[test]
    fn build_mask_rejects_non_image_input() -> Result<()> {
        let x = Tensor::zeros((2, 4), DType::F32, &Device::Cpu)?;
        let err = build_mask(&x, MaskType::ChannelWise, false).unwrap_err();
        assert!(matches!(err, CouplingError::ShapeMismatch { .. }));
        Ok(())
    }

    #[test]
    fn mask_type_parses_known_names_only() {
        assert_eq!("checkerboard".parse::<MaskType>().ok(), Some(MaskType::Checkerboard));
        assert_eq!("channel_wise".parse::<MaskType>().ok(), Some(MaskType::ChannelWise));
        let err = "invalid".parse::<MaskType>().unwrap_err();
        assert!(matches!(err, CouplingError::Configuration(_)));
        assert_eq!(MaskType::ChannelWise.to_string(), "channel_wise");
    }
}
