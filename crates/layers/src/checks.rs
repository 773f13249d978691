//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. Every helper takes a `label` naming the
//! tensor being checked so failures point at the offending parameter. They
//! return `candle_core::Result<()>` so call sites can propagate errors without
//! panicking.

use candle_core::{Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Validates the `(batch, channels, height, width)` convention with a known channel count.
pub fn expect_nchw(label: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    match tensor.dims() {
        [batch, actual, height, width]
            if *actual == channels && *batch > 0 && *height > 0 && *width > 0 =>
        {
            Ok(())
        }
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, {channels}, height, width) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks two tensors share a dtype.
pub fn expect_same_dtype(label: &str, tensor: &Tensor, other_label: &str, other: &Tensor) -> Result<()> {
    if tensor.dtype() == other.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label} ({:?}) and {other_label} ({:?}) must share a dtype",
            tensor.dtype(),
            other.dtype()
        )))
    }
}
