//! Precision and dtype policy utilities used throughout the layers crate.
//!
//! Inputs to a flow may be stored in `f16`/`bf16`, but exponentials of the
//! predicted log-scales and the log-determinant sums are numerically touchy, so
//! the compute path promotes to `f32` and reductions always run in at least
//! `f32`. [`PrecisionPolicy`] bundles those three dtypes so every layer casts
//! the same way before convolutions, exponentials, reductions, and outputs.

use candle_core::{DType, Result, Tensor};

/// Tolerances used when comparing tensors produced under a policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionEpsilons {
    /// Tolerance for tensors in the storage dtype.
    pub storage: f32,
    /// Tolerance for intermediate convolution/activation results.
    pub compute: f32,
    /// Tolerance for statistics computed during reductions.
    pub reduction: f32,
}

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the dtype tensors are stored in.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let reduction = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self::new(storage, compute, reduction)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for convolutions, exponentials and activations.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for reductions such as batch statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether the policy performs mixed precision work.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Tolerance values derived from the configured dtypes.
    pub fn epsilons(&self) -> PrecisionEpsilons {
        PrecisionEpsilons {
            storage: epsilon_for(self.storage),
            compute: epsilon_for(self.compute),
            reduction: epsilon_for(self.reduction),
        }
    }

    /// Casts a tensor to the compute dtype.
    pub fn cast_for_compute(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }

    /// Sums every non-batch element of `tensor`, yielding one value per sample.
    ///
    /// The sum runs in the reduction dtype and the `(batch,)` result stays in
    /// it, since per-sample log-likelihood terms are accumulated downstream.
    pub fn reduce_per_sample(&self, tensor: &Tensor) -> Result<Tensor> {
        let promoted = self.cast_for_reduction(tensor)?;
        if promoted.rank() <= 1 {
            return Ok(promoted);
        }
        promoted.flatten_from(1)?.sum(1)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}
