//! Operation descriptor for matrix multiplication.
//!
//! `dst[(D0,) M, N] = src[(D0,) M, K] x weights[(D0|1,) K, N] (+ bias)`

pub mod memory;

use crate::error::ForgeResult;
use crate::invalid_args;
use crate::types::DataType;

pub use memory::{dense_strides, MemoryDesc};

/// Shape- and type-level description of one matmul
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatmulDesc {
    src: MemoryDesc,
    weights: MemoryDesc,
    bias: Option<MemoryDesc>,
    dst: MemoryDesc,
    accum_data_type: DataType,
}

impl MatmulDesc {
    /// Build a descriptor, checking shape consistency
    ///
    /// The accumulation type defaults from the operand types; see
    /// [`default_accum_data_type`].
    pub fn new(
        src: MemoryDesc,
        weights: MemoryDesc,
        bias: Option<MemoryDesc>,
        dst: MemoryDesc,
    ) -> ForgeResult<Self> {
        check_shapes(&src, &weights, bias.as_ref(), &dst)?;
        let accum_data_type =
            default_accum_data_type(src.data_type(), weights.data_type(), dst.data_type());
        Ok(Self {
            src,
            weights,
            bias,
            dst,
            accum_data_type,
        })
    }

    /// Override the accumulation data type
    pub fn with_accum_data_type(mut self, accum_data_type: DataType) -> Self {
        self.accum_data_type = accum_data_type;
        self
    }

    pub fn src(&self) -> &MemoryDesc {
        &self.src
    }

    pub fn weights(&self) -> &MemoryDesc {
        &self.weights
    }

    pub fn bias(&self) -> Option<&MemoryDesc> {
        self.bias.as_ref()
    }

    pub fn dst(&self) -> &MemoryDesc {
        &self.dst
    }

    pub fn accum_data_type(&self) -> DataType {
        self.accum_data_type
    }

    pub fn with_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn ndims(&self) -> usize {
        self.dst.ndims()
    }

    /// True for 3D problems with a leading batch dimension
    pub fn batched(&self) -> bool {
        self.ndims() == 3
    }

    pub fn batch(&self) -> usize {
        if self.batched() {
            self.dst.dims()[0]
        } else {
            1
        }
    }

    pub fn m(&self) -> usize {
        self.dst.dims()[self.ndims() - 2]
    }

    pub fn n(&self) -> usize {
        self.dst.dims()[self.ndims() - 1]
    }

    pub fn k(&self) -> usize {
        self.src.dims()[self.ndims() - 1]
    }

    /// Resolve every "any" layout to dense row-major
    pub(crate) fn set_default_formats(&mut self) -> bool {
        let mut ok = self.src.set_default_format()
            && self.weights.set_default_format()
            && self.dst.set_default_format();
        if let Some(bias) = self.bias.as_mut() {
            ok = ok && bias.set_default_format();
        }
        ok
    }
}

/// Accumulation type implied by the operand types
///
/// Integer sources and weights accumulate in s32, an all-f16 problem in
/// f16, everything else in f32.
pub fn default_accum_data_type(src: DataType, weights: DataType, dst: DataType) -> DataType {
    if src.is_int8() && weights.is_int8() {
        DataType::S32
    } else if src == DataType::F16 && weights == DataType::F16 && dst == DataType::F16 {
        DataType::F16
    } else {
        DataType::F32
    }
}

fn check_shapes(
    src: &MemoryDesc,
    weights: &MemoryDesc,
    bias: Option<&MemoryDesc>,
    dst: &MemoryDesc,
) -> ForgeResult<()> {
    let ndims = dst.ndims();
    if ndims != 2 && ndims != 3 {
        return Err(invalid_args!("matmul supports 2D or 3D tensors, got {}D", ndims));
    }
    if src.ndims() != ndims || weights.ndims() != ndims {
        return Err(invalid_args!(
            "rank mismatch: src {}D, weights {}D, dst {}D",
            src.ndims(),
            weights.ndims(),
            ndims
        ));
    }

    let (sd, wd, dd) = (src.dims(), weights.dims(), dst.dims());
    let (m, k, n) = (sd[ndims - 2], sd[ndims - 1], wd[ndims - 1]);
    if wd[ndims - 2] != k {
        return Err(invalid_args!("K mismatch: src K={} weights K={}", k, wd[ndims - 2]));
    }
    if dd[ndims - 2] != m || dd[ndims - 1] != n {
        return Err(invalid_args!(
            "dst dims {:?} do not match M={} N={}",
            dd,
            m,
            n
        ));
    }
    if ndims == 3 {
        if sd[0] != dd[0] {
            return Err(invalid_args!("batch mismatch: src {} dst {}", sd[0], dd[0]));
        }
        if wd[0] != dd[0] && wd[0] != 1 {
            return Err(invalid_args!(
                "weights batch {} must be 1 or equal dst batch {}",
                wd[0],
                dd[0]
            ));
        }
    }

    if let Some(bias) = bias {
        if bias.ndims() != ndims {
            return Err(invalid_args!("bias rank {} does not match dst rank {}", bias.ndims(), ndims));
        }
        let broadcast_ok = bias
            .dims()
            .iter()
            .zip(dd.iter())
            .all(|(&b, &d)| b == 1 || b == d);
        if !broadcast_ok {
            return Err(invalid_args!(
                "bias dims {:?} are not broadcastable to dst dims {:?}",
                bias.dims(),
                dd
            ));
        }
    }
    Ok(())
}
