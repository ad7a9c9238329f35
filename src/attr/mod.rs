//! Primitive attributes: output scales, zero-points and post-ops.
//!
//! An attribute set starts out default. Each setter records a non-default
//! value; the matmul validator then decides which of the non-default parts
//! it can honour.

pub mod post_ops;

use std::collections::BTreeMap;
use std::ops::BitOr;

use crate::error::ForgeResult;
use crate::invalid_args;
use crate::types::ArgRole;

pub use post_ops::{EltwiseAlg, PostOp, PostOpKind, PostOps, POST_OPS_CAPACITY};

/// Output scaling applied to the accumulated result
#[derive(Debug, Clone, PartialEq)]
pub struct OutputScales {
    mask: i32,
    scales: Vec<f32>,
}

impl Default for OutputScales {
    fn default() -> Self {
        Self {
            mask: 0,
            scales: vec![1.0],
        }
    }
}

impl OutputScales {
    /// Dimension mask: 0 for one common scale, otherwise one bit per scaled dimension
    pub fn mask(&self) -> i32 {
        self.mask
    }

    pub fn count(&self) -> usize {
        self.scales.len()
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn has_default_values(&self) -> bool {
        self.mask == 0 && self.scales.len() == 1 && self.scales[0] == 1.0
    }
}

/// Zero-point of one operand role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZeroPoint {
    pub mask: i32,
    pub values: Vec<i32>,
}

/// Zero-points for the source, weights and destination operands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZeroPoints {
    src: Option<ZeroPoint>,
    weights: Option<ZeroPoint>,
    dst: Option<ZeroPoint>,
}

impl ZeroPoints {
    fn slot(&self, role: ArgRole) -> Option<&ZeroPoint> {
        match role {
            ArgRole::Src => self.src.as_ref(),
            ArgRole::Weights => self.weights.as_ref(),
            ArgRole::Dst => self.dst.as_ref(),
            ArgRole::Bias => None,
        }
    }

    fn slot_mut(&mut self, role: ArgRole) -> ForgeResult<&mut Option<ZeroPoint>> {
        match role {
            ArgRole::Src => Ok(&mut self.src),
            ArgRole::Weights => Ok(&mut self.weights),
            ArgRole::Dst => Ok(&mut self.dst),
            ArgRole::Bias => Err(invalid_args!("zero-points are not defined for {}", role)),
        }
    }

    /// Zero-point values of `role`, `None` when it is default
    pub fn get(&self, role: ArgRole) -> Option<&[i32]> {
        self.slot(role).map(|zp| zp.values.as_slice())
    }

    pub fn mask(&self, role: ArgRole) -> i32 {
        self.slot(role).map(|zp| zp.mask).unwrap_or(0)
    }

    /// True when `role` has no zero-point set
    pub fn has_default_values_for(&self, role: ArgRole) -> bool {
        self.slot(role).is_none()
    }

    /// True when no role has a zero-point set
    pub fn has_default_values(&self) -> bool {
        self.src.is_none() && self.weights.is_none() && self.dst.is_none()
    }

    /// True when every set zero-point is a single value common to the whole tensor
    pub fn common(&self) -> bool {
        [&self.src, &self.weights, &self.dst]
            .into_iter()
            .flatten()
            .all(|zp| zp.mask == 0)
    }
}

/// Quantization parameters of RNN data; not supported by matmul
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RnnDataQparams {
    pub scale: f32,
    pub shift: f32,
}

/// Set of attribute kinds allowed to be non-default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipMask(u32);

impl SkipMask {
    pub const NONE: SkipMask = SkipMask(0);
    pub const OSCALE_RUNTIME: SkipMask = SkipMask(1 << 0);
    pub const ZERO_POINTS_RUNTIME: SkipMask = SkipMask(1 << 1);
    pub const POST_OPS: SkipMask = SkipMask(1 << 2);
    pub const ARG_SCALES: SkipMask = SkipMask(1 << 3);
    pub const RNN_DATA_QPARAMS: SkipMask = SkipMask(1 << 4);

    pub fn contains(&self, other: SkipMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SkipMask {
    type Output = SkipMask;

    fn bitor(self, rhs: SkipMask) -> SkipMask {
        SkipMask(self.0 | rhs.0)
    }
}

/// Full attribute set of a primitive
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimitiveAttr {
    output_scales: OutputScales,
    zero_points: ZeroPoints,
    post_ops: PostOps,
    arg_scales: BTreeMap<ArgRole, f32>,
    rnn_data_qparams: Option<RnnDataQparams>,
}

impl PrimitiveAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set output scales; `scales` must not be empty
    pub fn set_output_scales(&mut self, mask: i32, scales: Vec<f32>) -> ForgeResult<()> {
        if scales.is_empty() {
            return Err(invalid_args!("output scales require at least one value"));
        }
        if mask < 0 {
            return Err(invalid_args!("negative output scale mask {}", mask));
        }
        self.output_scales = OutputScales { mask, scales };
        Ok(())
    }

    /// Set the zero-point of `role`; `values` must not be empty
    pub fn set_zero_points(&mut self, role: ArgRole, mask: i32, values: Vec<i32>) -> ForgeResult<()> {
        if values.is_empty() {
            return Err(invalid_args!("zero-point for {} requires at least one value", role));
        }
        *self.zero_points.slot_mut(role)? = Some(ZeroPoint { mask, values });
        Ok(())
    }

    /// Set a per-argument scale (an attribute kind matmul rejects)
    pub fn set_arg_scale(&mut self, role: ArgRole, scale: f32) {
        self.arg_scales.insert(role, scale);
    }

    /// Set RNN data quantization parameters (an attribute kind matmul rejects)
    pub fn set_rnn_data_qparams(&mut self, scale: f32, shift: f32) {
        self.rnn_data_qparams = Some(RnnDataQparams { scale, shift });
    }

    pub fn post_ops_mut(&mut self) -> &mut PostOps {
        &mut self.post_ops
    }

    pub fn set_post_ops(&mut self, post_ops: PostOps) {
        self.post_ops = post_ops;
    }

    pub fn output_scales(&self) -> &OutputScales {
        &self.output_scales
    }

    pub fn zero_points(&self) -> &ZeroPoints {
        &self.zero_points
    }

    pub fn post_ops(&self) -> &PostOps {
        &self.post_ops
    }

    /// True when every attribute kind not listed in `skip` is default
    pub fn has_default_values_except(&self, skip: SkipMask) -> bool {
        (skip.contains(SkipMask::OSCALE_RUNTIME) || self.output_scales.has_default_values())
            && (skip.contains(SkipMask::ZERO_POINTS_RUNTIME)
                || self.zero_points.has_default_values())
            && (skip.contains(SkipMask::POST_OPS) || self.post_ops.has_default_values())
            && (skip.contains(SkipMask::ARG_SCALES) || self.arg_scales.is_empty())
            && (skip.contains(SkipMask::RNN_DATA_QPARAMS) || self.rnn_data_qparams.is_none())
    }

    /// True when the whole attribute set is default
    pub fn has_default_values(&self) -> bool {
        self.has_default_values_except(SkipMask::NONE)
    }
}
