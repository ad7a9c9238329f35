//! Matmul primitive descriptor: validation and derived state.
//!
//! [`MatmulPd::create`] runs the ordered support checks against an operation
//! descriptor and attribute set. On success it records the resolved operand
//! types, the auxiliary buffer shapes and their "defined" flags. A rejection
//! is always [`ForgeError::UnsupportedConfiguration`] naming the failed
//! check.

use crate::attr::{EltwiseAlg, PostOp, PostOpKind, PrimitiveAttr, SkipMask};
use crate::desc::MatmulDesc;
use crate::error::{ForgeError, ForgeResult};
use crate::matmul::aux_params::{AuxArray, AuxBufferDesc, AuxParam};
use crate::types::DataType;
use crate::unsupported;

/// Validated, immutable configuration of one matmul primitive
#[derive(Debug, Clone, PartialEq)]
pub struct MatmulPd {
    desc: MatmulDesc,
    attr: PrimitiveAttr,
    src_dt: DataType,
    wei_dt: DataType,
    dst_dt: DataType,
    bia_dt: DataType,
    eltwise_idx: Option<usize>,
    non_default_attrs: bool,
    is_defined: AuxArray<bool>,
    aux_mds: AuxArray<AuxBufferDesc>,
}

impl MatmulPd {
    /// Validate `desc` and `attr` and derive the descriptor state
    pub fn create(desc: MatmulDesc, attr: PrimitiveAttr) -> ForgeResult<Self> {
        let mut desc = desc;
        let src_dt = desc.src().data_type();
        let wei_dt = desc.weights().data_type();
        let dst_dt = desc.dst().data_type();
        let bia_dt = desc.bias().map(|b| b.data_type()).unwrap_or(DataType::F32);

        check_zero_points(&desc, &attr)?;
        if !attr.has_default_values_except(
            SkipMask::OSCALE_RUNTIME | SkipMask::ZERO_POINTS_RUNTIME | SkipMask::POST_OPS,
        ) {
            return Err(reject("only output scales, zero-points and post-ops are supported"));
        }
        check_output_scales(&desc, &attr)?;
        check_post_ops(&attr)?;
        if !desc.set_default_formats() {
            return Err(reject("memory formats could not be resolved"));
        }
        let bias = desc.with_bias().then_some(bia_dt);
        if !data_types_supported(src_dt, wei_dt, dst_dt, bias) {
            return Err(reject(&format!(
                "data types src={} weights={} dst={} bias={:?} are in no supported family",
                src_dt,
                wei_dt,
                dst_dt,
                bias.map(|dt| dt.to_string())
            )));
        }

        let zero_points = attr.zero_points();
        let is_defined = AuxArray::from_fn(|param| match param.zero_point_role() {
            None => !attr.output_scales().has_default_values(),
            Some(role) => !zero_points.has_default_values_for(role),
        });
        let aux_mds = AuxArray::from_fn(|param| AuxBufferDesc {
            data_type: param.data_type(),
            len: match param {
                AuxParam::Scales if is_defined[param] => attr.output_scales().count(),
                // Zero-points always stage a single common value
                _ => 1,
            },
        });

        let pd = Self {
            non_default_attrs: !attr.has_default_values(),
            eltwise_idx: attr.post_ops().find(PostOpKind::Eltwise),
            desc,
            attr,
            src_dt,
            wei_dt,
            dst_dt,
            bia_dt,
            is_defined,
            aux_mds,
        };
        tracing::debug!(
            src = %pd.src_dt,
            weights = %pd.wei_dt,
            dst = %pd.dst_dt,
            acc = %pd.desc.accum_data_type(),
            non_default_attrs = pd.non_default_attrs,
            "matmul descriptor accepted"
        );
        Ok(pd)
    }

    pub fn desc(&self) -> &MatmulDesc {
        &self.desc
    }

    pub fn attr(&self) -> &PrimitiveAttr {
        &self.attr
    }

    pub fn src_dt(&self) -> DataType {
        self.src_dt
    }

    pub fn wei_dt(&self) -> DataType {
        self.wei_dt
    }

    pub fn dst_dt(&self) -> DataType {
        self.dst_dt
    }

    /// Bias type; f32 when there is no bias
    pub fn bia_dt(&self) -> DataType {
        self.bia_dt
    }

    pub fn acc_dt(&self) -> DataType {
        self.desc.accum_data_type()
    }

    pub fn with_bias(&self) -> bool {
        self.desc.with_bias()
    }

    pub fn batched(&self) -> bool {
        self.desc.batched()
    }

    /// True when the attribute set is non-default at all
    pub fn non_default_attrs(&self) -> bool {
        self.non_default_attrs
    }

    pub fn is_defined(&self, param: AuxParam) -> bool {
        self.is_defined[param]
    }

    pub fn aux_md(&self, param: AuxParam) -> AuxBufferDesc {
        self.aux_mds[param]
    }

    pub fn scales_md(&self) -> AuxBufferDesc {
        self.aux_mds[AuxParam::Scales]
    }

    /// Zero-point buffer shape; `None` for [`AuxParam::Scales`]
    pub fn zero_points_md(&self, param: AuxParam) -> Option<AuxBufferDesc> {
        param.zero_point_role().map(|_| self.aux_mds[param])
    }

    pub fn with_sum(&self) -> bool {
        self.attr.post_ops().contain(PostOpKind::Sum, 0)
    }

    pub fn with_eltwise(&self, position: usize) -> bool {
        self.attr.post_ops().contain(PostOpKind::Eltwise, position)
    }

    fn eltwise(&self) -> Option<&PostOp> {
        self.eltwise_idx.and_then(|idx| self.attr.post_ops().entry(idx))
    }

    pub fn eltwise_alpha(&self) -> f32 {
        match self.eltwise() {
            Some(PostOp::Eltwise { alpha, .. }) => *alpha,
            _ => 1.0,
        }
    }

    pub fn eltwise_beta(&self) -> f32 {
        match self.eltwise() {
            Some(PostOp::Eltwise { beta, .. }) => *beta,
            _ => 0.0,
        }
    }

    pub fn eltwise_scale(&self) -> f32 {
        match self.eltwise() {
            Some(PostOp::Eltwise { scale, .. }) => *scale,
            _ => 1.0,
        }
    }

    /// Elementwise algorithm; `None` is undef
    pub fn eltwise_alg_kind(&self) -> Option<EltwiseAlg> {
        match self.eltwise() {
            Some(PostOp::Eltwise { alg, .. }) => Some(*alg),
            _ => None,
        }
    }

    /// Scale of a sum post-op at position 0, else 0
    pub fn sum_scale(&self) -> f32 {
        match self.attr.post_ops().entry(0) {
            Some(PostOp::Sum { scale }) => *scale,
            _ => 0.0,
        }
    }

    /// Stride between consecutive output columns in the scale buffer
    pub fn scale_stride(&self) -> usize {
        if self.attr.output_scales().mask() == 0 {
            0
        } else {
            1
        }
    }
}

fn reject(reason: &str) -> ForgeError {
    tracing::debug!(reason, "matmul descriptor rejected");
    unsupported!(reason)
}

fn check_zero_points(desc: &MatmulDesc, attr: &PrimitiveAttr) -> ForgeResult<()> {
    let zero_points = attr.zero_points();
    if desc.accum_data_type() == DataType::S32 {
        if !zero_points.common() {
            return Err(reject("zero-points must be common (mask 0) for s32 accumulation"));
        }
    } else if !zero_points.has_default_values() {
        return Err(reject("zero-points require s32 accumulation"));
    }
    Ok(())
}

fn check_output_scales(desc: &MatmulDesc, attr: &PrimitiveAttr) -> ForgeResult<()> {
    let scales = attr.output_scales();
    let per_n_mask = 1 << (desc.batched() as i32 + 1);
    if scales.mask() != 0 && scales.mask() != per_n_mask {
        return Err(reject(&format!(
            "output scale mask {} is neither 0 nor {}",
            scales.mask(),
            per_n_mask
        )));
    }
    if scales.mask() == per_n_mask && scales.count() != desc.n() {
        return Err(reject(&format!(
            "per-N output scales need {} values, got {}",
            desc.n(),
            scales.count()
        )));
    }
    Ok(())
}

fn check_post_ops(attr: &PrimitiveAttr) -> ForgeResult<()> {
    let post_ops = attr.post_ops();
    let ok = match post_ops.len() {
        0 => true,
        1 => post_ops.contain(PostOpKind::Sum, 0) || post_ops.contain(PostOpKind::Eltwise, 0),
        2 => post_ops.contain(PostOpKind::Sum, 0) && post_ops.contain(PostOpKind::Eltwise, 1),
        _ => false,
    };
    if !ok {
        let kinds: Vec<_> = post_ops.entries().iter().map(|e| e.kind()).collect();
        return Err(reject(&format!("unsupported post-op sequence {:?}", kinds)));
    }
    Ok(())
}

/// Membership in the quantized or the uniform-precision data-type family
///
/// `bias` is `None` when the problem has no bias.
pub fn data_types_supported(
    src: DataType,
    wei: DataType,
    dst: DataType,
    bias: Option<DataType>,
) -> bool {
    use DataType::*;

    let quantized = matches!(src, U8 | S8)
        && matches!(wei, U8 | S8)
        && matches!(dst, F32 | S8 | U8 | S32)
        && bias.map_or(true, |b| matches!(b, F32 | U8 | S8 | S32));

    let uniform = ((src == F32 && wei == F32 && dst == F32)
        || (src == F16 && wei == F16 && dst == F16)
        || (src == Bf16 && wei == Bf16 && matches!(dst, Bf16 | F32)))
        && bias.map_or(true, |b| b == F32);

    quantized || uniform
}
