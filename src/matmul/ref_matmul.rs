//! Reference matmul primitive: kernel specialization, resource staging and
//! dispatch.

use std::sync::Arc;

use crate::backend::{
    Binary, ComputeEngine, KernelArg, KernelArgList, KernelCtx, MappedRegion, MemoryStorage,
    NdRange,
};
use crate::desc::MemoryDesc;
use crate::error::{ForgeError, ForgeResult};
use crate::exec::ExecCtx;
use crate::internal_error;
use crate::matmul::aux_params::{AuxArray, AuxParam};
use crate::matmul::kernel_abi as abi;
use crate::matmul::pd::MatmulPd;
use crate::matmul::REF_MATMUL_KERNEL_NAME;
use crate::resource::{PrimitiveId, Resource, ResourceKey, ResourceMapper};
use crate::types::ArgRole;

/// Project a validated descriptor onto the kernel's compile-time definitions
pub fn build_kernel_ctx(pd: &MatmulPd) -> KernelCtx {
    let mut ctx = KernelCtx::new();
    ctx.define_int("WITH_BIAS", pd.with_bias() as i64);
    ctx.define_int("NON_DEFAULT_ATTRS", pd.non_default_attrs() as i64);
    ctx.define_int("DO_SUM", pd.with_sum() as i64);
    ctx.define_int("WITH_ELTWISE", (pd.with_eltwise(0) || pd.with_eltwise(1)) as i64);

    ctx.set_data_type(pd.dst_dt());
    ctx.def_postops(pd.eltwise_alg_kind());
    ctx.define_float("ELTWISE_ALPHA", pd.eltwise_alpha());
    ctx.define_float("ELTWISE_BETA", pd.eltwise_beta());
    ctx.define_float("ELTWISE_SCALE", pd.eltwise_scale());

    ctx.def_data_type(pd.src_dt(), "SRC");
    ctx.def_data_type(pd.wei_dt(), "WEI");
    ctx.def_data_type(pd.dst_dt(), "DST");
    ctx.def_data_type(pd.bia_dt(), "BIA");
    ctx.def_data_type(pd.acc_dt(), "ACC");
    ctx
}

/// A compiled reference matmul
///
/// Owns its descriptor and binary. Per-engine resources live in the mapper
/// and are released when the primitive is dropped.
#[derive(Debug)]
pub struct RefMatmul {
    id: PrimitiveId,
    pd: MatmulPd,
    kernel_ctx: KernelCtx,
    binary: Binary,
    mapper: Arc<ResourceMapper>,
}

impl RefMatmul {
    /// Specialize and compile the kernel for `pd`
    pub fn create(
        pd: MatmulPd,
        engine: &dyn ComputeEngine,
        mapper: Arc<ResourceMapper>,
    ) -> ForgeResult<Self> {
        let kernel_ctx = build_kernel_ctx(&pd);
        let binary = engine
            .create_binary(REF_MATMUL_KERNEL_NAME, &kernel_ctx)?
            .ok_or_else(|| {
                ForgeError::CompilationFailed(format!(
                    "{} produced no binary for {}",
                    engine.name(),
                    REF_MATMUL_KERNEL_NAME
                ))
            })?;

        let id = PrimitiveId::next();
        tracing::info!(
            primitive = %id,
            engine = %engine.id(),
            defines = kernel_ctx.len(),
            "compiled {}",
            REF_MATMUL_KERNEL_NAME
        );
        Ok(Self {
            id,
            pd,
            kernel_ctx,
            binary,
            mapper,
        })
    }

    pub fn id(&self) -> PrimitiveId {
        self.id
    }

    pub fn pd(&self) -> &MatmulPd {
        &self.pd
    }

    pub fn kernel_ctx(&self) -> &KernelCtx {
        &self.kernel_ctx
    }

    pub fn binary(&self) -> &Binary {
        &self.binary
    }

    pub fn mapper(&self) -> &Arc<ResourceMapper> {
        &self.mapper
    }

    /// Stage the kernel and auxiliary buffers on `engine`, once
    pub fn create_resource(&self, engine: &dyn ComputeEngine) -> ForgeResult<()> {
        let key = ResourceKey::new(self.id, engine.id());
        if self.mapper.has_resource(key)? {
            return Ok(());
        }
        engine.register_mapper(Arc::downgrade(&self.mapper));
        self.mapper
            .get_or_try_create(key, || self.build_resource(engine))?;
        Ok(())
    }

    fn build_resource(&self, engine: &dyn ComputeEngine) -> ForgeResult<Resource> {
        let kernel = engine.create_kernel(&self.binary)?;
        let storages = AuxArray::try_from_fn(|param| self.stage_runtime_value(engine, param))?;
        tracing::info!(primitive = %self.id, engine = %engine.id(), "staged matmul resource");
        Ok(Resource::new(kernel, storages))
    }

    /// Allocate and fill the buffer of one auxiliary parameter
    ///
    /// Undefined parameters get the neutral value (1.0 scale, 0 zero-point);
    /// defined ones copy the attribute values.
    pub fn stage_runtime_value(
        &self,
        engine: &dyn ComputeEngine,
        param: AuxParam,
    ) -> ForgeResult<Arc<dyn MemoryStorage>> {
        let md = self.pd.aux_md(param);
        let storage = engine.create_memory_storage(md.size())?;

        let mut region = MappedRegion::map(storage.as_ref()).map_err(runtime_error)?;
        match (self.pd.is_defined(param), param.zero_point_role()) {
            (false, None) => {
                region.fill(1.0f32);
            }
            (false, Some(_)) => {
                region.fill(0i32);
            }
            (true, None) => region.write(self.pd.attr().output_scales().scales())?,
            (true, Some(role)) => {
                let values = self.pd.attr().zero_points().get(role).unwrap_or(&[]);
                region.write(&values[..md.len.min(values.len())])?;
            }
        }
        region.unmap().map_err(runtime_error)?;

        tracing::trace!(
            primitive = %self.id,
            param = param.name(),
            len = md.len,
            defined = self.pd.is_defined(param),
            "staged auxiliary buffer"
        );
        Ok(storage)
    }

    /// Launch the kernel once on `ctx.engine`
    pub fn execute(&self, ctx: &ExecCtx<'_>) -> ForgeResult<()> {
        let key = ResourceKey::new(self.id, ctx.engine.id());
        let resource = self.mapper.get(key)?.ok_or_else(|| {
            ForgeError::ResourceNotCreated(format!(
                "{} has no resource on {}",
                self.id,
                ctx.engine.id()
            ))
        })?;

        let args = self.kernel_args(ctx, &resource)?;
        let desc = self.pd.desc();
        let range = NdRange::new([desc.batch(), desc.m(), desc.n()]);

        ctx.engine
            .parallel_for(resource.kernel(), &range, &args)
            .map_err(|err| {
                tracing::error!(primitive = %self.id, engine = %ctx.engine.id(), %err, "matmul launch failed");
                match err {
                    ForgeError::KernelLaunchFailed(_) => err,
                    other => ForgeError::KernelLaunchFailed(other.to_string()),
                }
            })
    }

    fn kernel_args(&self, ctx: &ExecCtx<'_>, resource: &Resource) -> ForgeResult<KernelArgList> {
        let pd = &self.pd;
        let desc = pd.desc();
        let src = ctx.args.required(ArgRole::Src)?;
        let wei = ctx.args.required(ArgRole::Weights)?;
        let dst = ctx.args.required(ArgRole::Dst)?;
        let bia = match desc.bias() {
            Some(_) => Some(Arc::clone(ctx.args.required(ArgRole::Bias)?)),
            None => None,
        };

        let mut args = KernelArgList::with_len(abi::ARG_COUNT);
        args.set(abi::SRC, KernelArg::memory(src))?;
        args.set(abi::WEI, KernelArg::memory(wei))?;
        args.set(abi::BIA, KernelArg::Memory(bia))?;
        args.set(abi::DST, KernelArg::memory(dst))?;
        args.set(abi::A0, KernelArg::memory(resource.storage(AuxParam::SrcZeroPoint)))?;
        args.set(abi::B0, KernelArg::memory(resource.storage(AuxParam::WeiZeroPoint)))?;
        args.set(abi::C0, KernelArg::memory(resource.storage(AuxParam::DstZeroPoint)))?;
        args.set(abi::SCALES, KernelArg::memory(resource.storage(AuxParam::Scales)))?;
        args.set(abi::SCALE_STRIDE, KernelArg::Int(pd.scale_stride() as i64))?;

        args.set(abi::K, KernelArg::Int(desc.k() as i64))?;
        args.set(abi::N, KernelArg::Int(desc.n() as i64))?;
        args.set(abi::M, KernelArg::Int(desc.m() as i64))?;
        args.set(abi::D0, KernelArg::Int(desc.batch() as i64))?;

        let bias_strides = match desc.bias() {
            Some(bias) => kernel_strides(bias)?,
            None => [0; 3],
        };
        for (first, strides) in [
            (abi::SRC_STRIDE_D0, kernel_strides(desc.src())?),
            (abi::WEI_STRIDE_D0, kernel_strides(desc.weights())?),
            (abi::BIA_STRIDE_D0, bias_strides),
            (abi::DST_STRIDE_D0, kernel_strides(desc.dst())?),
        ] {
            for (i, stride) in strides.into_iter().enumerate() {
                args.set(first + i, KernelArg::Int(stride))?;
            }
        }

        args.set(abi::ELTWISE_ALPHA, KernelArg::Float(pd.eltwise_alpha()))?;
        args.set(abi::ELTWISE_BETA, KernelArg::Float(pd.eltwise_beta()))?;
        args.set(abi::ELTWISE_SCALE, KernelArg::Float(pd.eltwise_scale()))?;
        args.set(abi::SUM_SCALE, KernelArg::Float(pd.sum_scale()))?;
        Ok(args)
    }
}

impl Drop for RefMatmul {
    fn drop(&mut self) {
        if let Err(err) = self.mapper.release_primitive(self.id) {
            tracing::warn!(primitive = %self.id, %err, "failed to release resources");
        }
    }
}

/// Element strides over the kernel's three logical dims; broadcast dims get 0
fn kernel_strides(md: &MemoryDesc) -> ForgeResult<[i64; 3]> {
    let strides = md
        .strides()
        .ok_or_else(|| internal_error!("memory layout was not resolved"))?;
    let lead = 3 - md.ndims();
    let mut out = [0i64; 3];
    for (i, (&dim, &stride)) in md.dims().iter().zip(strides).enumerate() {
        out[lead + i] = if dim == 1 { 0 } else { stride as i64 };
    }
    Ok(out)
}

fn runtime_error(err: ForgeError) -> ForgeError {
    match err {
        ForgeError::RuntimeError(_) => err,
        other => ForgeError::RuntimeError(other.to_string()),
    }
}
