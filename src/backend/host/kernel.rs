//! Reference `ref_matmul` kernel executed by the host engine.
//!
//! The kernel is specialized by the definitions of its [`KernelCtx`] and reads
//! its runtime arguments from the positions in [`crate::matmul::kernel_abi`].
//! One output element per `[d0, m, n]` point:
//!
//! ```text
//! acc = sum_k (src - a0) * (wei - b0)
//! r   = acc (+ bias)
//! r   = r * scales[scale_stride * n] (+ sum_scale * dst) -> eltwise -> + c0
//! dst = convert(r)
//! ```

use half::{bf16, f16};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::attr::EltwiseAlg;
use crate::backend::{KernelArgList, KernelCtx, MappedRegion, MemoryStorage, NdRange};
use crate::error::{ForgeError, ForgeResult};
use crate::matmul::kernel_abi as abi;
use crate::types::DataType;

/// Compile-time specialization of `ref_matmul`
#[derive(Debug, Clone, PartialEq)]
pub struct RefMatmulKernel {
    src_dt: DataType,
    wei_dt: DataType,
    bia_dt: DataType,
    dst_dt: DataType,
    acc_dt: DataType,
    with_bias: bool,
    non_default_attrs: bool,
    do_sum: bool,
    eltwise: Option<EltwiseAlg>,
}

/// Scalar arguments of one launch
#[derive(Debug, Clone, Copy)]
struct Problem {
    d0: usize,
    m: usize,
    n: usize,
    k: usize,
    src_strides: [usize; 3],
    wei_strides: [usize; 3],
    bia_strides: [usize; 3],
    dst_strides: [usize; 3],
    scale_stride: usize,
    eltwise_alpha: f32,
    eltwise_beta: f32,
    eltwise_scale: f32,
    sum_scale: f32,
}

/// Host copies of the buffer arguments
struct Operands {
    src: Vec<u8>,
    wei: Vec<u8>,
    bia: Vec<u8>,
    dst: Vec<u8>,
    scales: Vec<f32>,
    a0: i32,
    b0: i32,
    c0: i32,
}

impl RefMatmulKernel {
    /// Decode the specialization from a kernel context
    pub fn from_ctx(ctx: &KernelCtx) -> ForgeResult<Self> {
        let data_type = |role: &str| {
            ctx.data_type(role).ok_or_else(|| {
                ForgeError::CompilationFailed(format!("{}_DATA_T is not defined", role))
            })
        };

        let with_eltwise = ctx.flag("WITH_ELTWISE");
        let eltwise = match ctx.get_int("ELTWISE_ALG").unwrap_or(0) {
            0 => None,
            id => Some(EltwiseAlg::from_id(id).ok_or_else(|| {
                ForgeError::CompilationFailed(format!("unknown ELTWISE_ALG {}", id))
            })?),
        };
        if with_eltwise && eltwise.is_none() {
            return Err(ForgeError::CompilationFailed(
                "WITH_ELTWISE set without ELTWISE_ALG".to_string(),
            ));
        }

        Ok(Self {
            src_dt: data_type("SRC")?,
            wei_dt: data_type("WEI")?,
            bia_dt: data_type("BIA")?,
            dst_dt: data_type("DST")?,
            acc_dt: data_type("ACC")?,
            with_bias: ctx.flag("WITH_BIAS"),
            non_default_attrs: ctx.flag("NON_DEFAULT_ATTRS"),
            do_sum: ctx.flag("DO_SUM"),
            eltwise: if with_eltwise { eltwise } else { None },
        })
    }

    /// Run one launch over `range` on `pool`
    pub fn run(&self, pool: &ThreadPool, range: &NdRange, args: &KernelArgList) -> ForgeResult<()> {
        if args.len() != abi::ARG_COUNT {
            return Err(ForgeError::KernelLaunchFailed(format!(
                "ref_matmul takes {} arguments, got {}",
                abi::ARG_COUNT,
                args.len()
            )));
        }
        let problem = Problem::from_args(args)?;
        if range.global != [problem.d0, problem.m, problem.n] {
            return Err(ForgeError::KernelLaunchFailed(format!(
                "range {:?} does not match [D0, M, N] = [{}, {}, {}]",
                range.global, problem.d0, problem.m, problem.n
            )));
        }

        let total = problem.d0 * problem.m * problem.n;
        if total == 0 {
            return Ok(());
        }

        let dst_storage = bound(args, abi::DST, "dst")?;
        let operands = self.load_operands(args, &problem)?;

        let mut results = vec![0f32; total];
        pool.install(|| {
            results
                .par_chunks_mut(problem.n)
                .enumerate()
                .for_each(|(row, out)| {
                    let (d, i) = (row / problem.m, row % problem.m);
                    for (j, slot) in out.iter_mut().enumerate() {
                        *slot = self.compute(&problem, &operands, d, i, j);
                    }
                });
        });

        let mut region = MappedRegion::map(dst_storage.as_ref()).map_err(launch_error)?;
        let bytes = region.bytes_mut();
        for (row, values) in results.chunks_exact(problem.n).enumerate() {
            let (d, i) = (row / problem.m, row % problem.m);
            for (j, &value) in values.iter().enumerate() {
                store(bytes, self.dst_dt, offset(problem.dst_strides, d, i, j), value);
            }
        }
        region.unmap().map_err(launch_error)
    }

    fn load_operands(&self, args: &KernelArgList, p: &Problem) -> ForgeResult<Operands> {
        let src = read_bytes(bound(args, abi::SRC, "src")?)?;
        check_extent("src", &src, self.src_dt, [p.d0, p.m, p.k], p.src_strides)?;
        let wei = read_bytes(bound(args, abi::WEI, "weights")?)?;
        check_extent("weights", &wei, self.wei_dt, [p.d0, p.k, p.n], p.wei_strides)?;
        let dst = read_bytes(bound(args, abi::DST, "dst")?)?;
        check_extent("dst", &dst, self.dst_dt, [p.d0, p.m, p.n], p.dst_strides)?;

        let bia = if self.with_bias {
            let bia = read_bytes(bound(args, abi::BIA, "bias")?)?;
            check_extent("bias", &bia, self.bia_dt, [p.d0, p.m, p.n], p.bia_strides)?;
            bia
        } else {
            Vec::new()
        };

        let scales: Vec<f32> = read_bytes(bound(args, abi::SCALES, "scales")?)?
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();
        let needed = p.scale_stride * (p.n - 1) + 1;
        if scales.len() < needed {
            return Err(ForgeError::KernelLaunchFailed(format!(
                "scales buffer holds {} values, kernel reads {}",
                scales.len(),
                needed
            )));
        }

        Ok(Operands {
            src,
            wei,
            bia,
            dst,
            scales,
            a0: read_zero_point(args, abi::A0, "a0")?,
            b0: read_zero_point(args, abi::B0, "b0")?,
            c0: read_zero_point(args, abi::C0, "c0")?,
        })
    }

    fn compute(&self, p: &Problem, ops: &Operands, d: usize, i: usize, j: usize) -> f32 {
        let src_at = |kk: usize| offset(p.src_strides, d, i, kk);
        let wei_at = |kk: usize| offset(p.wei_strides, d, kk, j);

        let mut r = if self.acc_dt == DataType::S32 {
            let mut acc: i32 = 0;
            for kk in 0..p.k {
                let s = load_i32(&ops.src, self.src_dt, src_at(kk)).wrapping_sub(ops.a0);
                let w = load_i32(&ops.wei, self.wei_dt, wei_at(kk)).wrapping_sub(ops.b0);
                acc = acc.wrapping_add(s.wrapping_mul(w));
            }
            acc as f32
        } else {
            let (a0, b0) = (ops.a0 as f32, ops.b0 as f32);
            let mut acc = 0f32;
            for kk in 0..p.k {
                let s = load_f32(&ops.src, self.src_dt, src_at(kk)) - a0;
                let w = load_f32(&ops.wei, self.wei_dt, wei_at(kk)) - b0;
                acc += s * w;
            }
            acc
        };

        if self.with_bias {
            r += load_f32(&ops.bia, self.bia_dt, offset(p.bia_strides, d, i, j));
        }
        if self.non_default_attrs {
            r *= ops.scales[p.scale_stride * j];
            if self.do_sum {
                let prev = load_f32(&ops.dst, self.dst_dt, offset(p.dst_strides, d, i, j));
                r += p.sum_scale * prev;
            }
            if let Some(alg) = self.eltwise {
                r = p.eltwise_scale * alg.forward(r, p.eltwise_alpha, p.eltwise_beta);
            }
            r += ops.c0 as f32;
        }
        r
    }
}

impl Problem {
    fn from_args(args: &KernelArgList) -> ForgeResult<Self> {
        let dim = |index: usize| -> ForgeResult<usize> {
            let value = args.int(index)?;
            usize::try_from(value).map_err(|_| {
                ForgeError::KernelLaunchFailed(format!("argument {} is negative: {}", index, value))
            })
        };
        let strides = |first: usize| -> ForgeResult<[usize; 3]> {
            Ok([dim(first)?, dim(first + 1)?, dim(first + 2)?])
        };

        Ok(Self {
            d0: dim(abi::D0)?,
            m: dim(abi::M)?,
            n: dim(abi::N)?,
            k: dim(abi::K)?,
            src_strides: strides(abi::SRC_STRIDE_D0)?,
            wei_strides: strides(abi::WEI_STRIDE_D0)?,
            bia_strides: strides(abi::BIA_STRIDE_D0)?,
            dst_strides: strides(abi::DST_STRIDE_D0)?,
            scale_stride: dim(abi::SCALE_STRIDE)?,
            eltwise_alpha: args.float(abi::ELTWISE_ALPHA)?,
            eltwise_beta: args.float(abi::ELTWISE_BETA)?,
            eltwise_scale: args.float(abi::ELTWISE_SCALE)?,
            sum_scale: args.float(abi::SUM_SCALE)?,
        })
    }
}

fn launch_error(err: ForgeError) -> ForgeError {
    ForgeError::KernelLaunchFailed(err.to_string())
}

fn bound<'a>(
    args: &'a KernelArgList,
    index: usize,
    name: &str,
) -> ForgeResult<&'a std::sync::Arc<dyn MemoryStorage>> {
    args.memory(index)?
        .ok_or_else(|| ForgeError::KernelLaunchFailed(format!("{} buffer is not bound", name)))
}

fn read_bytes(storage: &std::sync::Arc<dyn MemoryStorage>) -> ForgeResult<Vec<u8>> {
    let region = MappedRegion::map(storage.as_ref()).map_err(launch_error)?;
    let bytes = region.bytes().to_vec();
    region.unmap().map_err(launch_error)?;
    Ok(bytes)
}

fn read_zero_point(args: &KernelArgList, index: usize, name: &str) -> ForgeResult<i32> {
    let bytes = read_bytes(bound(args, index, name)?)?;
    bytes
        .get(..4)
        .map(bytemuck::pod_read_unaligned::<i32>)
        .ok_or_else(|| ForgeError::KernelLaunchFailed(format!("{} buffer is empty", name)))
}

fn offset(strides: [usize; 3], a: usize, b: usize, c: usize) -> usize {
    a * strides[0] + b * strides[1] + c * strides[2]
}

fn check_extent(
    name: &str,
    bytes: &[u8],
    dt: DataType,
    dims: [usize; 3],
    strides: [usize; 3],
) -> ForgeResult<()> {
    if dims.iter().any(|&d| d == 0) {
        return Ok(());
    }
    let last = offset(strides, dims[0] - 1, dims[1] - 1, dims[2] - 1);
    let needed = (last + 1) * dt.size();
    if bytes.len() < needed {
        return Err(ForgeError::KernelLaunchFailed(format!(
            "{} buffer holds {} bytes, kernel addresses {}",
            name,
            bytes.len(),
            needed
        )));
    }
    Ok(())
}

fn element(bytes: &[u8], dt: DataType, index: usize) -> &[u8] {
    let at = index * dt.size();
    &bytes[at..at + dt.size()]
}

fn load_f32(bytes: &[u8], dt: DataType, index: usize) -> f32 {
    let raw = element(bytes, dt, index);
    match dt {
        DataType::F32 => bytemuck::pod_read_unaligned::<f32>(raw),
        DataType::F16 => f16::from_bits(bytemuck::pod_read_unaligned::<u16>(raw)).to_f32(),
        DataType::Bf16 => bf16::from_bits(bytemuck::pod_read_unaligned::<u16>(raw)).to_f32(),
        DataType::S32 => bytemuck::pod_read_unaligned::<i32>(raw) as f32,
        DataType::S8 => raw[0] as i8 as f32,
        DataType::U8 => raw[0] as f32,
        DataType::Undef => 0.0,
    }
}

fn load_i32(bytes: &[u8], dt: DataType, index: usize) -> i32 {
    let raw = element(bytes, dt, index);
    match dt {
        DataType::S32 => bytemuck::pod_read_unaligned::<i32>(raw),
        DataType::S8 => raw[0] as i8 as i32,
        DataType::U8 => raw[0] as i32,
        _ => load_f32(bytes, dt, index) as i32,
    }
}

/// Convert `value` to `dt`: round half to even and saturate for integers
fn store(bytes: &mut [u8], dt: DataType, index: usize, value: f32) {
    let at = index * dt.size();
    let slot = &mut bytes[at..at + dt.size()];
    match dt {
        DataType::F32 => slot.copy_from_slice(&value.to_ne_bytes()),
        DataType::F16 => slot.copy_from_slice(&f16::from_f32(value).to_bits().to_ne_bytes()),
        DataType::Bf16 => slot.copy_from_slice(&bf16::from_f32(value).to_bits().to_ne_bytes()),
        DataType::S32 => slot.copy_from_slice(&(value.round_ties_even() as i32).to_ne_bytes()),
        DataType::S8 => slot[0] = (value.round_ties_even() as i8) as u8,
        DataType::U8 => slot[0] = value.round_ties_even() as u8,
        DataType::Undef => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_rounds_and_saturates() {
        let mut bytes = [0u8; 4];
        store(&mut bytes, DataType::U8, 0, 2.5);
        store(&mut bytes, DataType::U8, 1, 300.0);
        store(&mut bytes, DataType::U8, 2, -4.0);
        store(&mut bytes, DataType::S8, 3, -200.0);
        assert_eq!(bytes, [2, 255, 0, (-128i8) as u8]);

        let mut wide = [0u8; 4];
        store(&mut wide, DataType::S32, 0, 3.5);
        assert_eq!(load_i32(&wide, DataType::S32, 0), 4);
    }

    #[test]
    fn test_half_precision_roundtrip() {
        let mut bytes = [0u8; 4];
        store(&mut bytes, DataType::F16, 0, 1.5);
        store(&mut bytes, DataType::Bf16, 1, -2.0);
        assert_eq!(load_f32(&bytes, DataType::F16, 0), 1.5);
        assert_eq!(load_f32(&bytes, DataType::Bf16, 1), -2.0);
    }

    #[test]
    fn test_from_ctx_requires_types() {
        let mut ctx = KernelCtx::new();
        ctx.def_data_type(DataType::F32, "SRC");
        assert!(matches!(
            RefMatmulKernel::from_ctx(&ctx),
            Err(ForgeError::CompilationFailed(_))
        ));

        for role in ["WEI", "BIA", "DST", "ACC"] {
            ctx.def_data_type(DataType::F32, role);
        }
        ctx.def_postops(None);
        ctx.define_int("WITH_ELTWISE", 1);
        assert!(RefMatmulKernel::from_ctx(&ctx).is_err());

        ctx.define_int("WITH_ELTWISE", 0);
        let kernel = RefMatmulKernel::from_ctx(&ctx).unwrap();
        assert_eq!(kernel.eltwise, None);
        assert!(!kernel.with_bias);
    }

    #[test]
    fn test_extent_check() {
        let bytes = vec![0u8; 24];
        assert!(check_extent("src", &bytes, DataType::F32, [1, 2, 3], [6, 3, 1]).is_ok());
        assert!(check_extent("src", &bytes, DataType::F32, [1, 3, 3], [9, 3, 1]).is_err());
        assert!(check_extent("src", &bytes, DataType::F32, [1, 0, 3], [0, 3, 1]).is_ok());
    }
}
