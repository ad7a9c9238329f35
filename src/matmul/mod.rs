//! Quantization- and post-op-aware reference matmul
//!
//! - [`pd`]: descriptor validation and derived state
//! - [`ref_matmul`]: kernel specialization, resource staging, dispatch
//! - [`aux_params`]: the scale and zero-point buffers staged per engine
//! - [`kernel_abi`]: positional kernel arguments

pub mod aux_params;
pub mod kernel_abi;
pub mod pd;
pub mod ref_matmul;

pub use aux_params::{AuxArray, AuxBufferDesc, AuxParam};
pub use pd::{data_types_supported, MatmulPd};
pub use ref_matmul::{build_kernel_ctx, RefMatmul};

/// Name of the device kernel the primitive compiles
pub const REF_MATMUL_KERNEL_NAME: &str = "ref_matmul";
