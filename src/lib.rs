//! matmulforge - quantization- and post-op-aware matmul primitive
//!
//! Validates a matmul configuration against the supported data-type and
//! attribute combinations, specializes a device kernel from it, and stages
//! the per-engine resources (kernel handle, scale and zero-point buffers)
//! that repeated executions reuse.
//!
//! ```ignore
//! let engine = HostEngine::new()?;
//! let desc = MatmulDesc::new(src_md, weights_md, None, dst_md)?;
//! let matmul = Primitive::create_matmul(desc, PrimitiveAttr::new(), &engine)?;
//! matmul.create_resource(&engine)?;
//! matmul.execute(&ExecCtx::new(&engine, &args))?;
//! ```

#![allow(clippy::too_many_arguments)]

pub mod attr;
pub mod backend;
pub mod config;
pub mod desc;
pub mod error;
pub mod exec;
pub mod logging;
pub mod matmul;
pub mod primitive;
pub mod resource;
pub mod types;

pub use attr::{EltwiseAlg, PostOps, PrimitiveAttr};
pub use backend::host::HostEngine;
pub use backend::{ComputeEngine, KernelCtx, MemoryStorage};
pub use config::HostEngineConfig;
pub use desc::{MatmulDesc, MemoryDesc};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use exec::{ExecArgs, ExecCtx};
pub use matmul::{AuxParam, MatmulPd, RefMatmul};
pub use primitive::Primitive;
pub use resource::{PrimitiveId, ResourceKey, ResourceMapper};
pub use types::{ArgRole, DataType};
