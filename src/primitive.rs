//! Primitive front end.
//!
//! Primitive families form a closed set; each variant implements the same
//! create-resource / execute contract.

use std::sync::Arc;

use crate::attr::PrimitiveAttr;
use crate::backend::ComputeEngine;
use crate::desc::MatmulDesc;
use crate::error::ForgeResult;
use crate::exec::ExecCtx;
use crate::matmul::{MatmulPd, RefMatmul};
use crate::resource::{PrimitiveId, ResourceMapper};

#[derive(Debug)]
pub enum Primitive {
    RefMatmul(RefMatmul),
}

impl Primitive {
    /// Validate, specialize and compile a matmul using the global resource mapper
    pub fn create_matmul(
        desc: MatmulDesc,
        attr: PrimitiveAttr,
        engine: &dyn ComputeEngine,
    ) -> ForgeResult<Self> {
        Self::create_matmul_with_mapper(desc, attr, engine, ResourceMapper::global())
    }

    /// Same as [`Primitive::create_matmul`] with an explicit resource mapper
    pub fn create_matmul_with_mapper(
        desc: MatmulDesc,
        attr: PrimitiveAttr,
        engine: &dyn ComputeEngine,
        mapper: Arc<ResourceMapper>,
    ) -> ForgeResult<Self> {
        let pd = MatmulPd::create(desc, attr)?;
        Ok(Primitive::RefMatmul(RefMatmul::create(pd, engine, mapper)?))
    }

    pub fn id(&self) -> PrimitiveId {
        match self {
            Primitive::RefMatmul(p) => p.id(),
        }
    }

    /// Implementation name
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::RefMatmul(_) => "ref:any",
        }
    }

    pub fn create_resource(&self, engine: &dyn ComputeEngine) -> ForgeResult<()> {
        match self {
            Primitive::RefMatmul(p) => p.create_resource(engine),
        }
    }

    pub fn execute(&self, ctx: &ExecCtx<'_>) -> ForgeResult<()> {
        match self {
            Primitive::RefMatmul(p) => p.execute(ctx),
        }
    }

    pub fn as_ref_matmul(&self) -> Option<&RefMatmul> {
        match self {
            Primitive::RefMatmul(p) => Some(p),
        }
    }
}
