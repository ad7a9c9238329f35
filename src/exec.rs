//! Execution context: target engine plus operand buffers.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{ComputeEngine, MemoryStorage};
use crate::error::ForgeResult;
use crate::invalid_args;
use crate::types::ArgRole;

/// Operand buffers of one execution, keyed by role
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    args: BTreeMap<ArgRole, Arc<dyn MemoryStorage>>,
}

impl ExecArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ExecArgs::insert`]
    pub fn with(mut self, role: ArgRole, storage: Arc<dyn MemoryStorage>) -> Self {
        self.insert(role, storage);
        self
    }

    pub fn insert(&mut self, role: ArgRole, storage: Arc<dyn MemoryStorage>) {
        self.args.insert(role, storage);
    }

    pub fn get(&self, role: ArgRole) -> Option<&Arc<dyn MemoryStorage>> {
        self.args.get(&role)
    }

    /// Buffer for `role`, or [`crate::ForgeError::InvalidArguments`] when missing
    pub fn required(&self, role: ArgRole) -> ForgeResult<&Arc<dyn MemoryStorage>> {
        self.args
            .get(&role)
            .ok_or_else(|| invalid_args!("missing {} buffer", role))
    }
}

/// One execution request
#[derive(Debug, Clone, Copy)]
pub struct ExecCtx<'a> {
    pub engine: &'a dyn ComputeEngine,
    pub args: &'a ExecArgs,
}

impl<'a> ExecCtx<'a> {
    pub fn new(engine: &'a dyn ComputeEngine, args: &'a ExecArgs) -> Self {
        Self { engine, args }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostEngine;
    use crate::error::ForgeError;

    #[test]
    fn test_required_reports_missing_role() {
        let engine = HostEngine::new().unwrap();
        let args = ExecArgs::new().with(ArgRole::Src, engine.create_memory_storage(4).unwrap());
        assert!(args.required(ArgRole::Src).is_ok());
        assert!(args.get(ArgRole::Bias).is_none());
        assert!(matches!(
            args.required(ArgRole::Dst),
            Err(ForgeError::InvalidArguments(_))
        ));
    }
}
