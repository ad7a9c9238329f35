//! Compile-time kernel configuration context.
//!
//! A `KernelCtx` is the set of named definitions a kernel source is
//! specialized with. The names form a binary contract with the kernel: the
//! compiler sees them as `-DNAME=VALUE` options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attr::EltwiseAlg;
use crate::error::ForgeResult;
use crate::types::DataType;

/// Value of one kernel definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelDefine {
    Int(i64),
    Float(f32),
    Str(String),
}

/// Ordered name -> value mapping handed to the kernel compiler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelCtx {
    defines: BTreeMap<String, KernelDefine>,
}

impl KernelCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_int(&mut self, name: impl Into<String>, value: i64) {
        self.defines.insert(name.into(), KernelDefine::Int(value));
    }

    pub fn define_float(&mut self, name: impl Into<String>, value: f32) {
        self.defines.insert(name.into(), KernelDefine::Float(value));
    }

    pub fn define_str(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.defines.insert(name.into(), KernelDefine::Str(value.into()));
    }

    /// Define the kernel's primary data type (`DATA_T`, `DT_<TAG>`)
    pub fn set_data_type(&mut self, dt: DataType) {
        self.define_str("DATA_T", dt.device_type_name());
        self.define_int(format!("DT_{}", dt.tag()), 1);
    }

    /// Define the data type of one operand role (`<ROLE>_DATA_T`, `<ROLE>_DT_<TAG>`)
    pub fn def_data_type(&mut self, dt: DataType, role: &str) {
        self.define_str(format!("{}_DATA_T", role), dt.device_type_name());
        self.define_int(format!("{}_DT_{}", role, dt.tag()), 1);
    }

    /// Define every elementwise algorithm id and select `alg` (0 when none)
    pub fn def_postops(&mut self, alg: Option<EltwiseAlg>) {
        for known in EltwiseAlg::ALL {
            self.define_int(format!("ELTWISE_{}", known.macro_name()), known.id());
        }
        self.define_int("ELTWISE_ALG", alg.map(|a| a.id()).unwrap_or(0));
    }

    pub fn get(&self, name: &str) -> Option<&KernelDefine> {
        self.defines.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.defines.get(name) {
            Some(KernelDefine::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f32> {
        match self.defines.get(name) {
            Some(KernelDefine::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.defines.get(name) {
            Some(KernelDefine::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Integer definition read as a flag; missing means false
    pub fn flag(&self, name: &str) -> bool {
        self.get_int(name).map(|v| v != 0).unwrap_or(false)
    }

    /// Data type selected for `role` by [`KernelCtx::def_data_type`]
    pub fn data_type(&self, role: &str) -> Option<DataType> {
        DataType::ALL
            .into_iter()
            .find(|dt| self.get_int(&format!("{}_DT_{}", role, dt.tag())) == Some(1))
    }

    pub fn len(&self) -> usize {
        self.defines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }

    /// Render as compiler options, sorted by name
    pub fn options(&self) -> String {
        self.defines
            .iter()
            .map(|(name, value)| match value {
                KernelDefine::Int(v) => format!("-D{}={}", name, v),
                KernelDefine::Float(v) => format!("-D{}={:?}f", name, v),
                KernelDefine::Str(v) => format!("-D{}={}", name, v),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_bytes(&self) -> ForgeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ForgeResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_definitions() {
        let mut ctx = KernelCtx::new();
        ctx.def_data_type(DataType::U8, "SRC");
        ctx.def_data_type(DataType::Bf16, "WEI");
        ctx.set_data_type(DataType::F32);

        assert_eq!(ctx.get_str("SRC_DATA_T"), Some("uchar"));
        assert_eq!(ctx.get_int("SRC_DT_U8"), Some(1));
        assert_eq!(ctx.data_type("SRC"), Some(DataType::U8));
        assert_eq!(ctx.data_type("WEI"), Some(DataType::Bf16));
        assert_eq!(ctx.data_type("DST"), None);
        assert_eq!(ctx.get_str("DATA_T"), Some("float"));
        assert!(ctx.flag("DT_F32"));
    }

    #[test]
    fn test_postops_definitions() {
        let mut ctx = KernelCtx::new();
        ctx.def_postops(None);
        assert_eq!(ctx.get_int("ELTWISE_ALG"), Some(0));
        assert_eq!(ctx.get_int("ELTWISE_RELU"), Some(EltwiseAlg::Relu.id()));

        ctx.def_postops(Some(EltwiseAlg::Tanh));
        assert_eq!(ctx.get_int("ELTWISE_ALG"), Some(EltwiseAlg::Tanh.id()));
    }

    #[test]
    fn test_options_are_sorted() {
        let mut ctx = KernelCtx::new();
        ctx.define_int("WITH_BIAS", 1);
        ctx.define_int("DO_SUM", 0);
        ctx.define_float("ELTWISE_BETA", 0.0);
        assert_eq!(ctx.options(), "-DDO_SUM=0 -DELTWISE_BETA=0.0f -DWITH_BIAS=1");
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut ctx = KernelCtx::new();
        ctx.define_int("NON_DEFAULT_ATTRS", 1);
        ctx.define_float("ELTWISE_ALPHA", 0.25);
        let restored = KernelCtx::from_bytes(&ctx.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, ctx);
    }
}
