//! Data types and argument roles understood by the matmul primitive.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element data type of an operand or auxiliary buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Undef,
    F16,
    Bf16,
    F32,
    S32,
    S8,
    U8,
}

impl DataType {
    /// Every concrete (non-undef) data type
    pub const ALL: [DataType; 6] = [
        DataType::F16,
        DataType::Bf16,
        DataType::F32,
        DataType::S32,
        DataType::S8,
        DataType::U8,
    ];

    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::Undef => 0,
            DataType::F16 | DataType::Bf16 => 2,
            DataType::F32 | DataType::S32 => 4,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::S32 | DataType::S8 | DataType::U8)
    }

    pub fn is_int8(&self) -> bool {
        matches!(self, DataType::S8 | DataType::U8)
    }

    /// Upper-case tag used in `<ROLE>_DT_<TAG>` kernel definitions
    pub fn tag(&self) -> &'static str {
        match self {
            DataType::Undef => "UNDEF",
            DataType::F16 => "F16",
            DataType::Bf16 => "BF16",
            DataType::F32 => "F32",
            DataType::S32 => "S32",
            DataType::S8 => "S8",
            DataType::U8 => "U8",
        }
    }

    /// Device-side scalar type name used in `<ROLE>_DATA_T` definitions
    ///
    /// bf16 has no native device type and travels as its raw 16 bits.
    pub fn device_type_name(&self) -> &'static str {
        match self {
            DataType::Undef => "void",
            DataType::F16 => "half",
            DataType::Bf16 => "ushort",
            DataType::F32 => "float",
            DataType::S32 => "int",
            DataType::S8 => "char",
            DataType::U8 => "uchar",
        }
    }

    /// Inverse of [`DataType::tag`]
    pub fn from_tag(tag: &str) -> Option<Self> {
        DataType::ALL
            .into_iter()
            .chain(std::iter::once(DataType::Undef))
            .find(|dt| dt.tag() == tag)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag().to_lowercase())
    }
}

/// Operand role of a buffer passed to the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArgRole {
    Src,
    Weights,
    Bias,
    Dst,
}

impl fmt::Display for ArgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgRole::Src => write!(f, "src"),
            ArgRole::Weights => write!(f, "weights"),
            ArgRole::Bias => write!(f, "bias"),
            ArgRole::Dst => write!(f, "dst"),
        }
    }
}
