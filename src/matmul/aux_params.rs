//! Auxiliary runtime parameters staged next to the kernel.

use std::ops::{Index, IndexMut};

use crate::types::{ArgRole, DataType};

/// Closed set of auxiliary buffers, in staging order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuxParam {
    Scales,
    SrcZeroPoint,
    WeiZeroPoint,
    DstZeroPoint,
}

impl AuxParam {
    pub const ALL: [AuxParam; 4] = [
        AuxParam::Scales,
        AuxParam::SrcZeroPoint,
        AuxParam::WeiZeroPoint,
        AuxParam::DstZeroPoint,
    ];

    pub fn index(&self) -> usize {
        match self {
            AuxParam::Scales => 0,
            AuxParam::SrcZeroPoint => 1,
            AuxParam::WeiZeroPoint => 2,
            AuxParam::DstZeroPoint => 3,
        }
    }

    /// Element type: f32 for scales, s32 for zero-points
    pub fn data_type(&self) -> DataType {
        match self {
            AuxParam::Scales => DataType::F32,
            _ => DataType::S32,
        }
    }

    /// Operand role a zero-point belongs to
    pub fn zero_point_role(&self) -> Option<ArgRole> {
        match self {
            AuxParam::Scales => None,
            AuxParam::SrcZeroPoint => Some(ArgRole::Src),
            AuxParam::WeiZeroPoint => Some(ArgRole::Weights),
            AuxParam::DstZeroPoint => Some(ArgRole::Dst),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuxParam::Scales => "scales",
            AuxParam::SrcZeroPoint => "a0",
            AuxParam::WeiZeroPoint => "b0",
            AuxParam::DstZeroPoint => "c0",
        }
    }
}

/// One value per [`AuxParam`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxArray<T>([T; 4]);

impl<T> AuxArray<T> {
    pub fn from_fn(mut f: impl FnMut(AuxParam) -> T) -> Self {
        AuxArray(std::array::from_fn(|i| f(AuxParam::ALL[i])))
    }

    /// Build in [`AuxParam::ALL`] order, stopping at the first error
    pub fn try_from_fn<E>(mut f: impl FnMut(AuxParam) -> Result<T, E>) -> Result<Self, E> {
        Ok(AuxArray([
            f(AuxParam::Scales)?,
            f(AuxParam::SrcZeroPoint)?,
            f(AuxParam::WeiZeroPoint)?,
            f(AuxParam::DstZeroPoint)?,
        ]))
    }

    pub fn iter(&self) -> impl Iterator<Item = (AuxParam, &T)> {
        AuxParam::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<AuxParam> for AuxArray<T> {
    type Output = T;

    fn index(&self, param: AuxParam) -> &T {
        &self.0[param.index()]
    }
}

impl<T> IndexMut<AuxParam> for AuxArray<T> {
    fn index_mut(&mut self, param: AuxParam) -> &mut T {
        &mut self.0[param.index()]
    }
}

/// Shape of one auxiliary buffer (1D, dense)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxBufferDesc {
    pub data_type: DataType,
    pub len: usize,
}

impl AuxBufferDesc {
    pub fn size(&self) -> usize {
        self.len * self.data_type.size()
    }
}
