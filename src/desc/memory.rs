//! Memory descriptors: dims, data type and element strides.

use crate::error::ForgeResult;
use crate::invalid_args;
use crate::types::DataType;

/// Describes one operand buffer
///
/// `strides` are in elements. `None` means "any layout": the primitive picks
/// dense row-major when it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    data_type: DataType,
    strides: Option<Vec<usize>>,
}

impl MemoryDesc {
    /// Descriptor with layout left to the primitive
    pub fn new(dims: Vec<usize>, data_type: DataType) -> Self {
        Self {
            dims,
            data_type,
            strides: None,
        }
    }

    /// Descriptor with dense row-major strides
    pub fn row_major(dims: Vec<usize>, data_type: DataType) -> Self {
        let strides = dense_strides(&dims);
        Self {
            dims,
            data_type,
            strides: Some(strides),
        }
    }

    /// Descriptor with explicit element strides
    pub fn with_strides(dims: Vec<usize>, data_type: DataType, strides: Vec<usize>) -> ForgeResult<Self> {
        if strides.len() != dims.len() {
            return Err(invalid_args!(
                "stride rank {} does not match dims rank {}",
                strides.len(),
                dims.len()
            ));
        }
        Ok(Self {
            dims,
            data_type,
            strides: Some(strides),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn strides(&self) -> Option<&[usize]> {
        self.strides.as_deref()
    }

    pub fn is_any_format(&self) -> bool {
        self.strides.is_none()
    }

    /// Resolve "any" layout to dense row-major; returns false if nothing could be set
    pub fn set_default_format(&mut self) -> bool {
        if self.strides.is_none() {
            self.strides = Some(dense_strides(&self.dims));
        }
        self.strides.is_some()
    }

    pub fn nelems(&self) -> usize {
        self.dims.iter().product()
    }

    /// Bytes needed to hold every addressable element
    pub fn size(&self) -> usize {
        if self.dims.iter().any(|&d| d == 0) {
            return 0;
        }
        let strides = match &self.strides {
            Some(strides) => strides.clone(),
            None => dense_strides(&self.dims),
        };
        let last_offset: usize = self
            .dims
            .iter()
            .zip(strides.iter())
            .map(|(&d, &s)| (d - 1) * s)
            .sum();
        (last_offset + 1) * self.data_type.size()
    }
}

/// Dense row-major strides for `dims`
pub fn dense_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(dims.len());
    let mut stride: usize = 1;
    for dim in dims.iter().rev() {
        strides.push(stride);
        stride = stride.saturating_mul(*dim);
    }
    strides.reverse();
    strides
}
