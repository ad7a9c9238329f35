//! Scoped host mapping of a device buffer.
//!
//! [`MappedRegion`] maps a [`MemoryStorage`] on creation and always hands the
//! mapping back: explicitly through [`MappedRegion::unmap`], which reports
//! flush errors, or on drop along any early-return path.

use bytemuck::Pod;

use crate::backend::{HostMapping, MemoryStorage};
use crate::error::{ForgeError, ForgeResult};

pub struct MappedRegion<'a> {
    storage: &'a dyn MemoryStorage,
    mapping: Option<HostMapping>,
}

impl<'a> MappedRegion<'a> {
    /// Map `storage` for host reads and writes
    pub fn map(storage: &'a dyn MemoryStorage) -> ForgeResult<Self> {
        let mapping = storage.map_data()?;
        tracing::trace!(storage = ?storage.id(), bytes = storage.size(), "mapped storage");
        Ok(Self {
            storage,
            mapping: Some(mapping),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        self.mapping.as_ref().map(|m| m.as_slice()).unwrap_or(&[])
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self.mapping.as_mut() {
            Some(m) => m.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Number of whole `T` elements in the region
    pub fn len_of<T: Pod>(&self) -> usize {
        self.bytes().len() / std::mem::size_of::<T>()
    }

    /// Set every whole `T` element of the region to `value`; returns the element count
    pub fn fill<T: Pod>(&mut self, value: T) -> usize {
        let pattern = bytemuck::bytes_of(&value);
        let mut count = 0;
        for chunk in self.bytes_mut().chunks_exact_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
            count += 1;
        }
        count
    }

    /// Copy `values` to the start of the region
    pub fn write<T: Pod>(&mut self, values: &[T]) -> ForgeResult<()> {
        let src: &[u8] = bytemuck::cast_slice(values);
        let available = self.bytes().len();
        if src.len() > available {
            return Err(ForgeError::RuntimeError(format!(
                "write of {} bytes exceeds mapped region of {} bytes",
                src.len(),
                available
            )));
        }
        self.bytes_mut()[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Read the region as whole `T` elements
    pub fn read<T: Pod>(&self) -> Vec<T> {
        self.bytes()
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect()
    }

    /// Unmap, flushing host writes, and report the outcome
    pub fn unmap(mut self) -> ForgeResult<()> {
        match self.mapping.take() {
            Some(mapping) => self.storage.unmap_data(mapping),
            None => Ok(()),
        }
    }
}

impl Drop for MappedRegion<'_> {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            if let Err(err) = self.storage.unmap_data(mapping) {
                tracing::warn!(storage = ?self.storage.id(), %err, "unmap on drop failed");
            }
        }
    }
}
