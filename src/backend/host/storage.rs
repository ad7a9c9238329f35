//! Host-memory storage with map/unmap staging semantics

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use super::HostShared;
use crate::backend::{HostMapping, MemoryStorage, StorageId};
use crate::error::{ForgeError, ForgeResult};

/// Buffer owned by a [`super::HostEngine`]
///
/// `map_data` hands out a copy of the contents; `unmap_data` writes the copy
/// back. Storage starts zero-filled.
#[derive(Debug)]
pub struct HostStorage {
    id: StorageId,
    size: usize,
    /// Bytes charged against the engine's memory limit
    accounted: usize,
    data: Mutex<Vec<u8>>,
    shared: Arc<HostShared>,
}

impl HostStorage {
    pub(super) fn new(id: StorageId, size: usize, accounted: usize, shared: Arc<HostShared>) -> Self {
        Self {
            id,
            size,
            accounted,
            data: Mutex::new(vec![0u8; size]),
            shared,
        }
    }
}

impl MemoryStorage for HostStorage {
    fn id(&self) -> StorageId {
        self.id
    }

    fn size(&self) -> usize {
        self.size
    }

    fn map_data(&self) -> ForgeResult<HostMapping> {
        if self.shared.fail_map.load(Ordering::SeqCst) {
            return Err(ForgeError::RuntimeError(format!(
                "failed to map storage {:?} ({} bytes)",
                self.id, self.size
            )));
        }
        let data = self.data.lock()?;
        self.shared.map_count.fetch_add(1, Ordering::Relaxed);
        Ok(HostMapping::new(data.clone()))
    }

    fn unmap_data(&self, mapping: HostMapping) -> ForgeResult<()> {
        let bytes = mapping.into_inner();
        if bytes.len() != self.size {
            return Err(ForgeError::RuntimeError(format!(
                "mapping of {} bytes does not belong to storage {:?} ({} bytes)",
                bytes.len(),
                self.id,
                self.size
            )));
        }
        let mut data = self.data.lock()?;
        *data = bytes;
        self.shared.unmap_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for HostStorage {
    fn drop(&mut self) {
        self.shared.live_bytes.fetch_sub(self.accounted, Ordering::SeqCst);
        self.shared.free_count.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(storage = ?self.id, bytes = self.size, "freed host storage");
    }
}
