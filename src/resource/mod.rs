//! Per-engine resource cache
//!
//! A [`Resource`] bundles the kernel-invocation object of a primitive with
//! its staged auxiliary buffers on one engine. [`ResourceMapper`] keeps at
//! most one resource per `(primitive, engine)` pair:
//! - lookups never wait for a resource that is being built
//! - creation runs under a per-key gate, so concurrent callers build once
//! - teardown by primitive or by engine waits for builds in flight on the
//!   keys it retires, so nothing is registered behind it

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;

use crate::backend::{EngineId, Kernel, MemoryStorage};
use crate::error::{ForgeError, ForgeResult};
use crate::matmul::aux_params::{AuxArray, AuxParam};

/// Process-unique identity of a primitive instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveId(pub u64);

impl PrimitiveId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PrimitiveId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "primitive#{}", self.0)
    }
}

/// Cache key: one resource per primitive and engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub primitive: PrimitiveId,
    pub engine: EngineId,
}

impl ResourceKey {
    pub fn new(primitive: PrimitiveId, engine: EngineId) -> Self {
        Self { primitive, engine }
    }
}

/// Kernel plus staged auxiliary buffers for one engine
#[derive(Debug)]
pub struct Resource {
    kernel: Kernel,
    storages: AuxArray<Arc<dyn MemoryStorage>>,
}

impl Resource {
    pub fn new(kernel: Kernel, storages: AuxArray<Arc<dyn MemoryStorage>>) -> Self {
        Self { kernel, storages }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn storage(&self, param: AuxParam) -> &Arc<dyn MemoryStorage> {
        &self.storages[param]
    }
}

static GLOBAL_MAPPER: Lazy<Arc<ResourceMapper>> = Lazy::new(|| Arc::new(ResourceMapper::new()));

type Gate = Arc<Mutex<()>>;

/// Map from `(primitive, engine)` to its [`Resource`]
#[derive(Debug, Default)]
pub struct ResourceMapper {
    resources: Mutex<HashMap<ResourceKey, Arc<Resource>>>,
    gates: Mutex<HashMap<ResourceKey, Gate>>,
}

impl ResourceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide mapper used by primitives created without one
    pub fn global() -> Arc<ResourceMapper> {
        Arc::clone(&GLOBAL_MAPPER)
    }

    pub fn has_resource(&self, key: ResourceKey) -> ForgeResult<bool> {
        Ok(self.resources.lock()?.contains_key(&key))
    }

    pub fn get(&self, key: ResourceKey) -> ForgeResult<Option<Arc<Resource>>> {
        Ok(self.resources.lock()?.get(&key).cloned())
    }

    /// Register `resource` under `key`; a key can be registered once
    pub fn add(&self, key: ResourceKey, resource: Resource) -> ForgeResult<Arc<Resource>> {
        let mut resources = self.resources.lock()?;
        if resources.contains_key(&key) {
            return Err(ForgeError::InternalError(format!(
                "resource for {} on {} already registered",
                key.primitive, key.engine
            )));
        }
        let resource = Arc::new(resource);
        resources.insert(key, Arc::clone(&resource));
        Ok(resource)
    }

    /// Return the resource under `key`, building it with `create` if absent
    ///
    /// Concurrent callers for the same key run `create` at most once. A failed
    /// `create` registers nothing; a later call tries again.
    pub fn get_or_try_create<F>(&self, key: ResourceKey, create: F) -> ForgeResult<Arc<Resource>>
    where
        F: FnOnce() -> ForgeResult<Resource>,
    {
        if let Some(found) = self.get(key)? {
            tracing::debug!(primitive = %key.primitive, engine = %key.engine, "resource cache hit");
            return Ok(found);
        }

        loop {
            let gate = {
                let mut gates = self.gates.lock()?;
                Arc::clone(gates.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
            };
            let _gate_lock = gate.lock()?;

            // A release retired this gate while we waited on it
            if !self.is_current_gate(key, &gate)? {
                continue;
            }
            if let Some(found) = self.get(key)? {
                tracing::debug!(primitive = %key.primitive, engine = %key.engine, "resource built by another caller");
                return Ok(found);
            }

            let resource = create()?;
            return self.add(key, resource);
        }
    }

    fn is_current_gate(&self, key: ResourceKey, gate: &Gate) -> ForgeResult<bool> {
        Ok(self
            .gates
            .lock()?
            .get(&key)
            .map_or(false, |current| Arc::ptr_eq(current, gate)))
    }

    /// Drop every resource of `primitive`; returns how many were removed
    pub fn release_primitive(&self, primitive: PrimitiveId) -> ForgeResult<usize> {
        self.release_where(|key| key.primitive == primitive)
    }

    /// Drop every resource staged on `engine`; returns how many were removed
    pub fn release_engine(&self, engine: EngineId) -> ForgeResult<usize> {
        self.release_where(|key| key.engine == engine)
    }

    fn release_where(&self, matches: impl Fn(&ResourceKey) -> bool) -> ForgeResult<usize> {
        let gated: Vec<(ResourceKey, Gate)> = self
            .gates
            .lock()?
            .iter()
            .filter(|(key, _)| matches(key))
            .map(|(key, gate)| (*key, Arc::clone(gate)))
            .collect();

        let mut released = Vec::new();
        for (key, gate) in gated {
            // Holding the gate waits out a build in flight for this key
            let _gate_lock = gate.lock()?;
            if self.is_current_gate(key, &gate)? {
                self.gates.lock()?.remove(&key);
            }
            released.extend(self.resources.lock()?.remove(&key));
        }

        // Resources registered through `add` have no gate
        {
            let mut resources = self.resources.lock()?;
            let keys: Vec<ResourceKey> = resources.keys().filter(|key| matches(key)).copied().collect();
            released.extend(keys.iter().filter_map(|key| resources.remove(key)));
        }

        let removed = released.len();
        if removed > 0 {
            tracing::debug!(removed, "released resources");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostEngine;
    use crate::backend::{ComputeEngine, KernelId};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    fn resource(engine: &HostEngine) -> ForgeResult<Resource> {
        let storages = AuxArray::try_from_fn(|_| engine.create_memory_storage(4))?;
        let kernel = Kernel::new(KernelId(0), "ref_matmul", engine.id(), Arc::new(()));
        Ok(Resource::new(kernel, storages))
    }

    #[test]
    fn test_add_and_lookup() {
        let engine = HostEngine::new().unwrap();
        let mapper = ResourceMapper::new();
        let key = ResourceKey::new(PrimitiveId::next(), engine.id());

        assert!(!mapper.has_resource(key).unwrap());
        mapper.add(key, resource(&engine).unwrap()).unwrap();
        assert!(mapper.has_resource(key).unwrap());
        assert!(mapper.get(key).unwrap().is_some());
        assert!(mapper.add(key, resource(&engine).unwrap()).is_err());
        assert_eq!(mapper.len(), 1);
    }

    #[test]
    fn test_failed_create_registers_nothing() {
        let engine = HostEngine::new().unwrap();
        let mapper = ResourceMapper::new();
        let key = ResourceKey::new(PrimitiveId::next(), engine.id());

        let err = mapper
            .get_or_try_create(key, || Err(ForgeError::OutOfMemory("test".into())))
            .unwrap_err();
        assert!(matches!(err, ForgeError::OutOfMemory(_)));
        assert!(mapper.is_empty());

        mapper.get_or_try_create(key, || resource(&engine)).unwrap();
        assert_eq!(mapper.len(), 1);
    }

    #[test]
    fn test_concurrent_create_runs_once() {
        let engine = HostEngine::new().unwrap();
        let mapper = ResourceMapper::new();
        let key = ResourceKey::new(PrimitiveId::next(), engine.id());
        let builds = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    mapper
                        .get_or_try_create(key, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            resource(&engine)
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().alloc_count, 4);
    }

    #[test]
    fn test_release_by_primitive_and_engine() {
        let first = HostEngine::new().unwrap();
        let second = HostEngine::new().unwrap();
        let mapper = ResourceMapper::new();
        let (p1, p2) = (PrimitiveId::next(), PrimitiveId::next());

        for p in [p1, p2] {
            for engine in [&first, &second] {
                mapper
                    .add(ResourceKey::new(p, engine.id()), resource(engine).unwrap())
                    .unwrap();
            }
        }
        assert_eq!(mapper.len(), 4);
        assert_eq!(mapper.release_engine(second.id()).unwrap(), 2);
        assert_eq!(mapper.release_primitive(p1).unwrap(), 1);
        assert!(mapper.has_resource(ResourceKey::new(p2, first.id())).unwrap());
        assert_eq!(mapper.len(), 1);
        assert_eq!(second.stats().live_bytes, 0);
    }

    #[test]
    fn test_release_waits_for_build_in_flight() {
        let engine = HostEngine::new().unwrap();
        let mapper = ResourceMapper::new();
        let key = ResourceKey::new(PrimitiveId::next(), engine.id());
        let (started_tx, started_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();

        thread::scope(|s| {
            let (mapper, engine) = (&mapper, &engine);
            let builder = s.spawn(move || {
                mapper.get_or_try_create(key, || {
                    started_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                    resource(engine)
                })
            });
            started_rx.recv().unwrap();

            let releaser = s.spawn(|| mapper.release_engine(engine.id()).unwrap());
            resume_tx.send(()).unwrap();

            assert!(builder.join().unwrap().is_ok());
            assert_eq!(releaser.join().unwrap(), 1);
        });

        assert!(!mapper.has_resource(key).unwrap());
        assert_eq!(engine.stats().live_bytes, 0);

        // The retired gate does not block a fresh build
        mapper.get_or_try_create(key, || resource(&engine)).unwrap();
        mapper.get_or_try_create(key, || resource(&engine)).unwrap();
        assert_eq!(mapper.len(), 1);
    }
}
