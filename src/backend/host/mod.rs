//! In-process compute engine backed by host memory
//!
//! `HostEngine` stands in for a device in tests and benchmarks:
//! - storages are zero-filled host buffers, accounted against an optional
//!   memory limit so out-of-memory is observable
//! - "compiling" `ref_matmul` serializes the kernel context into the binary
//! - launches run the reference kernel on a rayon pool, one at a time
//! - compile, map and launch failures can be injected
//! - dropping the engine releases its resources from every mapper that
//!   cached them
//!
//! ```rust,ignore
//! let engine = HostEngine::new()?;
//! let src = engine.create_storage_from(&[1.0f32, 2.0])?;
//! ```

pub mod kernel;
pub mod storage;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytemuck::Pod;

use crate::backend::{
    Binary, ComputeEngine, EngineId, Kernel, KernelArgList, KernelCtx, KernelId, MappedRegion,
    MemoryStorage, NdRange, StorageId,
};
use crate::config::HostEngineConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::matmul::REF_MATMUL_KERNEL_NAME;
use crate::resource::ResourceMapper;

pub use kernel::RefMatmulKernel;
pub use storage::HostStorage;

/// Counters and fault switches shared between the engine and its storages
#[derive(Debug, Default)]
pub(crate) struct HostShared {
    next_storage: AtomicU64,
    live_bytes: AtomicUsize,
    alloc_count: AtomicUsize,
    free_count: AtomicUsize,
    total_allocated_bytes: AtomicUsize,
    map_count: AtomicUsize,
    unmap_count: AtomicUsize,
    compile_count: AtomicUsize,
    kernel_count: AtomicUsize,
    live_kernels: AtomicUsize,
    launch_count: AtomicUsize,
    fail_compile: AtomicBool,
    fail_map: AtomicBool,
    fail_launch: AtomicBool,
}

/// Snapshot of host engine activity
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostEngineStats {
    /// Successful `create_memory_storage` calls
    pub alloc_count: usize,
    /// Storages dropped
    pub free_count: usize,
    /// Bytes requested over the engine's lifetime
    pub total_allocated_bytes: usize,
    /// Aligned bytes currently held by live storages
    pub live_bytes: usize,
    pub map_count: usize,
    pub unmap_count: usize,
    /// Binaries produced
    pub compile_count: usize,
    /// Kernel-invocation objects created
    pub kernel_count: usize,
    /// Kernel programs still held by a handle
    pub live_kernels: usize,
    /// Successful launches
    pub launch_count: usize,
}

/// Host-memory implementation of [`ComputeEngine`]
#[derive(Debug)]
pub struct HostEngine {
    id: EngineId,
    config: HostEngineConfig,
    shared: Arc<HostShared>,
    next_kernel: AtomicU64,
    mappers: Mutex<Vec<Weak<ResourceMapper>>>,
    /// Launches on one engine are serialized, like a device queue
    queue: Mutex<()>,
    pool: rayon::ThreadPool,
}

impl HostEngine {
    /// Engine with the default configuration
    pub fn new() -> ForgeResult<Self> {
        Self::with_config(HostEngineConfig::default())
    }

    /// Engine configured from `MATMULFORGE_HOST_*` environment variables
    pub fn from_env() -> ForgeResult<Self> {
        Self::with_config(HostEngineConfig::from_env()?)
    }

    pub fn with_config(config: HostEngineConfig) -> ForgeResult<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("matmulforge-host-{}", i))
            .build()
            .map_err(|e| ForgeError::InvalidConfiguration(format!("host thread pool: {}", e)))?;

        let engine = Self {
            id: EngineId::next(),
            config,
            shared: Arc::new(HostShared::default()),
            next_kernel: AtomicU64::new(1),
            mappers: Mutex::new(Vec::new()),
            queue: Mutex::new(()),
            pool,
        };
        tracing::debug!(
            engine = %engine.id,
            memory_limit = ?engine.config.memory_limit,
            threads = engine.pool.current_num_threads(),
            "created host engine"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &HostEngineConfig {
        &self.config
    }

    pub fn stats(&self) -> HostEngineStats {
        let load = |counter: &AtomicUsize| counter.load(Ordering::SeqCst);
        HostEngineStats {
            alloc_count: load(&self.shared.alloc_count),
            free_count: load(&self.shared.free_count),
            total_allocated_bytes: load(&self.shared.total_allocated_bytes),
            live_bytes: load(&self.shared.live_bytes),
            map_count: load(&self.shared.map_count),
            unmap_count: load(&self.shared.unmap_count),
            compile_count: load(&self.shared.compile_count),
            kernel_count: load(&self.shared.kernel_count),
            live_kernels: load(&self.shared.live_kernels),
            launch_count: load(&self.shared.launch_count),
        }
    }

    /// Make `create_binary` produce no binary while set
    pub fn inject_compile_failure(&self, fail: bool) {
        self.shared.fail_compile.store(fail, Ordering::SeqCst);
    }

    /// Make `map_data` fail on every storage of this engine while set
    pub fn inject_map_failure(&self, fail: bool) {
        self.shared.fail_map.store(fail, Ordering::SeqCst);
    }

    /// Make `parallel_for` fail while set
    pub fn inject_launch_failure(&self, fail: bool) {
        self.shared.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Allocate a storage holding `values`
    pub fn create_storage_from<T: Pod>(&self, values: &[T]) -> ForgeResult<Arc<dyn MemoryStorage>> {
        let storage = self.create_memory_storage(std::mem::size_of_val(values))?;
        let mut region = MappedRegion::map(storage.as_ref())?;
        region.write(values)?;
        region.unmap()?;
        Ok(storage)
    }

    /// Read the whole storage as `T` elements
    pub fn read_storage<T: Pod>(&self, storage: &dyn MemoryStorage) -> ForgeResult<Vec<T>> {
        let region = MappedRegion::map(storage)?;
        let values = region.read::<T>();
        region.unmap()?;
        Ok(values)
    }

    fn reserve(&self, bytes: usize) -> ForgeResult<()> {
        let live = &self.shared.live_bytes;
        match self.config.memory_limit {
            Some(limit) => live
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    current.checked_add(bytes).filter(|&total| total <= limit)
                })
                .map(|_| ())
                .map_err(|current| {
                    ForgeError::OutOfMemory(format!(
                        "{} bytes requested, {} of {} bytes in use on {}",
                        bytes, current, limit, self.id
                    ))
                }),
            None => {
                live.fetch_add(bytes, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

impl ComputeEngine for HostEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn name(&self) -> &str {
        "host"
    }

    fn create_memory_storage(&self, size: usize) -> ForgeResult<Arc<dyn MemoryStorage>> {
        if size == 0 {
            tracing::warn!(engine = %self.id, "zero-size storage requested");
        }
        let accounted = self.config.aligned_size(size);
        self.reserve(accounted)?;

        let id = StorageId(self.shared.next_storage.fetch_add(1, Ordering::Relaxed));
        self.shared.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.shared
            .total_allocated_bytes
            .fetch_add(size, Ordering::Relaxed);
        tracing::trace!(engine = %self.id, storage = ?id, bytes = size, "allocated host storage");

        Ok(Arc::new(HostStorage::new(
            id,
            size,
            accounted,
            Arc::clone(&self.shared),
        )))
    }

    fn create_binary(&self, kernel_name: &str, ctx: &KernelCtx) -> ForgeResult<Option<Binary>> {
        if self.shared.fail_compile.load(Ordering::SeqCst) {
            tracing::debug!(engine = %self.id, kernel = kernel_name, "compile failure injected");
            return Ok(None);
        }
        if kernel_name != REF_MATMUL_KERNEL_NAME {
            tracing::debug!(engine = %self.id, kernel = kernel_name, "unknown kernel");
            return Ok(None);
        }
        // Reject contexts the kernel cannot be specialized with
        if let Err(err) = RefMatmulKernel::from_ctx(ctx) {
            tracing::debug!(engine = %self.id, %err, "kernel context rejected");
            return Ok(None);
        }
        self.shared.compile_count.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Binary::new(kernel_name, ctx.to_bytes()?)))
    }

    fn create_kernel(&self, binary: &Binary) -> ForgeResult<Kernel> {
        if binary.kernel_name() != REF_MATMUL_KERNEL_NAME {
            return Err(ForgeError::CompilationFailed(format!(
                "binary for unknown kernel {}",
                binary.kernel_name()
            )));
        }
        let ctx = KernelCtx::from_bytes(binary.bytes())?;
        let program = RefMatmulKernel::from_ctx(&ctx)?;

        let id = KernelId(self.next_kernel.fetch_add(1, Ordering::Relaxed));
        self.shared.kernel_count.fetch_add(1, Ordering::Relaxed);
        self.shared.live_kernels.fetch_add(1, Ordering::SeqCst);
        let program = HostProgram {
            kernel: program,
            shared: Arc::clone(&self.shared),
        };
        Ok(Kernel::new(id, binary.kernel_name(), self.id, Arc::new(program)))
    }

    fn parallel_for(&self, kernel: &Kernel, range: &NdRange, args: &KernelArgList) -> ForgeResult<()> {
        if kernel.engine() != self.id {
            return Err(ForgeError::KernelLaunchFailed(format!(
                "kernel {:?} belongs to {}, not {}",
                kernel.id(),
                kernel.engine(),
                self.id
            )));
        }
        let program = kernel.program::<HostProgram>().ok_or_else(|| {
            ForgeError::KernelLaunchFailed(format!("kernel {:?} was not built by a host engine", kernel.id()))
        })?;

        let _queue = self.queue.lock()?;
        if self.shared.fail_launch.load(Ordering::SeqCst) {
            return Err(ForgeError::KernelLaunchFailed(format!(
                "launch of {} failed on {}",
                kernel.name(),
                self.id
            )));
        }
        program.kernel.run(&self.pool, range, args)?;
        self.shared.launch_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn register_mapper(&self, mapper: Weak<ResourceMapper>) {
        let mut mappers = self.mappers.lock().unwrap_or_else(PoisonError::into_inner);
        mappers.retain(|known| known.strong_count() > 0);
        if !mappers.iter().any(|known| known.ptr_eq(&mapper)) {
            mappers.push(mapper);
        }
    }
}

impl Drop for HostEngine {
    fn drop(&mut self) {
        let mappers = std::mem::take(
            self.mappers
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for mapper in mappers.iter().filter_map(Weak::upgrade) {
            if let Err(err) = mapper.release_engine(self.id) {
                tracing::warn!(engine = %self.id, %err, "failed to release resources");
            }
        }
        tracing::debug!(engine = %self.id, "dropped host engine");
    }
}

/// Reference kernel owned by a [`Kernel`] handle
#[derive(Debug)]
struct HostProgram {
    kernel: RefMatmulKernel,
    shared: Arc<HostShared>,
}

impl Drop for HostProgram {
    fn drop(&mut self) {
        self.shared.live_kernels.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn ref_matmul_ctx() -> KernelCtx {
        let mut ctx = KernelCtx::new();
        for role in ["SRC", "WEI", "BIA", "DST", "ACC"] {
            ctx.def_data_type(DataType::F32, role);
        }
        ctx.def_postops(None);
        ctx
    }

    #[test]
    fn test_allocation_accounting() {
        let engine = HostEngine::with_config(HostEngineConfig::new().with_alignment(16)).unwrap();
        let a = engine.create_memory_storage(4).unwrap();
        let _b = engine.create_memory_storage(20).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.alloc_count, 2);
        assert_eq!(stats.total_allocated_bytes, 24);
        assert_eq!(stats.live_bytes, 48);

        drop(a);
        let stats = engine.stats();
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.live_bytes, 32);
    }

    #[test]
    fn test_memory_limit() {
        let engine =
            HostEngine::with_config(HostEngineConfig::new().with_memory_limit(16)).unwrap();
        let first = engine.create_memory_storage(8).unwrap();
        let _second = engine.create_memory_storage(8).unwrap();
        let err = engine.create_memory_storage(1).unwrap_err();
        assert!(matches!(err, ForgeError::OutOfMemory(_)));
        assert!(err.is_recoverable());

        drop(first);
        assert!(engine.create_memory_storage(8).is_ok());
    }

    #[test]
    fn test_storage_starts_zeroed() {
        let engine = HostEngine::new().unwrap();
        let storage = engine.create_memory_storage(12).unwrap();
        assert_eq!(engine.read_storage::<i32>(storage.as_ref()).unwrap(), vec![0, 0, 0]);

        let filled = engine.create_storage_from(&[1.5f32, -2.0]).unwrap();
        assert_eq!(filled.size(), 8);
        assert_eq!(engine.read_storage::<f32>(filled.as_ref()).unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_map_failure_injection() {
        let engine = HostEngine::new().unwrap();
        let storage = engine.create_memory_storage(4).unwrap();
        engine.inject_map_failure(true);
        assert!(matches!(storage.map_data(), Err(ForgeError::RuntimeError(_))));
        engine.inject_map_failure(false);
        assert!(storage.map_data().is_ok());
    }

    #[test]
    fn test_compile_only_ref_matmul() {
        let engine = HostEngine::new().unwrap();
        let ctx = ref_matmul_ctx();
        assert!(engine.create_binary("gemm_tiled", &ctx).unwrap().is_none());

        let binary = engine.create_binary(REF_MATMUL_KERNEL_NAME, &ctx).unwrap().unwrap();
        assert_eq!(KernelCtx::from_bytes(binary.bytes()).unwrap(), ctx);

        engine.inject_compile_failure(true);
        assert!(engine.create_binary(REF_MATMUL_KERNEL_NAME, &ctx).unwrap().is_none());
        assert_eq!(engine.stats().compile_count, 1);
    }

    #[test]
    fn test_kernel_from_other_engine_rejected() {
        let first = HostEngine::new().unwrap();
        let second = HostEngine::new().unwrap();
        let binary = first
            .create_binary(REF_MATMUL_KERNEL_NAME, &ref_matmul_ctx())
            .unwrap()
            .unwrap();
        let kernel = first.create_kernel(&binary).unwrap();
        let args = KernelArgList::with_len(0);
        let err = second
            .parallel_for(&kernel, &NdRange::new([1, 1, 1]), &args)
            .unwrap_err();
        assert!(matches!(err, ForgeError::KernelLaunchFailed(_)));
    }

    #[test]
    fn test_kernel_program_freed_with_last_handle() {
        let engine = HostEngine::new().unwrap();
        let binary = engine
            .create_binary(REF_MATMUL_KERNEL_NAME, &ref_matmul_ctx())
            .unwrap()
            .unwrap();
        let kernel = engine.create_kernel(&binary).unwrap();
        let clone = kernel.clone();
        assert_eq!(engine.stats().live_kernels, 1);

        drop(kernel);
        assert_eq!(engine.stats().live_kernels, 1);
        drop(clone);
        let stats = engine.stats();
        assert_eq!(stats.live_kernels, 0);
        assert_eq!(stats.kernel_count, 1);
    }

    #[test]
    fn test_foreign_program_rejected() {
        let engine = HostEngine::new().unwrap();
        let kernel = Kernel::new(KernelId(1), REF_MATMUL_KERNEL_NAME, engine.id(), Arc::new(()));
        let err = engine
            .parallel_for(&kernel, &NdRange::new([1, 1, 1]), &KernelArgList::with_len(0))
            .unwrap_err();
        assert!(matches!(err, ForgeError::KernelLaunchFailed(_)));
    }
}
