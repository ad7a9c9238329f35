//! Compute backend contracts
//!
//! The matmul primitive never talks to a device directly. It goes through
//! [`ComputeEngine`] for allocation, compilation and launches, and through
//! [`MemoryStorage`] for host access to device buffers. The in-process
//! [`host::HostEngine`] implements both for tests and benchmarks.

pub mod host;
pub mod kernel_ctx;
pub mod mapping;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{ForgeError, ForgeResult};
use crate::resource::ResourceMapper;

pub use kernel_ctx::{KernelCtx, KernelDefine};
pub use mapping::MappedRegion;

/// Identity of an engine (device context)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u64);

impl EngineId {
    /// Allocate a process-unique engine id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        EngineId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// Identity of one allocated storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u64);

/// Identity of a kernel-invocation object within its engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u64);

/// Compiled kernel binary (opaque to the primitive)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    kernel_name: String,
    bytes: Arc<[u8]>,
}

impl Binary {
    pub fn new(kernel_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            bytes: Arc::from(bytes),
        }
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Engine-specific executable behind a [`Kernel`]
pub type KernelProgram = Arc<dyn Any + Send + Sync>;

/// Kernel-invocation object created from a [`Binary`] on one engine
///
/// The handle owns the engine's program; the program is freed with the last
/// clone of the handle.
#[derive(Clone)]
pub struct Kernel {
    id: KernelId,
    name: String,
    engine: EngineId,
    program: KernelProgram,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Kernel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.engine == other.engine
    }
}

impl Eq for Kernel {}

impl Kernel {
    pub fn new(id: KernelId, name: impl Into<String>, engine: EngineId, program: KernelProgram) -> Self {
        Self {
            id,
            name: name.into(),
            engine,
            program,
        }
    }

    /// The engine's program, if it is a `T`
    pub fn program<T: Any>(&self) -> Option<&T> {
        (*self.program).downcast_ref::<T>()
    }

    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }
}

/// Host-visible staging copy of a mapped storage
///
/// Writes become visible to the device when the mapping is handed back
/// through [`MemoryStorage::unmap_data`].
#[derive(Debug)]
pub struct HostMapping {
    data: Vec<u8>,
}

impl HostMapping {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Device-visible buffer
pub trait MemoryStorage: Send + Sync + fmt::Debug {
    fn id(&self) -> StorageId;

    /// Size in bytes
    fn size(&self) -> usize;

    /// Map the buffer for host access
    fn map_data(&self) -> ForgeResult<HostMapping>;

    /// Unmap and flush host writes back to the buffer
    fn unmap_data(&self, mapping: HostMapping) -> ForgeResult<()>;
}

/// One kernel argument
#[derive(Debug, Clone)]
pub enum KernelArg {
    /// Buffer argument; `None` binds a null buffer
    Memory(Option<Arc<dyn MemoryStorage>>),
    Int(i64),
    Float(f32),
}

impl KernelArg {
    pub fn memory(storage: &Arc<dyn MemoryStorage>) -> Self {
        KernelArg::Memory(Some(Arc::clone(storage)))
    }
}

/// Positional kernel arguments
#[derive(Debug, Clone)]
pub struct KernelArgList {
    args: Vec<Option<KernelArg>>,
}

impl KernelArgList {
    /// List with `len` unset slots
    pub fn with_len(len: usize) -> Self {
        Self {
            args: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn set(&mut self, index: usize, arg: KernelArg) -> ForgeResult<()> {
        let len = self.args.len();
        let slot = self.args.get_mut(index).ok_or_else(|| {
            ForgeError::InternalError(format!("kernel argument {} out of range ({})", index, len))
        })?;
        *slot = Some(arg);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&KernelArg> {
        self.args.get(index).and_then(|arg| arg.as_ref())
    }

    /// Buffer argument at `index` (`None` for a bound null buffer)
    pub fn memory(&self, index: usize) -> ForgeResult<Option<&Arc<dyn MemoryStorage>>> {
        match self.get(index) {
            Some(KernelArg::Memory(storage)) => Ok(storage.as_ref()),
            other => Err(ForgeError::KernelLaunchFailed(format!(
                "argument {} is not a buffer: {:?}",
                index, other
            ))),
        }
    }

    pub fn int(&self, index: usize) -> ForgeResult<i64> {
        match self.get(index) {
            Some(KernelArg::Int(value)) => Ok(*value),
            other => Err(ForgeError::KernelLaunchFailed(format!(
                "argument {} is not an integer: {:?}",
                index, other
            ))),
        }
    }

    pub fn float(&self, index: usize) -> ForgeResult<f32> {
        match self.get(index) {
            Some(KernelArg::Float(value)) => Ok(*value),
            other => Err(ForgeError::KernelLaunchFailed(format!(
                "argument {} is not a float: {:?}",
                index, other
            ))),
        }
    }
}

/// Launch range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: [usize; 3],
    pub local: Option<[usize; 3]>,
}

impl NdRange {
    pub fn new(global: [usize; 3]) -> Self {
        Self {
            global,
            local: None,
        }
    }

    pub fn nelems(&self) -> usize {
        self.global.iter().product()
    }
}

/// Device context: allocation, compilation and kernel launches
pub trait ComputeEngine: Send + Sync + fmt::Debug {
    fn id(&self) -> EngineId;

    fn name(&self) -> &str;

    /// Allocate `size` bytes; fails with [`ForgeError::OutOfMemory`]
    fn create_memory_storage(&self, size: usize) -> ForgeResult<Arc<dyn MemoryStorage>>;

    /// Compile `kernel_name` specialized by `ctx`; `Ok(None)` when no binary was produced
    fn create_binary(&self, kernel_name: &str, ctx: &KernelCtx) -> ForgeResult<Option<Binary>>;

    /// Instantiate a kernel-invocation object from a binary
    fn create_kernel(&self, binary: &Binary) -> ForgeResult<Kernel>;

    /// Launch `kernel` over `range`; fails with [`ForgeError::KernelLaunchFailed`]
    fn parallel_for(&self, kernel: &Kernel, range: &NdRange, args: &KernelArgList) -> ForgeResult<()>;

    /// Remember a mapper that caches resources staged on this engine
    ///
    /// When the engine goes away it calls [`ResourceMapper::release_engine`]
    /// on every mapper still alive.
    fn register_mapper(&self, mapper: Weak<ResourceMapper>);
}
