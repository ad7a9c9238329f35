//! Common test utilities
//!
//! Every fixture owns its own host engine and resource mapper, so tests do
//! not share cached resources. Tests that go through the global mapper or
//! the global logger run with `#[serial]`.

#![allow(dead_code)]

use std::sync::Arc;

use bytemuck::Pod;
use matmulforge::backend::host::HostEngine;
use matmulforge::{
    AuxParam, ComputeEngine, DataType, ForgeResult, HostEngineConfig, MatmulDesc, MemoryDesc,
    MemoryStorage, Primitive, PrimitiveAttr, ResourceKey, ResourceMapper,
};
pub use serial_test::serial;

pub fn md(dims: &[usize], data_type: DataType) -> MemoryDesc {
    MemoryDesc::new(dims.to_vec(), data_type)
}

/// `[m, k] x [k, n] -> [m, n]`, optional bias broadcast over rows
pub fn desc_2d(
    (m, k, n): (usize, usize, usize),
    src: DataType,
    wei: DataType,
    dst: DataType,
    bias: Option<DataType>,
) -> MatmulDesc {
    MatmulDesc::new(
        md(&[m, k], src),
        md(&[k, n], wei),
        bias.map(|dt| md(&[1, n], dt)),
        md(&[m, n], dst),
    )
    .expect("valid 2D shapes")
}

pub struct Fixture {
    pub engine: HostEngine,
    pub mapper: Arc<ResourceMapper>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(HostEngineConfig::default())
    }

    pub fn with_memory_limit(bytes: usize) -> Self {
        Self::with_config(HostEngineConfig::new().with_memory_limit(bytes))
    }

    pub fn with_config(config: HostEngineConfig) -> Self {
        Self {
            engine: HostEngine::with_config(config).expect("host engine"),
            mapper: Arc::new(ResourceMapper::new()),
        }
    }

    pub fn create(&self, desc: MatmulDesc, attr: PrimitiveAttr) -> ForgeResult<Primitive> {
        Primitive::create_matmul_with_mapper(desc, attr, &self.engine, Arc::clone(&self.mapper))
    }

    pub fn key(&self, primitive: &Primitive) -> ResourceKey {
        ResourceKey::new(primitive.id(), self.engine.id())
    }

    /// Contents of a staged auxiliary buffer
    pub fn staged<T: Pod>(&self, primitive: &Primitive, param: AuxParam) -> Vec<T> {
        let resource = self
            .mapper
            .get(self.key(primitive))
            .unwrap()
            .expect("resource staged");
        self.engine
            .read_storage::<T>(resource.storage(param).as_ref())
            .unwrap()
    }

    pub fn upload<T: Pod>(&self, values: &[T]) -> Arc<dyn MemoryStorage> {
        self.engine.create_storage_from(values).unwrap()
    }

    pub fn download<T: Pod>(&self, storage: &Arc<dyn MemoryStorage>) -> Vec<T> {
        self.engine.read_storage::<T>(storage.as_ref()).unwrap()
    }
}

/// Row-major `[m, k] x [k, n]` in f32
pub fn reference_matmul(src: &[f32], wei: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k).map(|kk| src[i * k + kk] * wei[kk * n + j]).sum();
        }
    }
    out
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "element {}: got {}, expected {}",
            i,
            a,
            e
        );
    }
}
