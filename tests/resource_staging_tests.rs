//! Resource staging: auxiliary buffer contents, caching and failure handling

mod common;

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use common::{desc_2d, serial, Fixture};
use matmulforge::backend::host::HostEngine;
use matmulforge::{
    ArgRole, AuxParam, ComputeEngine, DataType, ExecArgs, ExecCtx, ForgeError, Primitive,
    PrimitiveAttr, ResourceKey, ResourceMapper,
};

fn u8_s8_f32() -> matmulforge::MatmulDesc {
    desc_2d((2, 3, 4), DataType::U8, DataType::S8, DataType::F32, None)
}

#[test]
fn test_default_attributes_stage_neutral_values() -> Result<()> {
    let fixture = Fixture::new();
    let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;
    matmul.create_resource(&fixture.engine)?;

    assert_eq!(fixture.staged::<f32>(&matmul, AuxParam::Scales), vec![1.0]);
    for param in [AuxParam::SrcZeroPoint, AuxParam::WeiZeroPoint, AuxParam::DstZeroPoint] {
        assert_eq!(fixture.staged::<i32>(&matmul, param), vec![0]);
    }
    Ok(())
}

#[test]
fn test_common_scale_is_staged() -> Result<()> {
    let fixture = Fixture::new();
    let mut attr = PrimitiveAttr::new();
    attr.set_output_scales(0, vec![0.5])?;
    let matmul = fixture.create(u8_s8_f32(), attr)?;
    matmul.create_resource(&fixture.engine)?;

    assert_eq!(fixture.staged::<f32>(&matmul, AuxParam::Scales), vec![0.5]);
    Ok(())
}

#[test]
fn test_per_column_scales_are_staged_verbatim() -> Result<()> {
    let fixture = Fixture::new();
    let scales = vec![0.25, -1.5, 3.0, 1e-3];
    let mut attr = PrimitiveAttr::new();
    attr.set_output_scales(2, scales.clone())?;
    let matmul = fixture.create(u8_s8_f32(), attr)?;
    matmul.create_resource(&fixture.engine)?;

    assert_eq!(fixture.staged::<f32>(&matmul, AuxParam::Scales), scales);
    Ok(())
}

#[test]
fn test_dst_zero_point_is_staged() -> Result<()> {
    let fixture = Fixture::new();
    let mut attr = PrimitiveAttr::new();
    attr.set_zero_points(ArgRole::Dst, 0, vec![3])?;
    let matmul = fixture.create(u8_s8_f32(), attr)?;
    matmul.create_resource(&fixture.engine)?;

    assert_eq!(fixture.staged::<i32>(&matmul, AuxParam::DstZeroPoint), vec![3]);
    assert_eq!(fixture.staged::<i32>(&matmul, AuxParam::SrcZeroPoint), vec![0]);
    assert_eq!(fixture.staged::<f32>(&matmul, AuxParam::Scales), vec![1.0]);
    Ok(())
}

#[test]
fn test_zero_point_buffer_holds_one_value() -> Result<()> {
    let fixture = Fixture::new();
    let mut attr = PrimitiveAttr::new();
    attr.set_zero_points(ArgRole::Src, 0, vec![7, 8, 9])?;
    let matmul = fixture.create(u8_s8_f32(), attr)?;
    matmul.create_resource(&fixture.engine)?;

    assert_eq!(fixture.staged::<i32>(&matmul, AuxParam::SrcZeroPoint), vec![7]);
    Ok(())
}

#[test]
fn test_second_create_resource_is_a_no_op() -> Result<()> {
    let fixture = Fixture::new();
    let mut attr = PrimitiveAttr::new();
    attr.set_output_scales(0, vec![2.0])?;
    let matmul = fixture.create(u8_s8_f32(), attr)?;

    matmul.create_resource(&fixture.engine)?;
    let first = fixture.mapper.get(fixture.key(&matmul))?.expect("staged");
    let stats = fixture.engine.stats();
    assert_eq!(stats.alloc_count, 4);
    assert_eq!(stats.kernel_count, 1);

    matmul.create_resource(&fixture.engine)?;
    let second = fixture.mapper.get(fixture.key(&matmul))?.expect("staged");
    assert!(Arc::ptr_eq(&first, &second));
    for param in AuxParam::ALL {
        assert_eq!(first.storage(param).id(), second.storage(param).id());
    }
    let stats = fixture.engine.stats();
    assert_eq!(stats.alloc_count, 4);
    assert_eq!(stats.kernel_count, 1);
    assert_eq!(fixture.staged::<f32>(&matmul, AuxParam::Scales), vec![2.0]);
    Ok(())
}

#[test]
fn test_buffer_sizes_are_four_bytes_per_element() -> Result<()> {
    let fixture = Fixture::new();
    let mut attr = PrimitiveAttr::new();
    attr.set_output_scales(2, vec![1.0; 4])?;
    let matmul = fixture.create(u8_s8_f32(), attr)?;
    matmul.create_resource(&fixture.engine)?;

    // 4 scales + 3 single zero-points
    assert_eq!(fixture.engine.stats().total_allocated_bytes, 4 * 4 + 3 * 4);
    Ok(())
}

#[test]
fn test_concurrent_create_resource_stages_once() -> Result<()> {
    let fixture = Fixture::new();
    let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;

    thread::scope(|s| {
        for _ in 0..16 {
            s.spawn(|| matmul.create_resource(&fixture.engine).unwrap());
        }
    });

    assert_eq!(fixture.mapper.len(), 1);
    assert_eq!(fixture.engine.stats().alloc_count, 4);
    assert_eq!(fixture.engine.stats().kernel_count, 1);
    Ok(())
}

#[test]
fn test_each_engine_gets_its_own_resource() -> Result<()> {
    let fixture = Fixture::new();
    let other = HostEngine::new()?;
    let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;

    matmul.create_resource(&fixture.engine)?;
    matmul.create_resource(&other)?;
    assert_eq!(fixture.mapper.len(), 2);
    assert!(fixture
        .mapper
        .has_resource(ResourceKey::new(matmul.id(), other.id()))?);

    assert_eq!(fixture.mapper.release_engine(other.id())?, 1);
    assert_eq!(other.stats().live_bytes, 0);
    assert!(fixture.mapper.has_resource(fixture.key(&matmul))?);
    Ok(())
}

#[test]
fn test_dropping_engine_releases_its_resources() -> Result<()> {
    let fixture = Fixture::new();
    let short_lived = HostEngine::new()?;
    let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;

    matmul.create_resource(&fixture.engine)?;
    matmul.create_resource(&short_lived)?;
    let gone = ResourceKey::new(matmul.id(), short_lived.id());
    assert_eq!(fixture.mapper.len(), 2);

    drop(short_lived);
    assert!(!fixture.mapper.has_resource(gone)?);
    assert_eq!(fixture.mapper.len(), 1);
    assert!(fixture.mapper.has_resource(fixture.key(&matmul))?);
    Ok(())
}

#[test]
fn test_dropping_engine_with_only_resource_empties_mapper() -> Result<()> {
    let mapper = Arc::new(ResourceMapper::new());
    let engine = HostEngine::new()?;
    let matmul = Primitive::create_matmul_with_mapper(
        u8_s8_f32(),
        PrimitiveAttr::new(),
        &engine,
        Arc::clone(&mapper),
    )?;
    matmul.create_resource(&engine)?;

    drop(engine);
    assert!(mapper.is_empty());
    Ok(())
}

#[test]
fn test_released_resources_free_their_kernels() -> Result<()> {
    let fixture = Fixture::new();
    for _ in 0..50 {
        let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;
        matmul.create_resource(&fixture.engine)?;
    }
    let stats = fixture.engine.stats();
    assert_eq!(stats.kernel_count, 50);
    assert_eq!(stats.live_kernels, 0);
    assert!(fixture.mapper.is_empty());

    let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;
    matmul.create_resource(&fixture.engine)?;
    assert_eq!(fixture.engine.stats().live_kernels, 1);
    fixture.mapper.release_engine(fixture.engine.id())?;
    assert_eq!(fixture.engine.stats().live_kernels, 0);
    Ok(())
}

#[test]
fn test_out_of_memory_leaves_nothing_registered() -> Result<()> {
    // Room for three of the four 4-byte buffers (8-byte aligned)
    let fixture = Fixture::with_memory_limit(24);
    let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;

    let err = matmul.create_resource(&fixture.engine).unwrap_err();
    assert!(matches!(err, ForgeError::OutOfMemory(_)));
    assert!(err.is_recoverable());
    assert!(!fixture.mapper.has_resource(fixture.key(&matmul))?);
    assert_eq!(fixture.engine.stats().live_bytes, 0);

    let exec_err = matmul
        .execute(&ExecCtx::new(&fixture.engine, &ExecArgs::new()))
        .unwrap_err();
    assert!(matches!(exec_err, ForgeError::ResourceNotCreated(_)));
    Ok(())
}

#[test]
fn test_retry_after_memory_is_freed() -> Result<()> {
    let fixture = Fixture::with_memory_limit(32);
    let hog = fixture.engine.create_memory_storage(16)?;
    let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;

    assert!(matmul.create_resource(&fixture.engine).is_err());
    drop(hog);
    matmul.create_resource(&fixture.engine)?;
    assert!(fixture.mapper.has_resource(fixture.key(&matmul))?);
    Ok(())
}

#[test]
fn test_map_failure_is_a_runtime_error() -> Result<()> {
    let fixture = Fixture::new();
    let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;

    fixture.engine.inject_map_failure(true);
    let err = matmul.create_resource(&fixture.engine).unwrap_err();
    fixture.engine.inject_map_failure(false);

    assert!(matches!(err, ForgeError::RuntimeError(_)));
    assert!(fixture.mapper.is_empty());
    assert_eq!(fixture.engine.stats().live_bytes, 0);

    matmul.create_resource(&fixture.engine)?;
    assert_eq!(fixture.mapper.len(), 1);
    Ok(())
}

#[test]
fn test_dropping_primitive_releases_resources() -> Result<()> {
    let fixture = Fixture::new();
    let matmul = fixture.create(u8_s8_f32(), PrimitiveAttr::new())?;
    matmul.create_resource(&fixture.engine)?;
    assert_eq!(fixture.mapper.len(), 1);

    drop(matmul);
    assert!(fixture.mapper.is_empty());
    assert_eq!(fixture.engine.stats().live_bytes, 0);
    Ok(())
}

#[test]
fn test_compile_failure_is_distinct_from_rejection() -> Result<()> {
    let fixture = Fixture::new();
    fixture.engine.inject_compile_failure(true);
    let err = fixture.create(u8_s8_f32(), PrimitiveAttr::new()).unwrap_err();
    assert!(matches!(err, ForgeError::CompilationFailed(_)));
    Ok(())
}

#[test]
#[serial]
fn test_global_mapper() -> Result<()> {
    let engine = HostEngine::new()?;
    let global = ResourceMapper::global();
    let matmul = Primitive::create_matmul(u8_s8_f32(), PrimitiveAttr::new(), &engine)?;
    let key = ResourceKey::new(matmul.id(), engine.id());

    matmul.create_resource(&engine)?;
    assert!(global.has_resource(key)?);

    drop(matmul);
    assert!(!global.has_resource(key)?);
    Ok(())
}
