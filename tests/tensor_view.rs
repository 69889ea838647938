//! Tests for VTensor construction, metadata and uniform buffers

#![cfg(feature = "host")]

mod common;

use common::{all_configurations, create_budgeted_context, create_host_context};
use vtensor::prelude::*;
use vtensor::dtype::TexelFormat;
use vtensor::tensor::PACKING;

#[test]
fn test_channels_packed_f32_scenario() {
    let ctx = create_host_context();
    let t = VTensor::new(&ctx, &[1, 3, 8, 8], DType::F32).unwrap();

    assert_eq!(t.sizes(), &[1, 3, 8, 8]);
    assert_eq!(t.gpu_sizes(), &[1, 4, 8, 8]);
    assert_eq!(t.numel(), 192);
    assert_eq!(t.nbytes(), 768);
    assert_eq!(t.gpu_numel(), 256);
    assert_eq!(t.gpu_nbytes(), 1024);
    assert_eq!(t.extents(), [8, 8, 1]);
    assert_eq!(t.image().map(|i| i.extents()), Some([8, 8, 1]));
    assert_eq!(t.texture_format(), Some(TexelFormat::Rgba32Float));
}

#[test]
fn test_packed_dim_padding_all_configurations() {
    let ctx = create_host_context();
    let shapes: &[&[usize]] = &[
        &[7],
        &[5, 3],
        &[2, 6, 9],
        &[3, 5, 7, 2],
        &[1, 1, 1, 1],
        &[2, 3, 4, 5, 6],
    ];

    let mut built = 0;
    for &(storage_type, layout) in &all_configurations() {
        for &sizes in shapes {
            let t = match VTensor::with_options(&ctx, sizes, DType::F32, storage_type, layout, true)
            {
                Ok(t) => t,
                Err(Error::InvalidConfiguration { .. }) => continue,
                Err(e) => panic!("{storage_type:?} {layout:?} {sizes:?}: {e}"),
            };
            built += 1;

            assert_eq!(t.gpu_sizes().len(), t.sizes().len());
            for (gpu, logical) in t.gpu_sizes().iter().zip(t.sizes()) {
                assert!(gpu >= logical);
            }
            if let Some(dim) = layout.packed_dim(sizes.len()) {
                assert_eq!(t.gpu_sizes()[dim] % PACKING, 0, "{storage_type:?} {layout:?} {sizes:?}");
                assert!(t.gpu_sizes()[dim] - t.sizes()[dim] < PACKING);
            }
        }
    }
    // Buffers accept every shape and 3D textures every shape up to rank 4.
    assert!(built >= 3 * shapes.len() + 3 * (shapes.len() - 1));
}

#[test]
fn test_buffer_storage_any_rank() {
    let ctx = create_host_context();
    let t = VTensor::with_options(
        &ctx,
        &[2, 3, 4, 5, 6],
        DType::F64,
        StorageType::Buffer,
        GpuMemoryLayout::WidthPacked,
        true,
    )
    .unwrap();
    assert_eq!(t.gpu_sizes(), &[2, 3, 4, 5, 8]);
    assert_eq!(t.extents(), [0, 0, 0]);
    assert_eq!(t.buffer().map(|b| b.size()), Some(2 * 3 * 4 * 5 * 8 * 8));
}

#[test]
fn test_invalid_texture_configurations() {
    let ctx = create_host_context();

    let err = VTensor::new(&ctx, &[1, 2, 3, 4, 5], DType::F32).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidConfiguration {
            storage_type: StorageType::Texture3D,
            ..
        }
    ));

    let err = VTensor::new(&ctx, &[2, 2], DType::I64).unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration { .. }));

    // Height-packed [5, 4] needs two texel rows, which a 1D texture cannot hold.
    let err = VTensor::with_options(
        &ctx,
        &[5, 4],
        DType::F32,
        StorageType::Texture1D,
        GpuMemoryLayout::HeightPacked,
        true,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration { .. }));

    assert_eq!(ctx.stats().live_images, 0);
}

#[test]
fn test_texture_formats_follow_dtype() {
    let ctx = create_host_context();
    for (dtype, format) in [
        (DType::F32, TexelFormat::Rgba32Float),
        (DType::F16, TexelFormat::Rgba16Float),
        (DType::I32, TexelFormat::Rgba32Sint),
        (DType::U8, TexelFormat::Rgba8Uint),
        (DType::Bool, TexelFormat::Rgba8Uint),
    ] {
        let t = VTensor::new(&ctx, &[4, 4], dtype).unwrap();
        assert_eq!(t.texture_format(), Some(format), "{dtype}");
    }
}

#[test]
fn test_uniform_buffer_contents() {
    let ctx = create_host_context();
    let mut t = VTensor::with_options(
        &ctx,
        &[2, 3, 5, 7],
        DType::F32,
        StorageType::Texture3D,
        GpuMemoryLayout::WidthPacked,
        true,
    )
    .unwrap();

    let sizes = t.sizes_ubo().unwrap();
    let gpu_sizes = t.gpu_sizes_ubo().unwrap();
    let extents = t.extents_ubo().unwrap();

    assert_eq!(sizes.read::<[i32; 4]>(), Some([7, 5, 3, 2]));
    assert_eq!(gpu_sizes.read::<[i32; 4]>(), Some([8, 5, 3, 2]));
    assert_eq!(extents.read::<[u32; 4]>(), Some([2, 5, 6, 1]));
    assert_eq!(sizes.size(), 16);

    // The context holds exactly what the tensor reports.
    let bytes = ctx.read_buffer(sizes.buffer()).unwrap();
    assert_eq!(bytes, sizes.contents());
}

#[test]
fn test_gpu_memory_layout_int() {
    let ctx = create_host_context();
    for (layout, value) in [
        (GpuMemoryLayout::WidthPacked, 0),
        (GpuMemoryLayout::HeightPacked, 1),
        (GpuMemoryLayout::ChannelsPacked, 2),
    ] {
        let t = VTensor::with_options(&ctx, &[4, 4, 4], DType::F32, StorageType::Texture3D, layout, true)
            .unwrap();
        assert_eq!(t.gpu_memory_layout_int(), value);
    }
}

#[test]
fn test_drop_releases_everything() {
    let ctx = create_host_context();
    {
        let mut t = VTensor::new(&ctx, &[1, 3, 8, 8], DType::F32).unwrap();
        t.sizes_ubo().unwrap();
        t.extents_ubo().unwrap();
        assert_eq!(ctx.stats().live_images, 1);
        assert_eq!(ctx.stats().live_buffers, 2);
    }
    assert_eq!(ctx.stats().pending_cleanup, 3);
    ctx.flush_cleanup();

    let stats = ctx.stats();
    assert_eq!(stats.live_images, 0);
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.bytes_in_use, 0);
}

#[test]
fn test_allocation_failure_is_reported() {
    let ctx = create_budgeted_context(4096);
    let _small = VTensor::new(&ctx, &[1, 4, 8, 8], DType::F32).unwrap();
    let err = VTensor::new(&ctx, &[1, 4, 64, 64], DType::F32).unwrap_err();
    assert!(matches!(err, Error::AllocationFailure { .. }));
}
