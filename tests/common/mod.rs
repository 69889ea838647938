//! Common test utilities
#![allow(dead_code)]

use vtensor::prelude::*;
#[cfg(feature = "wgpu")]
use vtensor::runtime::wgpu::{WgpuContext, WgpuDevice};

/// Install a tracing subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a host context for testing
#[cfg(feature = "host")]
pub fn create_host_context() -> HostContext {
    init_tracing();
    HostContext::new()
}

/// Create a host context with a memory budget in bytes
#[cfg(feature = "host")]
pub fn create_budgeted_context(budget: u64) -> HostContext {
    init_tracing();
    HostContext::with_config(ContextConfig::default().with_memory_budget(budget))
        .expect("default alignments are valid")
}

/// Create a WebGPU context, returning None if no adapter is available
#[cfg(feature = "wgpu")]
pub fn create_wgpu_context() -> Option<WgpuContext> {
    if !vtensor::runtime::wgpu::is_wgpu_available() {
        return None;
    }
    init_tracing();
    WgpuContext::new(WgpuDevice::new(0), ContextConfig::default()).ok()
}

/// Every (storage type, layout) combination a texture or buffer tensor can use
pub fn all_configurations() -> Vec<(StorageType, GpuMemoryLayout)> {
    let mut out = Vec::new();
    for storage_type in [
        StorageType::Buffer,
        StorageType::Texture1D,
        StorageType::Texture2D,
        StorageType::Texture3D,
    ] {
        for layout in [
            GpuMemoryLayout::WidthPacked,
            GpuMemoryLayout::HeightPacked,
            GpuMemoryLayout::ChannelsPacked,
        ] {
            out.push((storage_type, layout));
        }
    }
    out
}
