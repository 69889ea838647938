//! WebGPU context (requires `wgpu` feature)
//!
//! Cross-platform GPU backing for tensors via WebGPU: Vulkan, Metal, DX12
//! and WebGPU in browsers. Texture storage maps to `wgpu::Texture` with the
//! dtype's 4-component texel format; buffer storage maps to storage buffers.
//!
//! # Example
//!
//! ```ignore
//! use vtensor::prelude::*;
//! use vtensor::runtime::wgpu::{WgpuContext, WgpuDevice};
//!
//! let ctx = WgpuContext::new(WgpuDevice::new(0), ContextConfig::default())?;
//! let t = VTensor::new(&ctx, &[1, 3, 224, 224], DType::F32)?;
//! let texture = ctx.texture(t.image().unwrap());
//! ```

mod context;
mod device;

pub use context::{WgpuContext, texture_format};
pub use device::{WgpuDevice, WgpuError};

/// Check if a WebGPU adapter is available.
pub fn is_wgpu_available() -> bool {
    device::query_adapter_info_blocking(0).is_ok()
}
