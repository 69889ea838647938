//! WebGPU device selection and adapter information.
//!
//! `WgpuDevice` identifies an adapter by enumeration index and caches the
//! adapter's name, backend and limits once it has been queried.
//!
//! # Thread Safety
//!
//! `WgpuDevice` is `Clone` and `Send + Sync`. The adapter info is shared
//! behind an `Arc`.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use wgpu::{Adapter, Backend, Limits};

/// Error type for WebGPU operations.
#[derive(Error, Debug, Clone)]
pub enum WgpuError {
    /// No suitable GPU adapter found.
    #[error("No suitable WebGPU adapter found")]
    NoAdapter,

    /// Device request failed.
    #[error("WebGPU device error: {0}")]
    DeviceError(String),

    /// A resource exceeds a device limit.
    #[error("WebGPU limit exceeded: {what} of {requested} exceeds device limit {limit}")]
    LimitExceeded {
        /// Which limit was exceeded
        what: &'static str,
        /// Requested value
        requested: u64,
        /// Device limit
        limit: u64,
    },

    /// Buffer read-back failed.
    #[error("WebGPU buffer error: {0}")]
    BufferError(String),
}

/// Cached adapter information for a WebGPU device.
#[derive(Clone, Debug)]
pub(crate) struct AdapterInfo {
    /// Adapter name (e.g., "NVIDIA GeForce RTX 4090")
    name: String,
    /// Backend type (Vulkan, Metal, DX12, etc.)
    backend: Backend,
    /// Device limits
    limits: Limits,
}

/// WebGPU device identifier.
///
/// The device index maps to the order of adapters returned by WebGPU
/// enumeration.
///
/// # Example
///
/// ```ignore
/// let ctx = WgpuContext::new(WgpuDevice::new(0), ContextConfig::default())?;
/// println!("Device: {}", ctx.device().adapter_name());
/// ```
#[derive(Clone)]
pub struct WgpuDevice {
    /// Device index (adapter order)
    pub(crate) index: usize,
    /// Cached adapter info (populated when the context is created)
    info: Option<Arc<AdapterInfo>>,
}

impl WgpuDevice {
    /// Create a device identifier for the specified adapter index.
    ///
    /// This does not initialize the GPU; that happens when a
    /// [`WgpuContext`](super::WgpuContext) is created.
    pub fn new(index: usize) -> Self {
        Self { index, info: None }
    }

    pub(crate) fn with_info(index: usize, info: Arc<AdapterInfo>) -> Self {
        Self {
            index,
            info: Some(info),
        }
    }

    /// Adapter index
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Get the adapter name.
    ///
    /// Returns "unknown" if the device hasn't been initialized yet.
    pub fn adapter_name(&self) -> String {
        self.info
            .as_ref()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Get the backend type (Vulkan, Metal, DX12, etc.).
    ///
    /// Returns `None` if the device hasn't been initialized yet.
    pub fn backend(&self) -> Option<Backend> {
        self.info.as_ref().map(|i| i.backend)
    }

    /// Get device limits.
    ///
    /// Returns default limits if the device hasn't been initialized yet.
    pub fn limits(&self) -> Limits {
        self.info
            .as_ref()
            .map(|i| i.limits.clone())
            .unwrap_or_default()
    }
}

impl fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("index", &self.index)
            .field("adapter", &self.adapter_name())
            .field("backend", &self.backend())
            .finish()
    }
}

// ============================================================================
// Adapter Discovery
// ============================================================================

/// Query adapter information for a device index.
pub(crate) async fn query_adapter_info(
    index: usize,
) -> Result<(Adapter, Arc<AdapterInfo>), WgpuError> {
    let instance = wgpu::Instance::default();

    let adapters: Vec<_> = instance.enumerate_adapters(wgpu::Backends::all()).await;

    if adapters.is_empty() {
        return Err(WgpuError::NoAdapter);
    }

    // If index is out of range, fall back to the high-performance adapter
    let adapter = if index < adapters.len() {
        let mut adapters = adapters;
        adapters.swap_remove(index)
    } else {
        instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| WgpuError::NoAdapter)?
    };

    let wgpu_info = adapter.get_info();
    let info = Arc::new(AdapterInfo {
        name: wgpu_info.name,
        backend: wgpu_info.backend,
        limits: adapter.limits(),
    });

    Ok((adapter, info))
}

/// Query adapter information synchronously using pollster.
pub(crate) fn query_adapter_info_blocking(
    index: usize,
) -> Result<(Adapter, Arc<AdapterInfo>), WgpuError> {
    pollster::block_on(query_adapter_info(index))
}

// ============================================================================
// Tests
// ============================================================================
