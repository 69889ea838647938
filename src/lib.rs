//! # vtensor
//!
//! **GPU tensor storage and synchronization for explicit compute APIs.**
//!
//! vtensor is the layer between a compute-graph executor and the GPU memory
//! that holds its tensors. It decides how a tensor is laid out in an image
//! texture or a linear buffer, tracks the last pipeline stage that touched
//! each resource so the right memory barrier precedes every dispatch, and
//! services shape changes either in place or by reallocating.
//!
//! ## Components
//!
//! - **`TensorStorage`**: owns one image or buffer handle and computes
//!   barriers against its last access
//! - **`VTensor`**: logical sizes, padded GPU sizes and packed layout over a
//!   storage, with cached uniform buffers describing that metadata
//! - **`GpuContext`**: the explicit compute context tensors are built against
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vtensor::prelude::*;
//!
//! let ctx = HostContext::new();
//! let mut t = VTensor::new(&ctx, &[1, 3, 8, 8], DType::F32)?;
//! assert_eq!(t.gpu_sizes(), &[1, 4, 8, 8]);
//!
//! let image = t.image_for_access(PipelineStage::COMPUTE, MemoryAccess::WRITE)?;
//! let sizes = t.sizes_ubo()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `host` (default): host-memory emulated context
//! - `wgpu`: GPU context via WebGPU

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod config;
pub mod dtype;
pub mod error;
pub mod runtime;
pub mod tensor;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ContextConfig;
    pub use crate::dtype::DType;
    pub use crate::error::{Error, Result};
    pub use crate::runtime::{GpuContext, MemoryAccess, PipelineBarrier, PipelineStage};
    pub use crate::tensor::{GpuMemoryLayout, StorageType, TensorStorage, VTensor};

    #[cfg(feature = "host")]
    pub use crate::runtime::host::HostContext;

    #[cfg(feature = "wgpu")]
    pub use crate::runtime::wgpu::WgpuContext;
}
