//! GPU contexts and the resources they own
//!
//! This module defines the `GpuContext` trait, the collaborator every tensor
//! is constructed against, together with the handle, barrier and uniform
//! buffer types that cross that boundary.
//!
//! # Architecture
//!
//! ```text
//! GpuContext (explicit compute API)
//! ├── create_image / create_buffer     (handles, optionally without memory)
//! ├── allocate_memory / bind_*_memory  (external memory pools)
//! ├── register_*_cleanup / flush_cleanup (deferred release)
//! └── submit_pipeline_barrier          (manual synchronization)
//! ```

pub mod barrier;
pub mod resource;
mod uniform;

#[cfg(feature = "host")]
pub mod host;

#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use barrier::{
    AccessMask, BufferMemoryBarrier, ImageLayout, ImageMemoryBarrier, LastAccess, MemoryAccess,
    PipelineBarrier, PipelineStage, StageMask, StageScope, access_mask,
};
pub use resource::{
    AllocationCreateInfo, BufferDescriptor, BufferUsage, GpuBuffer, GpuImage, ImageDescriptor,
    MemoryAllocation, MemoryRequirements, MemoryState, MemoryUsage, ResourceId,
};
pub use uniform::UniformParamsBuffer;

use crate::config::ContextConfig;
use crate::error::{Error, Result};

/// Explicit GPU compute context
///
/// A context creates and destroys images and buffers, hands out memory,
/// and accepts pipeline barriers. Contexts are cheap handles: clones share
/// the same device and registry.
///
/// Allocation failures are reported synchronously and never retried.
pub trait GpuContext: Clone + Send + Sync + 'static {
    /// Human-readable name of this context's backend
    fn name(&self) -> &'static str;

    /// Configuration the context was created with
    fn config(&self) -> &ContextConfig;

    /// Create an image, allocating its memory if `allocate_memory` is set
    fn create_image(&self, desc: &ImageDescriptor, allocate_memory: bool) -> Result<GpuImage>;

    /// Create a buffer, allocating its memory if `allocate_memory` is set
    fn create_buffer(&self, desc: &BufferDescriptor, allocate_memory: bool) -> Result<GpuBuffer>;

    /// Allocate dedicated memory for an image created without memory
    fn allocate_image_memory(&self, image: &mut GpuImage) -> Result<()>;

    /// Allocate dedicated memory for a buffer created without memory
    fn allocate_buffer_memory(&self, buffer: &mut GpuBuffer) -> Result<()>;

    /// Allocate a block of memory that can be bound to resources later
    fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        info: &AllocationCreateInfo,
    ) -> Result<MemoryAllocation>;

    /// Release a memory block obtained from [`GpuContext::allocate_memory`]
    fn free_memory(&self, allocation: MemoryAllocation);

    /// Bind an external memory block to an image created without memory
    fn bind_image_memory(&self, image: &mut GpuImage, allocation: &MemoryAllocation) -> Result<()>;

    /// Bind an external memory block to a buffer created without memory
    fn bind_buffer_memory(
        &self,
        buffer: &mut GpuBuffer,
        allocation: &MemoryAllocation,
    ) -> Result<()>;

    /// Hand an image to the context for release once the GPU is done with it
    fn register_image_cleanup(&self, image: GpuImage);

    /// Hand a buffer to the context for release once the GPU is done with it
    fn register_buffer_cleanup(&self, buffer: GpuBuffer);

    /// Release every resource registered for cleanup
    ///
    /// Callers invoke this after the submissions that used those resources
    /// have completed.
    fn flush_cleanup(&self);

    /// Record a pipeline barrier in the current submission
    fn submit_pipeline_barrier(&self, barrier: &PipelineBarrier);

    /// Write bytes into a buffer at `offset`
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Create a uniform buffer initialized with `contents`
    fn create_uniform_buffer(&self, contents: &[u8]) -> Result<GpuBuffer> {
        let desc = BufferDescriptor {
            size: contents.len() as u64,
            usage: BufferUsage::Uniform,
        };
        let buffer = self.create_buffer(&desc, true)?;
        if let Err(e) = self.write_buffer(&buffer, 0, contents) {
            self.register_buffer_cleanup(buffer);
            return Err(e);
        }
        Ok(buffer)
    }
}

// ============================================================================
// Shared helpers for context implementations
// ============================================================================

/// Memory type bit used by every resource; contexts expose a single heap
pub(crate) const DEVICE_LOCAL_MEMORY_TYPE: u32 = 0b1;

/// `size` rounded up to `alignment`, failing when the result leaves the u64 range
fn aligned_size(size: u64, alignment: u64) -> Result<u64> {
    size.checked_next_multiple_of(alignment.max(1)).ok_or_else(|| {
        Error::allocation_failure(size, format!("size overflows once aligned to {alignment}"))
    })
}

/// Memory requirements of a buffer under `config`
pub(crate) fn buffer_requirements(
    config: &ContextConfig,
    desc: &BufferDescriptor,
) -> Result<MemoryRequirements> {
    let alignment = match desc.usage {
        BufferUsage::Storage => config.buffer_alignment,
        BufferUsage::Uniform => config.uniform_alignment,
    };
    Ok(MemoryRequirements {
        size: aligned_size(desc.size, alignment)?,
        alignment,
        memory_type_bits: DEVICE_LOCAL_MEMORY_TYPE,
    })
}

/// Memory requirements of an image under `config`
pub(crate) fn image_requirements(
    config: &ContextConfig,
    desc: &ImageDescriptor,
) -> Result<MemoryRequirements> {
    let alignment = config.buffer_alignment;
    Ok(MemoryRequirements {
        size: aligned_size(desc.size_in_bytes(), alignment)?,
        alignment,
        memory_type_bits: DEVICE_LOCAL_MEMORY_TYPE,
    })
}

/// Validate binding `allocation` to a resource in `state` with `requirements`
pub(crate) fn check_bind(
    operation: &'static str,
    id: ResourceId,
    state: MemoryState,
    requirements: &MemoryRequirements,
    allocation: &MemoryAllocation,
) -> Result<()> {
    if state.is_allocated() {
        return Err(Error::precondition(
            operation,
            format!("resource {id} already has memory ({state:?})"),
        ));
    }
    if !allocation.satisfies(requirements) {
        return Err(Error::precondition(
            operation,
            format!(
                "allocation {} of {} bytes cannot back resource {id} requiring {} bytes",
                allocation.id,
                allocation.size,
                requirements.size
            ),
        ));
    }
    Ok(())
}
