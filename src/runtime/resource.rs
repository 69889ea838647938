//! Physical resource handles
//!
//! Contexts do not hand out raw API objects. Every image, buffer and memory
//! allocation is identified by a `u64` id that maps to the real object in the
//! context's registry. Handles are move-only: exactly one owner can register
//! a handle for cleanup, so the same object is never released twice.

use super::barrier::ImageLayout;
use crate::dtype::TexelFormat;
use crate::tensor::{StorageType, UVec3};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for resource ids
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of an image, buffer or memory allocation
///
/// Ids are unique within a process lifetime. Id 0 is never issued.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Issue a fresh id
    #[inline]
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Create from raw value (for testing only)
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Memory backing state of an image or buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryState {
    /// Handle exists but no memory is bound
    Unallocated,
    /// Memory allocated by the context for this resource alone
    Owned,
    /// Memory bound from an external allocation (memory pool)
    Bound(ResourceId),
}

impl MemoryState {
    /// True if memory is bound, owned or external
    #[inline]
    pub fn is_allocated(self) -> bool {
        !matches!(self, Self::Unallocated)
    }
}

/// Intended memory placement of a resource
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Device-local memory, not host visible
    #[default]
    GpuOnly,
    /// Host-visible memory written by the CPU and read by the GPU
    CpuToGpu,
}

/// Allocation parameters of a resource, for memory planning
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocationCreateInfo {
    /// Memory placement
    pub usage: MemoryUsage,
    /// True if the allocation may alias other resources' memory
    pub allow_aliasing: bool,
}

impl Default for AllocationCreateInfo {
    fn default() -> Self {
        Self {
            usage: MemoryUsage::GpuOnly,
            allow_aliasing: true,
        }
    }
}

/// Memory requirements of a resource
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Size in bytes
    pub size: u64,
    /// Required alignment in bytes
    pub alignment: u64,
    /// Bitmask of compatible memory types
    pub memory_type_bits: u32,
}

/// A block of device memory that can be bound to resources
///
/// Owned by the caller (typically a memory pool) and released with
/// [`GpuContext::free_memory`](super::GpuContext::free_memory).
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryAllocation {
    pub(crate) id: ResourceId,
    pub(crate) size: u64,
    pub(crate) memory_type_bits: u32,
}

impl MemoryAllocation {
    /// Allocation id
    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True if this allocation can back a resource with `requirements`
    pub fn satisfies(&self, requirements: &MemoryRequirements) -> bool {
        self.size >= requirements.size
            && self.memory_type_bits & requirements.memory_type_bits != 0
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Parameters for creating an image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Image dimensionality
    pub storage_type: StorageType,
    /// Extents in texels
    pub extents: UVec3,
    /// Texel format
    pub format: TexelFormat,
}

impl ImageDescriptor {
    /// Size of the image contents in bytes, saturating at `u64::MAX`
    pub fn size_in_bytes(&self) -> u64 {
        self.extents
            .iter()
            .fold(self.format.texel_size(), |acc, &e| acc.saturating_mul(e as u64))
    }
}

/// What a buffer is used for
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Read/write storage buffer holding tensor data
    Storage,
    /// Small uniform buffer holding shader parameters
    Uniform,
}

/// Parameters for creating a buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Size in bytes
    pub size: u64,
    /// Usage
    pub usage: BufferUsage,
}

// ============================================================================
// Handles
// ============================================================================

/// Handle to an image owned by a context
#[derive(Debug)]
pub struct GpuImage {
    pub(crate) id: ResourceId,
    pub(crate) desc: ImageDescriptor,
    pub(crate) layout: ImageLayout,
    pub(crate) memory: MemoryState,
    pub(crate) requirements: MemoryRequirements,
}

impl GpuImage {
    /// Create a handle; used by context implementations
    pub fn new(id: ResourceId, desc: ImageDescriptor, requirements: MemoryRequirements) -> Self {
        Self {
            id,
            desc,
            layout: ImageLayout::Undefined,
            memory: MemoryState::Unallocated,
            requirements,
        }
    }

    /// Image id
    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Image dimensionality
    #[inline]
    pub fn storage_type(&self) -> StorageType {
        self.desc.storage_type
    }

    /// Extents in texels
    #[inline]
    pub fn extents(&self) -> UVec3 {
        self.desc.extents
    }

    /// Texel format
    #[inline]
    pub fn format(&self) -> TexelFormat {
        self.desc.format
    }

    /// Creation descriptor
    #[inline]
    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.desc
    }

    /// Current image layout
    #[inline]
    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    #[inline]
    pub(crate) fn set_layout(&mut self, layout: ImageLayout) {
        self.layout = layout;
    }

    /// Memory backing state
    #[inline]
    pub fn memory(&self) -> MemoryState {
        self.memory
    }

    /// Set the memory state; used by context implementations
    #[inline]
    pub fn set_memory(&mut self, memory: MemoryState) {
        self.memory = memory;
    }

    /// True if the context allocated this image's memory for it alone
    #[inline]
    pub fn owns_memory(&self) -> bool {
        self.memory == MemoryState::Owned
    }

    /// Memory requirements
    #[inline]
    pub fn memory_requirements(&self) -> MemoryRequirements {
        self.requirements
    }
}

/// Handle to a buffer owned by a context
#[derive(Debug)]
pub struct GpuBuffer {
    pub(crate) id: ResourceId,
    pub(crate) desc: BufferDescriptor,
    pub(crate) memory: MemoryState,
    pub(crate) requirements: MemoryRequirements,
}

impl GpuBuffer {
    /// Create a handle; used by context implementations
    pub fn new(id: ResourceId, desc: BufferDescriptor, requirements: MemoryRequirements) -> Self {
        Self {
            id,
            desc,
            memory: MemoryState::Unallocated,
            requirements,
        }
    }

    /// Buffer id
    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Size in bytes as requested at creation
    #[inline]
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    /// Buffer usage
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.desc.usage
    }

    /// Memory backing state
    #[inline]
    pub fn memory(&self) -> MemoryState {
        self.memory
    }

    /// Set the memory state; used by context implementations
    #[inline]
    pub fn set_memory(&mut self, memory: MemoryState) {
        self.memory = memory;
    }

    /// True if the context allocated this buffer's memory for it alone
    #[inline]
    pub fn owns_memory(&self) -> bool {
        self.memory == MemoryState::Owned
    }

    /// Memory requirements
    #[inline]
    pub fn memory_requirements(&self) -> MemoryRequirements {
        self.requirements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids() {
        let a = ResourceId::next();
        let b = ResourceId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
        assert_ne!(a.raw(), 0);
    }

    #[test]
    fn test_image_descriptor_size() {
        let desc = ImageDescriptor {
            storage_type: StorageType::Texture3D,
            extents: [8, 8, 1],
            format: TexelFormat::Rgba32Float,
        };
        assert_eq!(desc.size_in_bytes(), 8 * 8 * 16);
    }

    #[test]
    fn test_allocation_satisfies() {
        let alloc = MemoryAllocation {
            id: ResourceId::next(),
            size: 1024,
            memory_type_bits: 0b01,
        };
        let fits = MemoryRequirements {
            size: 512,
            alignment: 256,
            memory_type_bits: 0b11,
        };
        let too_big = MemoryRequirements { size: 2048, ..fits };
        let wrong_type = MemoryRequirements {
            memory_type_bits: 0b10,
            ..fits
        };
        assert!(alloc.satisfies(&fits));
        assert!(!alloc.satisfies(&too_big));
        assert!(!alloc.satisfies(&wrong_type));
    }
}
