//! Storage: the physical GPU memory object behind a tensor
//!
//! A `TensorStorage` owns exactly one image or buffer handle and remembers
//! the last pipeline stage and access mode that touched it. Every
//! synchronizing access compares the new access against that record and
//! emits the memory barrier (and image layout transition) the hazard needs.

use super::layout::{
    GpuMemoryLayout, StorageType, UVec3, checked_buffer_length, create_image_extents,
};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::{
    AllocationCreateInfo, BufferDescriptor, BufferMemoryBarrier, BufferUsage, GpuBuffer,
    GpuContext, GpuImage, ImageDescriptor, ImageLayout, ImageMemoryBarrier, LastAccess,
    MemoryAccess, MemoryAllocation, MemoryRequirements, MemoryState, PipelineBarrier,
    PipelineStage, ResourceId, access_mask,
};
use std::fmt;

/// The physical object backing a tensor
#[derive(Debug)]
pub enum Resource {
    /// Image texture
    Image(GpuImage),
    /// Linear buffer
    Buffer(GpuBuffer),
}

impl Resource {
    /// Handle id
    #[inline]
    pub fn id(&self) -> ResourceId {
        match self {
            Self::Image(image) => image.id(),
            Self::Buffer(buffer) => buffer.id(),
        }
    }

    /// Memory backing state
    #[inline]
    pub fn memory(&self) -> MemoryState {
        match self {
            Self::Image(image) => image.memory(),
            Self::Buffer(buffer) => buffer.memory(),
        }
    }

    /// Memory requirements
    #[inline]
    pub fn memory_requirements(&self) -> MemoryRequirements {
        match self {
            Self::Image(image) => image.memory_requirements(),
            Self::Buffer(buffer) => buffer.memory_requirements(),
        }
    }

    /// The image, if this is an image
    #[inline]
    pub fn as_image(&self) -> Option<&GpuImage> {
        match self {
            Self::Image(image) => Some(image),
            Self::Buffer(_) => None,
        }
    }

    /// The buffer, if this is a buffer
    #[inline]
    pub fn as_buffer(&self) -> Option<&GpuBuffer> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            Self::Image(_) => None,
        }
    }
}

enum ResourceDescriptor {
    Image(ImageDescriptor),
    Buffer(BufferDescriptor),
}

/// Physical GPU storage of a tensor
///
/// Created against an explicit [`GpuContext`] and registered with it for
/// deferred cleanup when dropped or reallocated. Accesses that need
/// synchronization go through [`TensorStorage::transition`] or
/// [`TensorStorage::access_for_stage`]; both update the last-access record
/// synchronously with the call.
pub struct TensorStorage<C: GpuContext> {
    context: C,
    storage_type: StorageType,
    dtype: DType,
    /// Image extents; zero for buffer storage
    extents: UVec3,
    /// Number of elements the buffer holds (product of the gpu sizes)
    buffer_length: usize,
    /// `None` only while dropping
    resource: Option<Resource>,
    last_access: LastAccess,
}

impl<C: GpuContext> TensorStorage<C> {
    /// Create storage for a tensor with the given padded sizes
    ///
    /// With `allocate_memory` unset the handle is created without memory;
    /// the caller binds memory with [`TensorStorage::bind_allocation`] or
    /// [`TensorStorage::allocate`] before the first synchronizing access.
    pub fn new(
        context: &C,
        storage_type: StorageType,
        layout: GpuMemoryLayout,
        gpu_sizes: &[usize],
        dtype: DType,
        allocate_memory: bool,
    ) -> Result<Self> {
        let extents = create_image_extents(gpu_sizes, storage_type, layout)?;
        let buffer_length = checked_buffer_length(storage_type, gpu_sizes, dtype)?;
        let resource = create_resource(
            context,
            storage_type,
            extents,
            buffer_length,
            dtype,
            allocate_memory,
        )?;

        let storage = Self {
            context: context.clone(),
            storage_type,
            dtype,
            extents,
            buffer_length,
            resource: Some(resource),
            last_access: LastAccess::default(),
        };
        storage.verify()?;
        Ok(storage)
    }

    /// Check that the handle matches the storage type and its extents are usable
    pub fn verify(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::invalid_configuration(self.storage_type, reason));
        match (self.storage_type, self.resource()) {
            (StorageType::Buffer, Resource::Buffer(buffer)) => {
                if self.buffer_length == 0 || buffer.size() == 0 {
                    return invalid("buffer holds no elements".to_string());
                }
            }
            (ty, Resource::Image(image)) if ty.is_texture() => {
                if image.storage_type() != ty || image.extents() != self.extents {
                    return invalid(format!(
                        "image {} is {:?} {:?}, expected {ty:?} {:?}",
                        image.id(),
                        image.storage_type(),
                        image.extents(),
                        self.extents
                    ));
                }
                check_extents(ty, self.extents)?;
            }
            (_, resource) => {
                return invalid(format!("handle {} has the wrong kind", resource.id()));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Context the storage was created against
    #[inline]
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Storage type
    #[inline]
    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    /// Element type the storage was sized for
    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Physical image extents; `[0, 0, 0]` for buffers
    #[inline]
    pub fn extents(&self) -> UVec3 {
        self.extents
    }

    /// Number of elements the physical buffer holds
    #[inline]
    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    /// Most recent synchronizing access
    #[inline]
    pub fn last_access(&self) -> LastAccess {
        self.last_access
    }

    /// The physical handle, without synchronization
    #[inline]
    pub fn resource(&self) -> &Resource {
        self.resource
            .as_ref()
            .expect("storage resource is only taken when dropped")
    }

    fn resource_mut(&mut self) -> &mut Resource {
        self.resource
            .as_mut()
            .expect("storage resource is only taken when dropped")
    }

    /// The image handle, if image-backed
    #[inline]
    pub fn image(&self) -> Option<&GpuImage> {
        self.resource().as_image()
    }

    /// The buffer handle, if buffer-backed
    #[inline]
    pub fn buffer(&self) -> Option<&GpuBuffer> {
        self.resource().as_buffer()
    }

    /// True once memory is bound, owned or external
    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.resource().memory().is_allocated()
    }

    /// True if the physical footprint equals the given extents and buffer length
    pub(crate) fn footprint_matches(&self, extents: UVec3, buffer_length: usize) -> bool {
        if self.storage_type.is_texture() {
            self.extents == extents
        } else {
            self.buffer_length == buffer_length
        }
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Allocation parameters for memory planning
    pub fn allocation_create_info(&self) -> AllocationCreateInfo {
        AllocationCreateInfo::default()
    }

    /// Memory requirements of the handle
    #[inline]
    pub fn memory_requirements(&self) -> MemoryRequirements {
        self.resource().memory_requirements()
    }

    /// Allocate dedicated memory for a handle created without memory
    pub fn allocate(&mut self) -> Result<()> {
        let context = self.context.clone();
        match self.resource_mut() {
            Resource::Image(image) => context.allocate_image_memory(image),
            Resource::Buffer(buffer) => context.allocate_buffer_memory(buffer),
        }
    }

    /// Bind externally allocated memory to a handle created without memory
    pub fn bind_allocation(&mut self, allocation: &MemoryAllocation) -> Result<()> {
        let context = self.context.clone();
        match self.resource_mut() {
            Resource::Image(image) => context.bind_image_memory(image, allocation),
            Resource::Buffer(buffer) => context.bind_buffer_memory(buffer, allocation),
        }
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Record the barrier needed before accessing the storage at `stage` with
    /// `access` into `barrier`, and make this the last access
    ///
    /// A barrier is added when the previous access wrote or the new access
    /// writes, or when an image has to change layout. Read-after-read adds
    /// nothing, and neither does a first access to a buffer. An empty `stage`
    /// or `access` is a [`Error::PreconditionViolation`].
    pub fn transition(
        &mut self,
        barrier: &mut PipelineBarrier,
        stage: PipelineStage,
        access: MemoryAccess,
    ) -> Result<()> {
        if stage.is_empty() || access.is_empty() {
            return Err(Error::precondition(
                "transition",
                format!("access {access:?} at stage {stage:?} touches nothing"),
            ));
        }
        if !self.is_allocated() {
            return Err(Error::precondition(
                "transition",
                format!("resource {} has no memory bound", self.resource().id()),
            ));
        }

        let prev = self.last_access;
        let hazard = !prev.is_none() && (prev.access.writes() || access.writes());
        let src_access = access_mask(prev.stage, prev.access);
        let dst_access = access_mask(stage, access);

        let added = match self.resource_mut() {
            Resource::Image(image) => {
                let old_layout = image.layout();
                let new_layout = ImageLayout::for_access(stage, access);
                if hazard || old_layout != new_layout {
                    barrier.images.push(ImageMemoryBarrier {
                        image: image.id(),
                        src_access,
                        dst_access,
                        old_layout,
                        new_layout,
                    });
                    image.set_layout(new_layout);
                    true
                } else {
                    false
                }
            }
            Resource::Buffer(buffer) => {
                if hazard {
                    barrier.buffers.push(BufferMemoryBarrier {
                        buffer: buffer.id(),
                        src_access,
                        dst_access,
                    });
                    true
                } else {
                    false
                }
            }
        };

        if added {
            barrier.add_stages(prev.stage, stage);
            tracing::trace!(
                resource = %self.resource().id(),
                prev = ?prev,
                stage = ?stage,
                access = ?access,
                "storage: barrier required"
            );
        }
        self.last_access = LastAccess::new(stage, access);
        Ok(())
    }

    /// Synchronize for an access at `stage` and return the handle
    ///
    /// Any required barrier is submitted to the context immediately.
    pub fn access_for_stage(
        &mut self,
        stage: PipelineStage,
        access: MemoryAccess,
    ) -> Result<&Resource> {
        let mut barrier = PipelineBarrier::new();
        self.transition(&mut barrier, stage, access)?;
        if !barrier.is_empty() {
            self.context.submit_pipeline_barrier(&barrier);
        }
        Ok(self.resource())
    }

    // ========================================================================
    // Reallocation
    // ========================================================================

    /// Replace the physical object with one sized for `gpu_sizes`
    ///
    /// The current object is registered for cleanup without a barrier and the
    /// last access is reset. Storage that owned its memory gets freshly
    /// allocated memory; storage bound to external memory comes back
    /// unallocated. On error the current object is kept.
    pub fn discard_and_reallocate(
        &mut self,
        gpu_sizes: &[usize],
        layout: GpuMemoryLayout,
        dtype: DType,
    ) -> Result<()> {
        let extents = create_image_extents(gpu_sizes, self.storage_type, layout)?;
        let buffer_length = checked_buffer_length(self.storage_type, gpu_sizes, dtype)?;
        let owns_memory = self.resource().memory() == MemoryState::Owned;
        let resource = create_resource(
            &self.context,
            self.storage_type,
            extents,
            buffer_length,
            dtype,
            owns_memory,
        )?;

        if self.last_access.access.writes() {
            tracing::warn!(
                resource = %self.resource().id(),
                last_access = ?self.last_access,
                "storage: discarding resource with an outstanding write"
            );
        }
        if let Some(old) = self.resource.replace(resource) {
            tracing::debug!(
                old = %old.id(),
                new = %self.resource().id(),
                ?extents,
                buffer_length,
                "storage: reallocated"
            );
            release(&self.context, old);
        }
        self.dtype = dtype;
        self.extents = extents;
        self.buffer_length = buffer_length;
        self.last_access = LastAccess::default();
        self.verify()
    }
}

impl<C: GpuContext> Drop for TensorStorage<C> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            release(&self.context, resource);
        }
    }
}

impl<C: GpuContext> fmt::Debug for TensorStorage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorStorage")
            .field("storage_type", &self.storage_type)
            .field("dtype", &self.dtype)
            .field("extents", &self.extents)
            .field("buffer_length", &self.buffer_length)
            .field("resource", &self.resource)
            .field("last_access", &self.last_access)
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn release<C: GpuContext>(context: &C, resource: Resource) {
    match resource {
        Resource::Image(image) => context.register_image_cleanup(image),
        Resource::Buffer(buffer) => context.register_buffer_cleanup(buffer),
    }
}

/// Texture extents must be non-zero and fit the image dimensionality
fn check_extents(storage_type: StorageType, extents: UVec3) -> Result<()> {
    if extents.contains(&0) {
        return Err(Error::invalid_configuration(
            storage_type,
            format!("extents {extents:?} contain a zero"),
        ));
    }
    let fits = match storage_type {
        StorageType::Texture1D => extents[1] == 1 && extents[2] == 1,
        StorageType::Texture2D => extents[2] == 1,
        _ => true,
    };
    if !fits {
        return Err(Error::invalid_configuration(
            storage_type,
            format!("extents {extents:?} exceed the image dimensionality"),
        ));
    }
    Ok(())
}

fn describe(
    storage_type: StorageType,
    extents: UVec3,
    buffer_length: usize,
    dtype: DType,
) -> Result<ResourceDescriptor> {
    if storage_type.is_texture() {
        let format = dtype.texel_format().ok_or_else(|| {
            Error::invalid_configuration(storage_type, format!("{dtype} has no texel format"))
        })?;
        check_extents(storage_type, extents)?;
        return Ok(ResourceDescriptor::Image(ImageDescriptor {
            storage_type,
            extents,
            format,
        }));
    }

    let size = (buffer_length as u64)
        .checked_mul(dtype.size_in_bytes() as u64)
        .ok_or_else(|| Error::invalid_configuration(storage_type, "buffer size overflows u64"))?;
    if size == 0 {
        return Err(Error::invalid_configuration(
            storage_type,
            "buffer holds no elements",
        ));
    }
    Ok(ResourceDescriptor::Buffer(BufferDescriptor {
        size,
        usage: BufferUsage::Storage,
    }))
}

fn create_resource<C: GpuContext>(
    context: &C,
    storage_type: StorageType,
    extents: UVec3,
    buffer_length: usize,
    dtype: DType,
    allocate_memory: bool,
) -> Result<Resource> {
    let resource = match describe(storage_type, extents, buffer_length, dtype)? {
        ResourceDescriptor::Image(desc) => {
            Resource::Image(context.create_image(&desc, allocate_memory)?)
        }
        ResourceDescriptor::Buffer(desc) => {
            Resource::Buffer(context.create_buffer(&desc, allocate_memory)?)
        }
    };
    tracing::debug!(
        resource = %resource.id(),
        ?storage_type,
        ?extents,
        buffer_length,
        allocate_memory,
        "storage: created"
    );
    Ok(resource)
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;
    use crate::runtime::host::HostContext;
    use crate::tensor::layout::calc_gpu_sizes;

    fn storage(
        ctx: &HostContext,
        storage_type: StorageType,
        sizes: &[usize],
    ) -> Result<TensorStorage<HostContext>> {
        let layout = GpuMemoryLayout::ChannelsPacked;
        let gpu_sizes = calc_gpu_sizes(sizes, layout).unwrap();
        TensorStorage::new(ctx, storage_type, layout, &gpu_sizes, DType::F32, true)
    }

    #[test]
    fn test_texture_storage() {
        let ctx = HostContext::new();
        let s = storage(&ctx, StorageType::Texture3D, &[2, 3, 4, 5]).unwrap();
        assert_eq!(s.extents(), [5, 4, 2]);
        assert!(s.image().is_some());
        assert!(s.buffer().is_none());
        assert!(s.is_allocated());
    }

    #[test]
    fn test_buffer_storage() {
        let ctx = HostContext::new();
        let s = storage(&ctx, StorageType::Buffer, &[3, 5]).unwrap();
        assert_eq!(s.extents(), [0, 0, 0]);
        assert_eq!(s.buffer_length(), 20);
        assert_eq!(s.buffer().map(|b| b.size()), Some(80));
    }

    #[test]
    fn test_invalid_configurations() {
        let ctx = HostContext::new();
        let err = storage(&ctx, StorageType::Texture3D, &[1, 2, 3, 4, 5]).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));

        // Two channel texels do not fit a 2D image.
        let err = storage(&ctx, StorageType::Texture2D, &[8, 4, 4]).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));

        let err = storage(&ctx, StorageType::Buffer, &[0, 4]).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));

        let gpu = calc_gpu_sizes(&[4, 4], GpuMemoryLayout::WidthPacked).unwrap();
        let err = TensorStorage::new(
            &ctx,
            StorageType::Texture2D,
            GpuMemoryLayout::WidthPacked,
            &gpu,
            DType::F64,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));
        assert_eq!(ctx.stats().live_images, 0);
    }

    #[test]
    fn test_read_after_read_on_buffer() {
        let ctx = HostContext::new();
        let mut s = storage(&ctx, StorageType::Buffer, &[16]).unwrap();
        let mut barrier = PipelineBarrier::new();
        s.transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::READ).unwrap();
        s.transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::READ).unwrap();
        assert!(barrier.is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let ctx = HostContext::new();
        let mut s = storage(&ctx, StorageType::Buffer, &[16]).unwrap();
        let mut barrier = PipelineBarrier::new();
        s.transition(&mut barrier, PipelineStage::TRANSFER, MemoryAccess::WRITE).unwrap();
        assert!(barrier.is_empty());
        s.transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::READ).unwrap();
        assert_eq!(barrier.buffers.len(), 1);
        assert_eq!(barrier.buffers[0].src_access, crate::runtime::AccessMask::TRANSFER_WRITE);
        assert_eq!(barrier.buffers[0].dst_access, crate::runtime::AccessMask::SHADER_READ);
        assert_eq!(
            s.last_access(),
            LastAccess::new(PipelineStage::COMPUTE, MemoryAccess::READ)
        );
    }

    #[test]
    fn test_empty_access_rejected() {
        let ctx = HostContext::new();
        let mut s = storage(&ctx, StorageType::Buffer, &[16]).unwrap();
        let mut barrier = PipelineBarrier::new();
        s.transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::WRITE).unwrap();

        let err = s
            .transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::NONE)
            .unwrap_err();
        assert!(err.is_precondition());
        let err = s
            .transition(&mut barrier, PipelineStage::NONE, MemoryAccess::READ)
            .unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(
            s.last_access(),
            LastAccess::new(PipelineStage::COMPUTE, MemoryAccess::WRITE)
        );

        // The rejected calls leave the pending write visible to the next access.
        s.transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::WRITE).unwrap();
        assert_eq!(barrier.buffers.len(), 1);
    }

    #[test]
    fn test_empty_access_keeps_image_layout() {
        let ctx = HostContext::new();
        let mut s = storage(&ctx, StorageType::Texture3D, &[4, 4, 4]).unwrap();
        let mut barrier = PipelineBarrier::new();
        s.transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::WRITE).unwrap();
        assert!(s
            .transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::NONE)
            .is_err());
        assert_eq!(s.image().map(|i| i.layout()), Some(ImageLayout::General));
    }

    #[test]
    fn test_image_layout_transitions() {
        let ctx = HostContext::new();
        let mut s = storage(&ctx, StorageType::Texture3D, &[4, 4, 4]).unwrap();
        let mut barrier = PipelineBarrier::new();

        // First read moves the image out of the undefined layout.
        s.transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::READ).unwrap();
        assert_eq!(barrier.images.len(), 1);
        assert_eq!(barrier.images[0].old_layout, ImageLayout::Undefined);
        assert_eq!(s.image().map(|i| i.layout()), Some(ImageLayout::ShaderReadOnly));

        s.transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::READ).unwrap();
        assert_eq!(barrier.images.len(), 1);

        s.transition(&mut barrier, PipelineStage::COMPUTE, MemoryAccess::WRITE).unwrap();
        assert_eq!(barrier.images.len(), 2);
        assert_eq!(barrier.images[1].new_layout, ImageLayout::General);
    }

    #[test]
    fn test_access_unallocated_is_precondition() {
        let ctx = HostContext::new();
        let gpu = calc_gpu_sizes(&[8], GpuMemoryLayout::WidthPacked).unwrap();
        let mut s = TensorStorage::new(
            &ctx,
            StorageType::Buffer,
            GpuMemoryLayout::WidthPacked,
            &gpu,
            DType::F32,
            false,
        )
        .unwrap();
        let err = s
            .access_for_stage(PipelineStage::COMPUTE, MemoryAccess::READ)
            .unwrap_err();
        assert!(err.is_precondition());

        s.allocate().unwrap();
        assert!(s.access_for_stage(PipelineStage::COMPUTE, MemoryAccess::READ).is_ok());
    }

    #[test]
    fn test_discard_and_reallocate() {
        let ctx = HostContext::new();
        let mut s = storage(&ctx, StorageType::Buffer, &[4]).unwrap();
        let old = s.resource().id();
        s.access_for_stage(PipelineStage::COMPUTE, MemoryAccess::WRITE).unwrap();

        let gpu = calc_gpu_sizes(&[64], GpuMemoryLayout::ChannelsPacked).unwrap();
        s.discard_and_reallocate(&gpu, GpuMemoryLayout::ChannelsPacked, DType::F32)
            .unwrap();
        assert_ne!(s.resource().id(), old);
        assert!(s.resource().memory() == MemoryState::Owned);
        assert!(s.last_access().is_none());
        assert_eq!(s.buffer_length(), 64);

        ctx.flush_cleanup();
        assert!(!ctx.is_live(old));
    }

    #[test]
    fn test_drop_registers_cleanup() {
        let ctx = HostContext::new();
        let id = {
            let s = storage(&ctx, StorageType::Texture3D, &[4, 4]).unwrap();
            s.resource().id()
        };
        assert_eq!(ctx.stats().pending_cleanup, 1);
        ctx.flush_cleanup();
        assert!(!ctx.is_live(id));
    }
}
