//! Core VTensor type

use super::layout::{
    GpuMemoryLayout, Sizes, StorageType, UVec3, calc_gpu_sizes, check_rank,
    checked_buffer_length, create_image_extents, make_extents_uvec4, make_whcn_ivec4,
};
use super::storage::TensorStorage;
use crate::dtype::{DType, TexelFormat};
use crate::error::{Error, Result};
use crate::runtime::{
    AllocationCreateInfo, GpuBuffer, GpuContext, GpuImage, LastAccess, MemoryAccess,
    MemoryAllocation, MemoryRequirements, PipelineBarrier, PipelineStage, UniformParamsBuffer,
};
use std::fmt;
use std::sync::Arc;

/// Shared handle to a tensor's uniform parameter buffer
pub type UniformRef<C> = Arc<UniformParamsBuffer<C>>;

/// GPU tensor: shape metadata over a physical [`TensorStorage`]
///
/// `VTensor` records the logical sizes a compute shader sees, the padded
/// sizes the GPU memory actually holds, and which WHCN dimension is packed
/// into 4-wide texels. It also hands out three uniform buffers describing
/// that metadata:
///
/// | Buffer            | Contents                                    |
/// |-------------------|---------------------------------------------|
/// | `sizes_ubo`       | logical sizes, WHCN `ivec4`, missing dims 1 |
/// | `gpu_sizes_ubo`   | padded sizes, WHCN `ivec4`, missing dims 1  |
/// | `extents_ubo`     | image extents as `uvec4` with a trailing 1  |
///
/// Uniform buffers are created on first request and cached. They are never
/// written after creation; a size change that alters a buffer's contents
/// drops the cached buffer so the next request creates a fresh one.
///
/// # Resizing
///
/// - [`VTensor::virtual_resize`] changes the metadata only. The new shape
///   must fit the existing allocation.
/// - [`VTensor::reallocate`] replaces the physical object when the new
///   footprint differs from the current one.
///
/// # Synchronization
///
/// `image()` and `buffer()` peek at the handle. The `*_for_stage`,
/// `*_for_access` and `*_with_barrier` accessors compute the memory barrier
/// the access needs against the previous one and update the last access.
pub struct VTensor<C: GpuContext> {
    dtype: DType,
    memory_layout: GpuMemoryLayout,
    sizes: Sizes,
    gpu_sizes: Sizes,
    /// Extents the shaders see; may be smaller than the image after a virtual resize
    extents: UVec3,
    sizes_uniform: Option<UniformRef<C>>,
    gpu_sizes_uniform: Option<UniformRef<C>>,
    extents_uniform: Option<UniformRef<C>>,
    storage: TensorStorage<C>,
}

impl<C: GpuContext> VTensor<C> {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Create a channels-packed 3D texture tensor with allocated memory
    pub fn new(context: &C, sizes: &[usize], dtype: DType) -> Result<Self> {
        Self::with_options(
            context,
            sizes,
            dtype,
            StorageType::Texture3D,
            GpuMemoryLayout::ChannelsPacked,
            true,
        )
    }

    /// Create a tensor with explicit storage type, memory layout and allocation mode
    ///
    /// With `allocate_memory` unset the tensor has a handle but no memory;
    /// bind memory with [`VTensor::bind_allocation`] or [`VTensor::allocate`]
    /// before the first synchronizing access.
    pub fn with_options(
        context: &C,
        sizes: &[usize],
        dtype: DType,
        storage_type: StorageType,
        memory_layout: GpuMemoryLayout,
        allocate_memory: bool,
    ) -> Result<Self> {
        check_rank(storage_type, sizes.len())?;
        let gpu_sizes = padded_sizes(sizes, memory_layout, storage_type)?;
        let storage = TensorStorage::new(
            context,
            storage_type,
            memory_layout,
            &gpu_sizes,
            dtype,
            allocate_memory,
        )?;

        tracing::debug!(
            sizes = ?sizes,
            gpu_sizes = ?gpu_sizes.as_slice(),
            %dtype,
            ?storage_type,
            ?memory_layout,
            "vtensor: created"
        );

        Ok(Self {
            dtype,
            memory_layout,
            sizes: sizes.iter().copied().collect(),
            extents: storage.extents(),
            gpu_sizes,
            sizes_uniform: None,
            gpu_sizes_uniform: None,
            extents_uniform: None,
            storage,
        })
    }

    // ========================================================================
    // Handle access
    // ========================================================================

    /// The image, without synchronization; `None` for buffer storage
    #[inline]
    pub fn image(&self) -> Option<&GpuImage> {
        self.storage.image()
    }

    /// The image for a read at `stage`, after any required barrier
    pub fn image_for_stage(&mut self, stage: PipelineStage) -> Result<&GpuImage> {
        self.image_for_access(stage, MemoryAccess::READ)
    }

    /// The image for an access at `stage`, after any required barrier
    ///
    /// The barrier is submitted to the context immediately.
    pub fn image_for_access(
        &mut self,
        stage: PipelineStage,
        access: MemoryAccess,
    ) -> Result<&GpuImage> {
        self.expect_texture("image_for_access")?;
        let resource = self.storage.access_for_stage(stage, access)?;
        resource
            .as_image()
            .ok_or_else(|| Error::Backend("texture storage without an image".to_string()))
    }

    /// The image for an access at `stage`, adding any required barrier to `barrier`
    pub fn image_with_barrier(
        &mut self,
        barrier: &mut PipelineBarrier,
        stage: PipelineStage,
        access: MemoryAccess,
    ) -> Result<&GpuImage> {
        self.expect_texture("image_with_barrier")?;
        self.storage.transition(barrier, stage, access)?;
        self.storage
            .image()
            .ok_or_else(|| Error::Backend("texture storage without an image".to_string()))
    }

    /// The buffer, without synchronization; `None` for texture storage
    #[inline]
    pub fn buffer(&self) -> Option<&GpuBuffer> {
        self.storage.buffer()
    }

    /// The buffer for a read at `stage`, after any required barrier
    pub fn buffer_for_stage(&mut self, stage: PipelineStage) -> Result<&GpuBuffer> {
        self.buffer_for_access(stage, MemoryAccess::READ)
    }

    /// The buffer for an access at `stage`, after any required barrier
    ///
    /// The barrier is submitted to the context immediately.
    pub fn buffer_for_access(
        &mut self,
        stage: PipelineStage,
        access: MemoryAccess,
    ) -> Result<&GpuBuffer> {
        self.expect_buffer("buffer_for_access")?;
        let resource = self.storage.access_for_stage(stage, access)?;
        resource
            .as_buffer()
            .ok_or_else(|| Error::Backend("buffer storage without a buffer".to_string()))
    }

    /// The buffer for an access at `stage`, adding any required barrier to `barrier`
    pub fn buffer_with_barrier(
        &mut self,
        barrier: &mut PipelineBarrier,
        stage: PipelineStage,
        access: MemoryAccess,
    ) -> Result<&GpuBuffer> {
        self.expect_buffer("buffer_with_barrier")?;
        self.storage.transition(barrier, stage, access)?;
        self.storage
            .buffer()
            .ok_or_else(|| Error::Backend("buffer storage without a buffer".to_string()))
    }

    fn expect_texture(&self, operation: &'static str) -> Result<()> {
        if !self.storage_type().is_texture() {
            return Err(Error::precondition(operation, "tensor is buffer-backed"));
        }
        Ok(())
    }

    fn expect_buffer(&self, operation: &'static str) -> Result<()> {
        if self.storage_type().is_texture() {
            return Err(Error::precondition(operation, "tensor is texture-backed"));
        }
        Ok(())
    }

    /// Underlying storage
    #[inline]
    pub fn storage(&self) -> &TensorStorage<C> {
        &self.storage
    }

    /// Most recent synchronizing access to the storage
    #[inline]
    pub fn last_access(&self) -> LastAccess {
        self.storage.last_access()
    }

    // ========================================================================
    // Uniform buffers
    // ========================================================================

    /// Uniform buffer holding the logical sizes as a WHCN `ivec4`
    pub fn sizes_ubo(&mut self) -> Result<UniformRef<C>> {
        let params = make_whcn_ivec4(&self.sizes);
        cached_uniform(self.storage.context(), &mut self.sizes_uniform, &params)
    }

    /// Uniform buffer holding the padded sizes as a WHCN `ivec4`
    pub fn gpu_sizes_ubo(&mut self) -> Result<UniformRef<C>> {
        let params = make_whcn_ivec4(&self.gpu_sizes);
        cached_uniform(self.storage.context(), &mut self.gpu_sizes_uniform, &params)
    }

    /// Uniform buffer holding the extents as a `uvec4` with a trailing 1
    pub fn extents_ubo(&mut self) -> Result<UniformRef<C>> {
        let params = make_extents_uvec4(self.extents);
        cached_uniform(self.storage.context(), &mut self.extents_uniform, &params)
    }

    /// Install new metadata, dropping cached uniforms whose contents changed
    fn update_metadata(&mut self, sizes: &[usize], gpu_sizes: Sizes, extents: UVec3) {
        if make_whcn_ivec4(sizes) != make_whcn_ivec4(&self.sizes) {
            self.sizes_uniform = None;
        }
        if make_whcn_ivec4(&gpu_sizes) != make_whcn_ivec4(&self.gpu_sizes) {
            self.gpu_sizes_uniform = None;
        }
        if extents != self.extents {
            self.extents_uniform = None;
        }
        self.sizes = sizes.iter().copied().collect();
        self.gpu_sizes = gpu_sizes;
        self.extents = extents;
    }

    // ========================================================================
    // Resizing
    // ========================================================================

    /// Resize to `new_sizes`, replacing the storage if the footprint changes
    ///
    /// When the padded footprint equals the current one the physical object
    /// is kept. On error the tensor is unchanged.
    pub fn reallocate(&mut self, new_sizes: &[usize]) -> Result<()> {
        let storage_type = self.storage_type();
        check_rank(storage_type, new_sizes.len())?;
        let gpu_sizes = padded_sizes(new_sizes, self.memory_layout, storage_type)?;
        let extents = create_image_extents(&gpu_sizes, storage_type, self.memory_layout)?;
        let buffer_length = checked_buffer_length(storage_type, &gpu_sizes, self.dtype)?;

        if !self.storage.footprint_matches(extents, buffer_length) {
            self.storage
                .discard_and_reallocate(&gpu_sizes, self.memory_layout, self.dtype)?;
        }
        tracing::debug!(sizes = ?new_sizes, gpu_sizes = ?gpu_sizes.as_slice(), "vtensor: resized");
        self.update_metadata(new_sizes, gpu_sizes, extents);
        Ok(())
    }

    /// Resize to `new_sizes` without touching the allocation
    ///
    /// Buffer storage requires the new padded element count to fit the
    /// buffer. Texture storage requires rank at most 4 and every new extent
    /// to fit the current image. A violation returns
    /// [`Error::PreconditionViolation`] and leaves the tensor unchanged.
    /// Sizes whose element count overflows are an
    /// [`Error::InvalidConfiguration`].
    pub fn virtual_resize(&mut self, new_sizes: &[usize]) -> Result<()> {
        let storage_type = self.storage_type();
        let gpu_sizes = padded_sizes(new_sizes, self.memory_layout, storage_type)?;
        let gpu_numel = checked_buffer_length(storage_type, &gpu_sizes, self.dtype)?;

        let extents = if storage_type.is_texture() {
            if !(1..=4).contains(&new_sizes.len()) {
                return Err(Error::precondition(
                    "virtual_resize",
                    format!("texture storage cannot hold rank {}", new_sizes.len()),
                ));
            }
            let extents = create_image_extents(&gpu_sizes, storage_type, self.memory_layout)?;
            let limit = self.storage.extents();
            if extents.iter().zip(limit.iter()).any(|(new, cur)| new > cur) {
                return Err(Error::precondition(
                    "virtual_resize",
                    format!("extents {extents:?} exceed image extents {limit:?}"),
                ));
            }
            extents
        } else if gpu_numel > self.storage.buffer_length() {
            return Err(Error::precondition(
                "virtual_resize",
                format!(
                    "{gpu_numel} elements exceed buffer length {}",
                    self.storage.buffer_length()
                ),
            ));
        } else {
            [0, 0, 0]
        };

        tracing::trace!(sizes = ?new_sizes, "vtensor: virtual resize");
        self.update_metadata(new_sizes, gpu_sizes, extents);
        Ok(())
    }

    // ========================================================================
    // Memory planning
    // ========================================================================

    /// Allocation parameters of the underlying resource
    #[inline]
    pub fn allocation_create_info(&self) -> AllocationCreateInfo {
        self.storage.allocation_create_info()
    }

    /// Memory requirements of the underlying resource
    #[inline]
    pub fn memory_requirements(&self) -> MemoryRequirements {
        self.storage.memory_requirements()
    }

    /// Bind external memory to a tensor created without memory
    pub fn bind_allocation(&mut self, allocation: &MemoryAllocation) -> Result<()> {
        self.storage.bind_allocation(allocation)
    }

    /// Allocate dedicated memory for a tensor created without memory
    pub fn allocate(&mut self) -> Result<()> {
        self.storage.allocate()
    }

    /// True once memory is bound
    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.storage.is_allocated()
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Element type
    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Packed memory layout
    #[inline]
    pub fn gpu_memory_layout(&self) -> GpuMemoryLayout {
        self.memory_layout
    }

    /// Packed memory layout as the integer shaders receive
    #[inline]
    pub fn gpu_memory_layout_int(&self) -> u32 {
        self.memory_layout as u32
    }

    /// Storage type
    #[inline]
    pub fn storage_type(&self) -> StorageType {
        self.storage.storage_type()
    }

    /// Logical sizes, outermost first
    #[inline]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Logical size of dimension `dim`
    ///
    /// # Panics
    ///
    /// Panics if `dim >= self.dim()`.
    #[inline]
    pub fn size(&self, dim: usize) -> usize {
        self.sizes[dim]
    }

    /// Padded sizes, outermost first
    #[inline]
    pub fn gpu_sizes(&self) -> &[usize] {
        &self.gpu_sizes
    }

    /// Number of dimensions
    #[inline]
    pub fn dim(&self) -> usize {
        self.sizes.len()
    }

    /// Number of logical elements
    #[inline]
    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Size of the logical elements in bytes
    #[inline]
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    /// Number of padded elements
    #[inline]
    pub fn gpu_numel(&self) -> usize {
        self.gpu_sizes.iter().product()
    }

    /// Size of the padded elements in bytes
    #[inline]
    pub fn gpu_nbytes(&self) -> usize {
        self.gpu_numel() * self.dtype.size_in_bytes()
    }

    /// Image extents the shaders see; `[0, 0, 0]` for buffer storage
    #[inline]
    pub fn extents(&self) -> UVec3 {
        self.extents
    }

    /// Texel format of the image; `None` for buffer storage
    #[inline]
    pub fn texture_format(&self) -> Option<TexelFormat> {
        self.storage.image().map(|image| image.format())
    }
}

impl<C: GpuContext> fmt::Debug for VTensor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VTensor")
            .field("sizes", &self.sizes.as_slice())
            .field("gpu_sizes", &self.gpu_sizes.as_slice())
            .field("dtype", &self.dtype)
            .field("memory_layout", &self.memory_layout)
            .field("storage", &self.storage)
            .finish()
    }
}

/// Padded sizes for `sizes`, failing when padding the packed dimension overflows
fn padded_sizes(
    sizes: &[usize],
    layout: GpuMemoryLayout,
    storage_type: StorageType,
) -> Result<Sizes> {
    calc_gpu_sizes(sizes, layout).ok_or_else(|| {
        Error::invalid_configuration(
            storage_type,
            format!("padding {sizes:?} for {layout:?} overflows usize"),
        )
    })
}

fn cached_uniform<C: GpuContext, T: bytemuck::Pod>(
    context: &C,
    slot: &mut Option<UniformRef<C>>,
    params: &T,
) -> Result<UniformRef<C>> {
    if let Some(uniform) = slot {
        return Ok(Arc::clone(uniform));
    }
    let uniform = Arc::new(UniformParamsBuffer::new(context, params)?);
    *slot = Some(Arc::clone(&uniform));
    Ok(uniform)
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;
    use crate::runtime::host::HostContext;

    #[test]
    fn test_new_defaults() {
        let ctx = HostContext::new();
        let t = VTensor::new(&ctx, &[1, 3, 8, 8], DType::F32).unwrap();
        assert_eq!(t.storage_type(), StorageType::Texture3D);
        assert_eq!(t.gpu_memory_layout(), GpuMemoryLayout::ChannelsPacked);
        assert_eq!(t.gpu_memory_layout_int(), 2);
        assert_eq!(t.gpu_sizes(), &[1, 4, 8, 8]);
        assert_eq!(t.extents(), [8, 8, 1]);
        assert_eq!(t.texture_format(), Some(TexelFormat::Rgba32Float));
        assert!(t.is_allocated());
    }

    #[test]
    fn test_metadata() {
        let ctx = HostContext::new();
        let t = VTensor::with_options(
            &ctx,
            &[2, 5, 3],
            DType::F16,
            StorageType::Buffer,
            GpuMemoryLayout::WidthPacked,
            true,
        )
        .unwrap();
        assert_eq!(t.dim(), 3);
        assert_eq!(t.size(2), 3);
        assert_eq!(t.gpu_sizes(), &[2, 5, 4]);
        assert_eq!(t.numel(), 30);
        assert_eq!(t.nbytes(), 60);
        assert_eq!(t.gpu_numel(), 40);
        assert_eq!(t.gpu_nbytes(), 80);
        assert_eq!(t.extents(), [0, 0, 0]);
        assert_eq!(t.texture_format(), None);
        assert!(t.image().is_none());
    }

    #[test]
    fn test_oversized_shapes_rejected() {
        let ctx = HostContext::new();
        for sizes in [&[1 << 40, 1 << 40][..], &[(1 << 62) + 1, 4], &[usize::MAX]] {
            let err = VTensor::with_options(
                &ctx,
                sizes,
                DType::F32,
                StorageType::Buffer,
                GpuMemoryLayout::WidthPacked,
                false,
            )
            .unwrap_err();
            assert!(matches!(err, Error::InvalidConfiguration { .. }), "{sizes:?}");
        }
        let err = VTensor::new(&ctx, &[1 << 40, 1 << 40, 4], DType::F32).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));
        assert_eq!(ctx.stats().live_buffers + ctx.stats().live_images, 0);
    }

    #[test]
    fn test_oversized_resize_leaves_tensor_unchanged() {
        let ctx = HostContext::new();
        let mut t = VTensor::with_options(
            &ctx,
            &[4, 4],
            DType::F32,
            StorageType::Buffer,
            GpuMemoryLayout::WidthPacked,
            true,
        )
        .unwrap();
        let id = t.storage().resource().id();

        assert!(t.reallocate(&[1 << 40, 1 << 40]).is_err());
        assert!(t.virtual_resize(&[1 << 40, 1 << 40]).is_err());
        assert_eq!(t.sizes(), &[4, 4]);
        assert_eq!(t.gpu_numel(), 16);
        assert_eq!(t.storage().resource().id(), id);
    }

    #[test]
    fn test_wrong_accessor_kind() {
        let ctx = HostContext::new();
        let mut t = VTensor::new(&ctx, &[4, 4], DType::F32).unwrap();
        let err = t
            .buffer_for_access(PipelineStage::COMPUTE, MemoryAccess::READ)
            .unwrap_err();
        assert!(err.is_precondition());
        assert!(t.last_access().is_none());
    }

    #[test]
    fn test_ubo_cached() {
        let ctx = HostContext::new();
        let mut t = VTensor::new(&ctx, &[3, 5], DType::F32).unwrap();
        let a = t.sizes_ubo().unwrap();
        let b = t.sizes_ubo().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.read::<[i32; 4]>(), Some([5, 3, 1, 1]));
        assert_eq!(t.gpu_sizes_ubo().unwrap().read::<[i32; 4]>(), Some([5, 3, 1, 1]));
        assert_eq!(t.extents_ubo().unwrap().read::<[u32; 4]>(), Some([5, 3, 1, 1]));
    }

    #[test]
    fn test_virtual_resize_keeps_unchanged_uniforms() {
        let ctx = HostContext::new();
        let mut t = VTensor::new(&ctx, &[1, 4, 8, 8], DType::F32).unwrap();
        let gpu = t.gpu_sizes_ubo().unwrap();
        let sizes = t.sizes_ubo().unwrap();

        // 3 channels pad to the same 4.
        t.virtual_resize(&[1, 3, 8, 8]).unwrap();
        assert!(Arc::ptr_eq(&gpu, &t.gpu_sizes_ubo().unwrap()));
        assert!(!Arc::ptr_eq(&sizes, &t.sizes_ubo().unwrap()));
        assert_eq!(t.sizes_ubo().unwrap().read::<[i32; 4]>(), Some([8, 8, 3, 1]));
    }
}
