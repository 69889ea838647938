//! WebGPU context.
//!
//! `WgpuContext` implements [`GpuContext`] on a `wgpu::Device`. Like the
//! host context it hands out [`ResourceId`] handles and keeps the real
//! `wgpu::Texture` and `wgpu::Buffer` objects in a per-context registry.
//!
//! WebGPU does not expose device memory separately from the objects that use
//! it. A [`MemoryAllocation`] here is a reservation against the configured
//! memory budget; binding it creates the backing wgpu object. Objects bound
//! to the same allocation therefore do not alias.
//!
//! Pipeline barriers are validated and counted but not encoded: wgpu tracks
//! resource usage and inserts the physical barriers itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use wgpu::{Device, Queue};

use super::device::{WgpuDevice, WgpuError, query_adapter_info_blocking};
use crate::config::ContextConfig;
use crate::dtype::TexelFormat;
use crate::error::{Error, Result};
use crate::runtime::{
    AllocationCreateInfo, BufferDescriptor, BufferUsage, GpuBuffer, GpuContext, GpuImage,
    ImageDescriptor, MemoryAllocation, MemoryRequirements, MemoryState, PipelineBarrier,
    ResourceId, buffer_requirements, check_bind, image_requirements,
};
use crate::tensor::StorageType;

/// Map a texel format to the wgpu texture format
pub fn texture_format(format: TexelFormat) -> wgpu::TextureFormat {
    match format {
        TexelFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TexelFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TexelFormat::Rgba32Sint => wgpu::TextureFormat::Rgba32Sint,
        TexelFormat::Rgba32Uint => wgpu::TextureFormat::Rgba32Uint,
        TexelFormat::Rgba8Sint => wgpu::TextureFormat::Rgba8Sint,
        TexelFormat::Rgba8Uint => wgpu::TextureFormat::Rgba8Uint,
    }
}

// ============================================================================
// Registry
// ============================================================================

enum WgpuObject {
    Texture(wgpu::Texture),
    Buffer(wgpu::Buffer),
}

impl WgpuObject {
    fn destroy(&self) {
        match self {
            Self::Texture(texture) => texture.destroy(),
            Self::Buffer(buffer) => buffer.destroy(),
        }
    }
}

#[derive(Copy, Clone)]
struct Binding {
    allocation: ResourceId,
    owned: bool,
}

#[derive(Default)]
struct Entry {
    object: Option<WgpuObject>,
    binding: Option<Binding>,
}

#[derive(Default)]
struct WgpuState {
    entries: HashMap<ResourceId, Entry>,
    /// Budget reservations by allocation id
    reservations: HashMap<ResourceId, u64>,
    bytes_in_use: u64,
    pending_cleanup: Vec<ResourceId>,
    barriers_submitted: usize,
}

impl WgpuState {
    fn reserve(&mut self, budget: Option<u64>, size: u64) -> Result<ResourceId> {
        if size == 0 {
            return Err(Error::allocation_failure(0, "zero-sized allocation"));
        }
        if let Some(budget) = budget {
            let available = budget.saturating_sub(self.bytes_in_use);
            if size > available {
                return Err(Error::allocation_failure(
                    size,
                    format!("memory budget exhausted ({available} of {budget} bytes available)"),
                ));
            }
        }
        let id = ResourceId::next();
        self.reservations.insert(id, size);
        self.bytes_in_use += size;
        Ok(id)
    }

    fn release(&mut self, allocation: ResourceId) {
        if let Some(size) = self.reservations.remove(&allocation) {
            self.bytes_in_use -= size;
        }
    }

    fn users_of(&self, allocation: ResourceId) -> usize {
        self.entries
            .values()
            .filter(|e| e.binding.is_some_and(|b| b.allocation == allocation))
            .count()
    }

    fn attach(&mut self, id: ResourceId, object: WgpuObject, binding: Binding) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::Backend(format!("unknown object {id}")))?;
        entry.object = Some(object);
        entry.binding = Some(binding);
        Ok(())
    }

    fn destroy(&mut self, id: ResourceId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        if let Some(object) = &entry.object {
            object.destroy();
        }
        if let Some(Binding {
            allocation,
            owned: true,
        }) = entry.binding
        {
            self.release(allocation);
        }
    }
}

// ============================================================================
// WgpuContext
// ============================================================================

struct WgpuInner {
    device_id: WgpuDevice,
    device: Arc<Device>,
    queue: Arc<Queue>,
    limits: wgpu::Limits,
    config: ContextConfig,
    state: Mutex<WgpuState>,
}

/// GPU context backed by a WebGPU device.
///
/// `WgpuContext` is `Clone`; clones share the device, queue and registry.
#[derive(Clone)]
pub struct WgpuContext {
    inner: Arc<WgpuInner>,
}

impl fmt::Debug for WgpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuContext")
            .field("device", &self.inner.device_id)
            .field("label", &self.inner.config.label)
            .finish_non_exhaustive()
    }
}

impl WgpuContext {
    /// Create a context on the given device.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - No suitable GPU adapter is found
    /// - Device creation fails
    pub fn new(device: WgpuDevice, config: ContextConfig) -> Result<Self> {
        config.validate()?;
        let (adapter, info) = query_adapter_info_blocking(device.index)?;

        let label = format!("{} device", config.label);
        let (wgpu_device, queue) = pollster::block_on(async {
            adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some(&label),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    trace: wgpu::Trace::Off,
                    experimental_features: wgpu::ExperimentalFeatures::default(),
                })
                .await
        })
        .map_err(|e| WgpuError::DeviceError(format!("{:?}", e)))?;

        let limits = wgpu_device.limits();
        let device_id = WgpuDevice::with_info(device.index, info);
        tracing::debug!(device = ?device_id, "wgpu: context created");

        Ok(Self {
            inner: Arc::new(WgpuInner {
                device_id,
                device: Arc::new(wgpu_device),
                queue: Arc::new(queue),
                limits,
                config,
                state: Mutex::new(WgpuState::default()),
            }),
        })
    }

    /// Create a context on the first adapter, configured from the environment
    pub fn from_env() -> Result<Self> {
        Self::new(WgpuDevice::new(0), ContextConfig::from_env()?)
    }

    /// Device identifier with adapter info
    #[inline]
    pub fn device(&self) -> &WgpuDevice {
        &self.inner.device_id
    }

    /// Get reference to the WebGPU device.
    #[inline]
    pub fn wgpu_device(&self) -> &Device {
        &self.inner.device
    }

    /// Get reference to the WebGPU queue.
    #[inline]
    pub fn wgpu_queue(&self) -> &Queue {
        &self.inner.queue
    }

    /// The wgpu texture behind an image, if it has memory
    pub fn texture(&self, image: &GpuImage) -> Option<wgpu::Texture> {
        match self.inner.state.lock().entries.get(&image.id())?.object.as_ref()? {
            WgpuObject::Texture(texture) => Some(texture.clone()),
            WgpuObject::Buffer(_) => None,
        }
    }

    /// The wgpu buffer behind a buffer handle, if it has memory
    pub fn buffer(&self, buffer: &GpuBuffer) -> Option<wgpu::Buffer> {
        self.wgpu_buffer(buffer.id())
    }

    fn wgpu_buffer(&self, id: ResourceId) -> Option<wgpu::Buffer> {
        match self.inner.state.lock().entries.get(&id)?.object.as_ref()? {
            WgpuObject::Buffer(buffer) => Some(buffer.clone()),
            WgpuObject::Texture(_) => None,
        }
    }

    /// Number of pipeline barriers submitted so far
    pub fn barriers_submitted(&self) -> usize {
        self.inner.state.lock().barriers_submitted
    }

    /// Bytes reserved against the memory budget
    pub fn bytes_in_use(&self) -> u64 {
        self.inner.state.lock().bytes_in_use
    }

    /// True if the object has not been destroyed yet
    pub fn is_live(&self, id: ResourceId) -> bool {
        self.inner.state.lock().entries.contains_key(&id)
    }

    /// Wait for all submitted GPU work to complete
    pub fn synchronize(&self) -> Result<()> {
        self.inner
            .device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(Duration::from_secs(60)),
            })
            .map_err(|e| WgpuError::DeviceError(format!("GPU poll failed during synchronize: {e}")))?;
        Ok(())
    }

    /// Read a buffer back to the CPU (blocking).
    pub fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>> {
        let src = self.buffer(buffer).ok_or_else(|| {
            Error::precondition("read_buffer", format!("buffer {} has no memory", buffer.id()))
        })?;
        let size = buffer.size().next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);

        let staging = self.inner.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vtensor staging buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .inner
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vtensor read_buffer"),
            });
        encoder.copy_buffer_to_buffer(&src, 0, &staging, 0, size);
        self.inner.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        self.inner
            .device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(Duration::from_secs(60)),
            })
            .map_err(|e| WgpuError::BufferError(format!("GPU poll failed during buffer read: {e}")))?;

        let map_result = receiver.recv().map_err(|_| {
            WgpuError::BufferError("map_async callback was not invoked during buffer read".into())
        })?;
        map_result
            .map_err(|e| WgpuError::BufferError(format!("map_async failed during buffer read: {e}")))?;

        let bytes = {
            let data = slice.get_mapped_range();
            data[..buffer.size() as usize].to_vec()
        };
        staging.unmap();
        staging.destroy();
        Ok(bytes)
    }

    // ========================================================================
    // Object creation
    // ========================================================================

    fn check_limit(what: &'static str, requested: u64, limit: u64) -> Result<()> {
        if requested > limit {
            return Err(WgpuError::LimitExceeded {
                what,
                requested,
                limit,
            }
            .into());
        }
        Ok(())
    }

    fn check_image_limits(&self, desc: &ImageDescriptor) -> Result<()> {
        let limits = &self.inner.limits;
        let (what, limit) = match desc.storage_type {
            StorageType::Texture1D => ("1D texture dimension", limits.max_texture_dimension_1d),
            StorageType::Texture2D => ("2D texture dimension", limits.max_texture_dimension_2d),
            _ => ("3D texture dimension", limits.max_texture_dimension_3d),
        };
        let largest = desc.extents.iter().copied().max().unwrap_or(0);
        Self::check_limit(what, largest as u64, limit as u64)
    }

    fn check_buffer_limits(&self, desc: &BufferDescriptor, size: u64) -> Result<()> {
        let limits = &self.inner.limits;
        Self::check_limit("buffer size", size, limits.max_buffer_size)?;
        match desc.usage {
            BufferUsage::Storage => Self::check_limit(
                "storage binding size",
                desc.size,
                limits.max_storage_buffer_binding_size as u64,
            ),
            BufferUsage::Uniform => Self::check_limit(
                "uniform binding size",
                desc.size,
                limits.max_uniform_buffer_binding_size as u64,
            ),
        }
    }

    fn create_texture(&self, image: &GpuImage) -> wgpu::Texture {
        let desc = image.descriptor();
        let dimension = match desc.storage_type {
            StorageType::Texture1D => wgpu::TextureDimension::D1,
            StorageType::Texture2D => wgpu::TextureDimension::D2,
            _ => wgpu::TextureDimension::D3,
        };
        let label = format!("{} image {}", self.inner.config.label, image.id());
        self.inner.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&label),
            size: wgpu::Extent3d {
                width: desc.extents[0],
                height: desc.extents[1],
                depth_or_array_layers: desc.extents[2],
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension,
            format: texture_format(desc.format),
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn create_wgpu_buffer(&self, buffer: &GpuBuffer) -> wgpu::Buffer {
        let usage = match buffer.usage() {
            BufferUsage::Storage => wgpu::BufferUsages::STORAGE,
            BufferUsage::Uniform => wgpu::BufferUsages::UNIFORM,
        };
        let label = format!("{} buffer {}", self.inner.config.label, buffer.id());
        self.inner.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&label),
            size: buffer.memory_requirements().size,
            usage: usage | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn register(&self, id: ResourceId) {
        self.inner.state.lock().entries.insert(id, Entry::default());
    }

    fn discard(&self, id: ResourceId) {
        self.inner.state.lock().destroy(id);
    }
}

impl GpuContext for WgpuContext {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    fn create_image(&self, desc: &ImageDescriptor, allocate_memory: bool) -> Result<GpuImage> {
        self.check_image_limits(desc)?;
        let requirements = image_requirements(&self.inner.config, desc)?;
        let mut image = GpuImage::new(ResourceId::next(), desc.clone(), requirements);
        self.register(image.id());

        if allocate_memory {
            if let Err(e) = self.allocate_image_memory(&mut image) {
                self.discard(image.id());
                return Err(e);
            }
        }
        Ok(image)
    }

    fn create_buffer(&self, desc: &BufferDescriptor, allocate_memory: bool) -> Result<GpuBuffer> {
        let requirements = buffer_requirements(&self.inner.config, desc)?;
        self.check_buffer_limits(desc, requirements.size)?;
        let mut buffer = GpuBuffer::new(ResourceId::next(), desc.clone(), requirements);
        self.register(buffer.id());

        if allocate_memory {
            if let Err(e) = self.allocate_buffer_memory(&mut buffer) {
                self.discard(buffer.id());
                return Err(e);
            }
        }
        Ok(buffer)
    }

    fn allocate_image_memory(&self, image: &mut GpuImage) -> Result<()> {
        if image.memory().is_allocated() {
            return Err(Error::precondition(
                "allocate_image_memory",
                format!("image {} already has memory", image.id()),
            ));
        }
        let size = image.memory_requirements().size;
        let allocation = self.inner.state.lock().reserve(self.inner.config.memory_budget, size)?;
        let texture = self.create_texture(image);
        self.inner.state.lock().attach(
            image.id(),
            WgpuObject::Texture(texture),
            Binding {
                allocation,
                owned: true,
            },
        )?;
        image.set_memory(MemoryState::Owned);
        tracing::debug!(image = %image.id(), bytes = size, "wgpu: created texture");
        Ok(())
    }

    fn allocate_buffer_memory(&self, buffer: &mut GpuBuffer) -> Result<()> {
        if buffer.memory().is_allocated() {
            return Err(Error::precondition(
                "allocate_buffer_memory",
                format!("buffer {} already has memory", buffer.id()),
            ));
        }
        let size = buffer.memory_requirements().size;
        let allocation = self.inner.state.lock().reserve(self.inner.config.memory_budget, size)?;
        let wgpu_buffer = self.create_wgpu_buffer(buffer);
        self.inner.state.lock().attach(
            buffer.id(),
            WgpuObject::Buffer(wgpu_buffer),
            Binding {
                allocation,
                owned: true,
            },
        )?;
        buffer.set_memory(MemoryState::Owned);
        tracing::debug!(buffer = %buffer.id(), bytes = size, "wgpu: created buffer");
        Ok(())
    }

    fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        _info: &AllocationCreateInfo,
    ) -> Result<MemoryAllocation> {
        let id = self
            .inner
            .state
            .lock()
            .reserve(self.inner.config.memory_budget, requirements.size)?;
        Ok(MemoryAllocation {
            id,
            size: requirements.size,
            memory_type_bits: requirements.memory_type_bits,
        })
    }

    fn free_memory(&self, allocation: MemoryAllocation) {
        let mut state = self.inner.state.lock();
        let users = state.users_of(allocation.id());
        if users > 0 {
            tracing::warn!(
                allocation = %allocation.id(),
                users,
                "wgpu: freeing memory still bound to live objects"
            );
        }
        state.release(allocation.id());
    }

    fn bind_image_memory(&self, image: &mut GpuImage, allocation: &MemoryAllocation) -> Result<()> {
        check_bind(
            "bind_image_memory",
            image.id(),
            image.memory(),
            &image.memory_requirements(),
            allocation,
        )?;
        let texture = self.create_texture(image);
        self.inner.state.lock().attach(
            image.id(),
            WgpuObject::Texture(texture),
            Binding {
                allocation: allocation.id(),
                owned: false,
            },
        )?;
        image.set_memory(MemoryState::Bound(allocation.id()));
        Ok(())
    }

    fn bind_buffer_memory(
        &self,
        buffer: &mut GpuBuffer,
        allocation: &MemoryAllocation,
    ) -> Result<()> {
        check_bind(
            "bind_buffer_memory",
            buffer.id(),
            buffer.memory(),
            &buffer.memory_requirements(),
            allocation,
        )?;
        let wgpu_buffer = self.create_wgpu_buffer(buffer);
        self.inner.state.lock().attach(
            buffer.id(),
            WgpuObject::Buffer(wgpu_buffer),
            Binding {
                allocation: allocation.id(),
                owned: false,
            },
        )?;
        buffer.set_memory(MemoryState::Bound(allocation.id()));
        Ok(())
    }

    fn register_image_cleanup(&self, image: GpuImage) {
        self.inner.state.lock().pending_cleanup.push(image.id());
    }

    fn register_buffer_cleanup(&self, buffer: GpuBuffer) {
        self.inner.state.lock().pending_cleanup.push(buffer.id());
    }

    fn flush_cleanup(&self) {
        let mut state = self.inner.state.lock();
        let pending = std::mem::take(&mut state.pending_cleanup);
        for id in &pending {
            state.destroy(*id);
        }
        tracing::debug!(released = pending.len(), "wgpu: flushed deferred cleanup");
    }

    fn submit_pipeline_barrier(&self, barrier: &PipelineBarrier) {
        tracing::trace!(
            src = ?barrier.stage.src,
            dst = ?barrier.stage.dst,
            buffers = barrier.buffers.len(),
            images = barrier.images.len(),
            "wgpu: pipeline barrier"
        );
        self.inner.state.lock().barriers_submitted += 1;
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let in_bounds = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= buffer.size());
        if !in_bounds {
            return Err(Error::precondition(
                "write_buffer",
                format!(
                    "write of {} bytes at offset {offset} exceeds buffer {} of {} bytes",
                    data.len(),
                    buffer.id(),
                    buffer.size()
                ),
            ));
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0
        {
            return Err(Error::precondition(
                "write_buffer",
                format!("offset {offset} and length {} must be 4-byte aligned", data.len()),
            ));
        }
        let target = self.wgpu_buffer(buffer.id()).ok_or_else(|| {
            Error::precondition("write_buffer", format!("buffer {} has no memory", buffer.id()))
        })?;
        self.inner.queue.write_buffer(&target, offset, data);
        Ok(())
    }
}
