//! Host context and its `GpuContext` implementation

use super::memory::{Binding, HostMemory, ObjectKind};
use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::runtime::{
    AllocationCreateInfo, BufferDescriptor, GpuBuffer, GpuContext, GpuImage, ImageDescriptor,
    MemoryAllocation, MemoryRequirements, MemoryState, PipelineBarrier, ResourceId,
    buffer_requirements, check_bind, image_requirements,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Number of submitted barriers a new context keeps for inspection
pub const DEFAULT_BARRIER_LOG_CAPACITY: usize = 64;

/// Snapshot of a host context's bookkeeping
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Images not yet destroyed (including those pending cleanup)
    pub live_images: usize,
    /// Buffers not yet destroyed (including those pending cleanup)
    pub live_buffers: usize,
    /// Resources registered for cleanup but not yet released
    pub pending_cleanup: usize,
    /// Memory blocks currently allocated
    pub allocations: usize,
    /// Bytes of memory currently allocated
    pub bytes_in_use: u64,
    /// Pipeline barriers submitted so far
    pub barriers_submitted: usize,
}

struct HostState {
    memory: HostMemory,
    pending_cleanup: Vec<ResourceId>,
    barriers_submitted: usize,
    /// Most recent barriers, oldest first, at most `barrier_log_capacity`
    barrier_log: VecDeque<PipelineBarrier>,
    barrier_log_capacity: usize,
}

struct HostInner {
    config: ContextConfig,
    state: Mutex<HostState>,
}

/// GPU context emulated in host memory
///
/// Clones share the same registry. Every resource still registered when the
/// last clone is dropped is released with it.
#[derive(Clone)]
pub struct HostContext {
    inner: Arc<HostInner>,
}

impl HostContext {
    /// Create a context with the default configuration
    pub fn new() -> Self {
        Self::from_parts(ContextConfig::default())
    }

    /// Create a context with an explicit configuration
    pub fn with_config(config: ContextConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config))
    }

    /// Create a context configured from `VTENSOR_*` environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_parts(ContextConfig::from_env()?))
    }

    fn from_parts(config: ContextConfig) -> Self {
        let memory = HostMemory::new(config.memory_budget);
        Self {
            inner: Arc::new(HostInner {
                config,
                state: Mutex::new(HostState {
                    memory,
                    pending_cleanup: Vec::new(),
                    barriers_submitted: 0,
                    barrier_log: VecDeque::new(),
                    barrier_log_capacity: DEFAULT_BARRIER_LOG_CAPACITY,
                }),
            }),
        }
    }

    /// Bookkeeping snapshot
    pub fn stats(&self) -> HostStats {
        let state = self.inner.state.lock();
        HostStats {
            live_images: state.memory.object_count(ObjectKind::Image),
            live_buffers: state.memory.object_count(ObjectKind::Buffer),
            pending_cleanup: state.pending_cleanup.len(),
            allocations: state.memory.allocation_count(),
            bytes_in_use: state.memory.bytes_in_use(),
            barriers_submitted: state.barriers_submitted,
        }
    }

    /// The most recently submitted barriers, in submission order
    ///
    /// Only the last [`HostContext::barrier_log_capacity`] barriers are kept;
    /// [`HostStats::barriers_submitted`] counts all of them.
    pub fn submitted_barriers(&self) -> Vec<PipelineBarrier> {
        self.inner.state.lock().barrier_log.iter().cloned().collect()
    }

    /// Number of barriers the log keeps
    pub fn barrier_log_capacity(&self) -> usize {
        self.inner.state.lock().barrier_log_capacity
    }

    /// Keep at most `capacity` barriers in the log; 0 turns recording off
    ///
    /// The oldest entries beyond the new capacity are dropped.
    pub fn set_barrier_log_capacity(&self, capacity: usize) {
        let mut state = self.inner.state.lock();
        state.barrier_log_capacity = capacity;
        let excess = state.barrier_log.len().saturating_sub(capacity);
        state.barrier_log.drain(..excess);
    }

    /// Forget the recorded barriers and reset the barrier count
    pub fn clear_barriers(&self) {
        let mut state = self.inner.state.lock();
        state.barrier_log.clear();
        state.barriers_submitted = 0;
    }

    /// True if the object has not been destroyed yet
    pub fn is_live(&self, id: ResourceId) -> bool {
        self.inner.state.lock().memory.object(id).is_some()
    }

    /// Read back the memory bound to a buffer
    pub fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>> {
        let mut state = self.inner.state.lock();
        let bytes = state.memory.bytes_mut(buffer.id())?;
        let len = (buffer.size() as usize).min(bytes.len());
        Ok(bytes[..len].to_vec())
    }

    fn allocate_for(&self, id: ResourceId, size: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let allocation = state.memory.allocate(size)?;
        state.memory.bind(
            id,
            Binding {
                allocation,
                owned: true,
            },
        )?;
        tracing::debug!(object = %id, bytes = size, "host: allocated dedicated memory");
        Ok(())
    }

    fn bind_to(&self, id: ResourceId, allocation: &MemoryAllocation) -> Result<()> {
        self.inner.state.lock().memory.bind(
            id,
            Binding {
                allocation: allocation.id(),
                owned: false,
            },
        )
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("label", &self.inner.config.label)
            .field("stats", &self.stats())
            .finish()
    }
}

impl GpuContext for HostContext {
    fn name(&self) -> &'static str {
        "host"
    }

    fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    fn create_image(&self, desc: &ImageDescriptor, allocate_memory: bool) -> Result<GpuImage> {
        let requirements = image_requirements(&self.inner.config, desc)?;
        let mut image = GpuImage::new(ResourceId::next(), desc.clone(), requirements);
        self.inner
            .state
            .lock()
            .memory
            .register(image.id(), ObjectKind::Image);

        if allocate_memory {
            if let Err(e) = self.allocate_image_memory(&mut image) {
                self.inner.state.lock().memory.destroy(image.id());
                return Err(e);
            }
        }
        Ok(image)
    }

    fn create_buffer(&self, desc: &BufferDescriptor, allocate_memory: bool) -> Result<GpuBuffer> {
        let requirements = buffer_requirements(&self.inner.config, desc)?;
        let mut buffer = GpuBuffer::new(ResourceId::next(), desc.clone(), requirements);
        self.inner
            .state
            .lock()
            .memory
            .register(buffer.id(), ObjectKind::Buffer);

        if allocate_memory {
            if let Err(e) = self.allocate_buffer_memory(&mut buffer) {
                self.inner.state.lock().memory.destroy(buffer.id());
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
        self.allocate_for(image.id(), image.memory_requirements().size)?;
        image.set_memory(MemoryState::Owned);
        Ok(())
    }

    fn allocate_buffer_memory(&self, buffer: &mut GpuBuffer) -> Result<()> {
        if buffer.memory().is_allocated() {
            return Err(Error::precondition(
                "allocate_buffer_memory",
                format!("buffer {} already has memory", buffer.id()),
            ));
        }
        self.allocate_for(buffer.id(), buffer.memory_requirements().size)?;
        buffer.set_memory(MemoryState::Owned);
        Ok(())
    }

    fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        _info: &AllocationCreateInfo,
    ) -> Result<MemoryAllocation> {
        let id = self.inner.state.lock().memory.allocate(requirements.size)?;
        tracing::debug!(allocation = %id, bytes = requirements.size, "host: allocated pool memory");
        Ok(MemoryAllocation {
            id,
            size: requirements.size,
            memory_type_bits: requirements.memory_type_bits,
        })
    }

    fn free_memory(&self, allocation: MemoryAllocation) {
        let mut state = self.inner.state.lock();
        let users = state.memory.users_of(allocation.id());
        if users > 0 {
            tracing::warn!(
                allocation = %allocation.id(),
                users,
                "host: freeing memory still bound to live objects"
            );
        }
        state.memory.free(allocation.id());
    }

    fn bind_image_memory(&self, image: &mut GpuImage, allocation: &MemoryAllocation) -> Result<()> {
        check_bind(
            "bind_image_memory",
            image.id(),
            image.memory(),
            &image.memory_requirements(),
            allocation,
        )?;
        self.bind_to(image.id(), allocation)?;
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
        self.bind_to(buffer.id(), allocation)?;
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
            state.memory.destroy(*id);
        }
        tracing::debug!(released = pending.len(), "host: flushed deferred cleanup");
    }

    fn submit_pipeline_barrier(&self, barrier: &PipelineBarrier) {
        tracing::trace!(
            src = ?barrier.stage.src,
            dst = ?barrier.stage.dst,
            buffers = barrier.buffers.len(),
            images = barrier.images.len(),
            "host: pipeline barrier"
        );
        let mut state = self.inner.state.lock();
        state.barriers_submitted += 1;
        if state.barrier_log_capacity == 0 {
            return;
        }
        if state.barrier_log.len() == state.barrier_log_capacity {
            state.barrier_log.pop_front();
        }
        state.barrier_log.push_back(barrier.clone());
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock();
        let bytes = state.memory.bytes_mut(buffer.id())?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= buffer.size() && end <= bytes.len() as u64);
        let Some(end) = end else {
            return Err(Error::precondition(
                "write_buffer",
                format!(
                    "write of {} bytes at offset {offset} exceeds buffer {} of {} bytes",
                    data.len(),
                    buffer.id(),
                    buffer.size()
                ),
            ));
        };
        bytes[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::TexelFormat;
    use crate::runtime::{BufferUsage, PipelineStage};
    use crate::tensor::StorageType;

    fn storage_desc(size: u64) -> BufferDescriptor {
        BufferDescriptor {
            size,
            usage: BufferUsage::Storage,
        }
    }

    #[test]
    fn test_create_and_cleanup_buffer() {
        let ctx = HostContext::new();
        let buffer = ctx.create_buffer(&storage_desc(100), true).unwrap();
        let id = buffer.id();
        assert!(buffer.owns_memory());
        assert_eq!(ctx.stats().live_buffers, 1);
        assert_eq!(ctx.stats().bytes_in_use, 256);

        ctx.register_buffer_cleanup(buffer);
        assert!(ctx.is_live(id));
        assert_eq!(ctx.stats().pending_cleanup, 1);

        ctx.flush_cleanup();
        assert!(!ctx.is_live(id));
        assert_eq!(ctx.stats(), HostStats::default());
    }

    #[test]
    fn test_deferred_buffer_has_no_memory() {
        let ctx = HostContext::new();
        let mut buffer = ctx.create_buffer(&storage_desc(64), false).unwrap();
        assert_eq!(buffer.memory(), MemoryState::Unallocated);
        assert_eq!(ctx.stats().allocations, 0);
        assert!(ctx.read_buffer(&buffer).is_err());

        ctx.allocate_buffer_memory(&mut buffer).unwrap();
        assert!(buffer.owns_memory());
        assert!(ctx.allocate_buffer_memory(&mut buffer).unwrap_err().is_precondition());
        ctx.register_buffer_cleanup(buffer);
        ctx.flush_cleanup();
    }

    #[test]
    fn test_budget_failure_leaves_no_object() {
        let ctx = HostContext::with_config(ContextConfig::default().with_memory_budget(512)).unwrap();
        let desc = ImageDescriptor {
            storage_type: StorageType::Texture3D,
            extents: [16, 16, 1],
            format: TexelFormat::Rgba32Float,
        };
        let err = ctx.create_image(&desc, true).unwrap_err();
        assert!(matches!(err, Error::AllocationFailure { .. }));
        assert_eq!(ctx.stats().live_images, 0);
    }

    #[test]
    fn test_bind_external_memory() {
        let ctx = HostContext::new();
        let mut buffer = ctx.create_buffer(&storage_desc(128), false).unwrap();
        let alloc = ctx
            .allocate_memory(&buffer.memory_requirements(), &AllocationCreateInfo::default())
            .unwrap();
        ctx.bind_buffer_memory(&mut buffer, &alloc).unwrap();
        assert_eq!(buffer.memory(), MemoryState::Bound(alloc.id()));

        ctx.write_buffer(&buffer, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&ctx.read_buffer(&buffer).unwrap()[..4], &[1, 2, 3, 4]);

        // Releasing the buffer keeps the pool's memory alive.
        ctx.register_buffer_cleanup(buffer);
        ctx.flush_cleanup();
        assert_eq!(ctx.stats().allocations, 1);
        ctx.free_memory(alloc);
        assert_eq!(ctx.stats().allocations, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ContextConfig::default().with_buffer_alignment(100);
        assert!(HostContext::with_config(config).is_err());
    }

    #[test]
    fn test_write_out_of_bounds() {
        let ctx = HostContext::new();
        let buffer = ctx.create_buffer(&storage_desc(8), true).unwrap();
        let err = ctx.write_buffer(&buffer, 4, &[0u8; 8]).unwrap_err();
        assert!(err.is_precondition());
        ctx.register_buffer_cleanup(buffer);
    }

    #[test]
    fn test_uniform_buffer_contents() {
        let ctx = HostContext::new();
        let buffer = ctx.create_uniform_buffer(&[9u8; 16]).unwrap();
        assert_eq!(buffer.usage(), BufferUsage::Uniform);
        assert_eq!(ctx.read_buffer(&buffer).unwrap(), vec![9u8; 16]);
        ctx.register_buffer_cleanup(buffer);
    }

    #[test]
    fn test_barrier_log() {
        let ctx = HostContext::new();
        let mut barrier = PipelineBarrier::new();
        barrier.add_stages(PipelineStage::COMPUTE, PipelineStage::COMPUTE);
        ctx.submit_pipeline_barrier(&barrier);
        assert_eq!(ctx.submitted_barriers(), vec![barrier]);
        ctx.clear_barriers();
        assert_eq!(ctx.stats().barriers_submitted, 0);
        assert!(ctx.submitted_barriers().is_empty());
    }

    #[test]
    fn test_barrier_log_is_bounded() {
        let ctx = HostContext::new();
        let mut barrier = PipelineBarrier::new();
        barrier.add_stages(PipelineStage::COMPUTE, PipelineStage::COMPUTE);
        for _ in 0..10 * DEFAULT_BARRIER_LOG_CAPACITY {
            ctx.submit_pipeline_barrier(&barrier);
        }
        assert_eq!(ctx.submitted_barriers().len(), DEFAULT_BARRIER_LOG_CAPACITY);
        assert_eq!(ctx.stats().barriers_submitted, 10 * DEFAULT_BARRIER_LOG_CAPACITY);

        ctx.set_barrier_log_capacity(4);
        assert_eq!(ctx.submitted_barriers().len(), 4);
        ctx.submit_pipeline_barrier(&barrier);
        assert_eq!(ctx.submitted_barriers().len(), 4);

        ctx.set_barrier_log_capacity(0);
        ctx.submit_pipeline_barrier(&barrier);
        assert!(ctx.submitted_barriers().is_empty());
        assert_eq!(ctx.stats().barriers_submitted, 10 * DEFAULT_BARRIER_LOG_CAPACITY + 2);
    }

    #[test]
    fn test_write_buffer_offset_overflow() {
        let ctx = HostContext::new();
        let buffer = ctx.create_buffer(&storage_desc(16), true).unwrap();
        let err = ctx.write_buffer(&buffer, u64::MAX - 1, &[0u8; 4]).unwrap_err();
        assert!(err.is_precondition());
        let err = ctx.write_buffer(&buffer, u64::MAX, &[]).unwrap_err();
        assert!(err.is_precondition());
        ctx.write_buffer(&buffer, 12, &[1u8; 4]).unwrap();
        ctx.register_buffer_cleanup(buffer);
    }
}
