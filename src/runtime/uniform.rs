//! Uniform-parameter buffers

use super::{GpuBuffer, GpuContext};
use crate::error::Result;
use std::fmt;

/// Small uniform buffer holding one shader parameter block
///
/// The buffer is written once at creation and never updated in place: a
/// dispatch that was recorded with it may still be in flight. Tensors drop
/// their cached buffer when the described metadata changes and create a new
/// one on the next request.
pub struct UniformParamsBuffer<C: GpuContext> {
    context: C,
    /// `None` only while dropping
    buffer: Option<GpuBuffer>,
    contents: Vec<u8>,
}

impl<C: GpuContext> UniformParamsBuffer<C> {
    /// Create a uniform buffer holding `params`
    pub fn new<T: bytemuck::Pod>(context: &C, params: &T) -> Result<Self> {
        let contents = bytemuck::bytes_of(params).to_vec();
        let buffer = context.create_uniform_buffer(&contents)?;
        tracing::trace!(buffer = %buffer.id(), bytes = contents.len(), "created uniform buffer");
        Ok(Self {
            context: context.clone(),
            buffer: Some(buffer),
            contents,
        })
    }

    /// The GPU buffer to bind
    pub fn buffer(&self) -> &GpuBuffer {
        self.buffer
            .as_ref()
            .expect("uniform buffer is only taken when dropped")
    }

    /// Bytes written to the buffer
    #[inline]
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Size of the parameter block in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.contents.len()
    }

    /// Reinterpret the contents as `T`
    ///
    /// Returns `None` if `T` is not exactly as large as the parameter block.
    pub fn read<T: bytemuck::Pod>(&self) -> Option<T> {
        bytemuck::try_pod_read_unaligned(&self.contents).ok()
    }
}

impl<C: GpuContext> Drop for UniformParamsBuffer<C> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.context.register_buffer_cleanup(buffer);
        }
    }
}

impl<C: GpuContext> fmt::Debug for UniformParamsBuffer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniformParamsBuffer")
            .field("buffer", &self.buffer.as_ref().map(|b| b.id()))
            .field("size", &self.contents.len())
            .finish()
    }
}
