//! GPU tensor types
//!
//! This module provides [`VTensor`], the logical view a compute dispatch
//! works with, and [`TensorStorage`], the physical image or buffer behind
//! it. The layout helpers compute padded sizes and image extents for the
//! packed memory layouts.

mod core;
mod layout;
mod storage;

pub use core::{UniformRef, VTensor};
pub use layout::{
    GpuMemoryLayout, PACKING, Sizes, StorageType, UVec3, calc_gpu_sizes, check_rank,
    checked_buffer_length, checked_numel, create_image_extents, make_extents_uvec4,
    make_whcn_ivec4, whcn_dim,
};
pub use storage::{Resource, TensorStorage};
