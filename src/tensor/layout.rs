//! Layout: storage types, packed memory layouts and GPU size computation
//!
//! Shaders address tensors in WHCN order (width, height, channels, batch),
//! i.e. innermost dimension first. One of W, H or C is "packed": four
//! consecutive elements along it share one texel, so that dimension is
//! padded up to a multiple of 4 in GPU memory.

use crate::dtype::DType;
use crate::error::{Error, Result};
use smallvec::SmallVec;

/// Stack allocation threshold for dimensions
/// Texture-backed tensors have at most 4 dimensions
pub(crate) const STACK_DIMS: usize = 4;

/// Number of elements packed into one texel
pub const PACKING: usize = 4;

/// Sizes type: size along each dimension, outermost first
pub type Sizes = SmallVec<[usize; STACK_DIMS]>;

/// Image extents (width, height, depth) in texels
pub type UVec3 = [u32; 3];

/// Kind of GPU memory object backing a tensor
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StorageType {
    /// Linear storage buffer
    Buffer,
    /// 1D image texture (extents must be `[w, 1, 1]`)
    Texture1D,
    /// 2D image texture (extents must be `[w, h, 1]`)
    Texture2D,
    /// 3D image texture, batches stacked along depth
    Texture3D,
}

impl StorageType {
    /// Returns true for image-backed storage
    #[inline]
    pub const fn is_texture(self) -> bool {
        !matches!(self, Self::Buffer)
    }

    /// Number of image dimensions (0 for buffers)
    #[inline]
    pub const fn image_dims(self) -> usize {
        match self {
            Self::Buffer => 0,
            Self::Texture1D => 1,
            Self::Texture2D => 2,
            Self::Texture3D => 3,
        }
    }
}

/// Which WHCN dimension is packed into 4-wide texels
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GpuMemoryLayout {
    /// Width (innermost) dimension packed
    WidthPacked = 0,
    /// Height dimension packed
    HeightPacked = 1,
    /// Channel dimension packed
    #[default]
    ChannelsPacked = 2,
}

impl GpuMemoryLayout {
    /// Index of the packed dimension in WHCN order (0 = W, 1 = H, 2 = C)
    #[inline]
    pub const fn packed_dim_whcn(self) -> usize {
        self as usize
    }

    /// Index of the packed dimension in a tensor of rank `ndim`,
    /// or `None` if the tensor has no such dimension
    #[inline]
    pub const fn packed_dim(self, ndim: usize) -> Option<usize> {
        let whcn = self.packed_dim_whcn();
        if whcn < ndim {
            Some(ndim - 1 - whcn)
        } else {
            None
        }
    }
}

// ============================================================================
// Size helpers
// ============================================================================

/// Size of the dimension `whcn` positions from the innermost one
///
/// Dimensions beyond the tensor's rank count as 1.
#[inline]
pub fn whcn_dim(sizes: &[usize], whcn: usize) -> usize {
    if whcn < sizes.len() {
        sizes[sizes.len() - 1 - whcn]
    } else {
        1
    }
}

/// Compute the padded GPU sizes for a tensor
///
/// The dimension selected by `layout` is rounded up to a multiple of 4.
/// The rank is preserved; if the tensor has no packed dimension nothing is
/// padded and the texel holds a single element. Returns `None` if padding
/// overflows `usize`.
pub fn calc_gpu_sizes(sizes: &[usize], layout: GpuMemoryLayout) -> Option<Sizes> {
    let mut gpu_sizes: Sizes = sizes.iter().copied().collect();
    if let Some(dim) = layout.packed_dim(sizes.len()) {
        gpu_sizes[dim] = sizes[dim].checked_next_multiple_of(PACKING)?;
    }
    Some(gpu_sizes)
}

/// Number of elements in `sizes`, or `None` if the count overflows `usize`
#[inline]
pub fn checked_numel(sizes: &[usize]) -> Option<usize> {
    sizes.iter().try_fold(1usize, |acc, &s| acc.checked_mul(s))
}

/// Number of padded elements the storage holds
///
/// Fails when the element count, or its size in bytes for `dtype`, does not
/// fit in `usize` and `u64`.
pub fn checked_buffer_length(
    storage_type: StorageType,
    gpu_sizes: &[usize],
    dtype: DType,
) -> Result<usize> {
    checked_numel(gpu_sizes)
        .filter(|&numel| {
            numel
                .checked_mul(dtype.size_in_bytes())
                .is_some_and(|bytes| u64::try_from(bytes).is_ok())
        })
        .ok_or_else(|| {
            Error::invalid_configuration(
                storage_type,
                format!("{gpu_sizes:?} elements of {dtype} overflow the address space"),
            )
        })
}

/// Check that a tensor of the given rank can live in `storage_type`
pub fn check_rank(storage_type: StorageType, ndim: usize) -> Result<()> {
    if storage_type.is_texture() && !(1..=4).contains(&ndim) {
        return Err(Error::invalid_configuration(
            storage_type,
            format!("texture storage requires 1 <= ndim <= 4, got {ndim}"),
        ));
    }
    Ok(())
}

/// Compute image extents for texture storage
///
/// Width, height and depth come from W, H and C*N of the gpu sizes; the packed
/// dimension is divided by 4. Buffers have no extents and get `[0, 0, 0]`.
pub fn create_image_extents(
    gpu_sizes: &[usize],
    storage_type: StorageType,
    layout: GpuMemoryLayout,
) -> Result<UVec3> {
    if !storage_type.is_texture() {
        return Ok([0, 0, 0]);
    }
    check_rank(storage_type, gpu_sizes.len())?;

    let mut whcn = [
        whcn_dim(gpu_sizes, 0),
        whcn_dim(gpu_sizes, 1),
        whcn_dim(gpu_sizes, 2),
        whcn_dim(gpu_sizes, 3),
    ];
    let packed = layout.packed_dim_whcn();
    whcn[packed] = whcn[packed].div_ceil(PACKING);

    let to_u32 = |v: usize| {
        u32::try_from(v).map_err(|_| {
            Error::invalid_configuration(storage_type, format!("extent {v} does not fit in u32"))
        })
    };
    let depth = whcn[2].checked_mul(whcn[3]).ok_or_else(|| {
        Error::invalid_configuration(storage_type, "depth C*N overflows usize")
    })?;
    Ok([to_u32(whcn[0])?, to_u32(whcn[1])?, to_u32(depth)?])
}

/// Pack sizes into a WHCN `ivec4`, missing dimensions filled with 1
pub fn make_whcn_ivec4(sizes: &[usize]) -> [i32; 4] {
    let mut out = [1i32; 4];
    for (whcn, slot) in out.iter_mut().enumerate() {
        // Shader-side sizes are 32-bit; saturate rather than wrap.
        *slot = i32::try_from(whcn_dim(sizes, whcn)).unwrap_or(i32::MAX);
    }
    out
}

/// Pack image extents into a `uvec4` with a trailing 1
#[inline]
pub fn make_extents_uvec4(extents: UVec3) -> [u32; 4] {
    [extents[0], extents[1], extents[2], 1]
}
