//! Data type descriptors for GPU tensors
//!
//! The storage layer treats element types as opaque. It only needs two facts
//! about a dtype: how many bytes one element occupies, and which 4-component
//! texel format represents it when the tensor is backed by an image texture.

use std::fmt;

// ============================================================================
// DType Enum
// ============================================================================

/// Element types a GPU tensor can hold
///
/// # Discriminant Values (Serialization Stability)
///
/// - Floats: 0-9 (F64=0, F32=1, F16=2, BF16=3)
/// - Signed ints: 10-19 (I64=10, I32=11, I16=12, I8=13)
/// - Unsigned ints: 20-29 (U64=20, U32=21, U16=22, U8=23)
/// - Bool: 30
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum DType {
    /// 64-bit floating point
    F64 = 0,
    /// 32-bit floating point (most common)
    F32 = 1,
    /// 16-bit floating point (IEEE 754)
    F16 = 2,
    /// 16-bit brain floating point
    BF16 = 3,

    /// 64-bit signed integer
    I64 = 10,
    /// 32-bit signed integer
    I32 = 11,
    /// 16-bit signed integer
    I16 = 12,
    /// 8-bit signed integer
    I8 = 13,

    /// 64-bit unsigned integer
    U64 = 20,
    /// 32-bit unsigned integer
    U32 = 21,
    /// 16-bit unsigned integer
    U16 = 22,
    /// 8-bit unsigned integer
    U8 = 23,

    /// Boolean type
    Bool = 30,
}

impl DType {
    /// Size of one element in bytes
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F64 | Self::I64 | Self::U64 => 8,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F16 | Self::BF16 | Self::I16 | Self::U16 => 2,
            Self::I8 | Self::U8 | Self::Bool => 1,
        }
    }

    /// Returns true if this is a floating point type
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F64 | Self::F32 | Self::F16 | Self::BF16)
    }

    /// Returns true if this is any integer type (signed or unsigned)
    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(
            self,
            Self::I64
                | Self::I32
                | Self::I16
                | Self::I8
                | Self::U64
                | Self::U32
                | Self::U16
                | Self::U8
        )
    }

    /// Texel format used when this dtype is stored in an image texture
    ///
    /// Every texel packs four consecutive elements along the packed dimension.
    /// Returns `None` for dtypes that have no 4-component image format.
    #[inline]
    pub const fn texel_format(self) -> Option<TexelFormat> {
        match self {
            Self::F32 => Some(TexelFormat::Rgba32Float),
            Self::F16 => Some(TexelFormat::Rgba16Float),
            Self::I32 => Some(TexelFormat::Rgba32Sint),
            Self::U32 => Some(TexelFormat::Rgba32Uint),
            Self::I8 => Some(TexelFormat::Rgba8Sint),
            Self::U8 | Self::Bool => Some(TexelFormat::Rgba8Uint),
            _ => None,
        }
    }

    /// Short name for display (e.g., "f32", "i64")
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::I64 => "i64",
            Self::I32 => "i32",
            Self::I16 => "i16",
            Self::I8 => "i8",
            Self::U64 => "u64",
            Self::U32 => "u32",
            Self::U16 => "u16",
            Self::U8 => "u8",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

// ============================================================================
// Texel formats
// ============================================================================

/// 4-component image formats used for texture-backed tensors
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TexelFormat {
    /// Four 32-bit floats
    Rgba32Float,
    /// Four 16-bit floats
    Rgba16Float,
    /// Four 32-bit signed integers
    Rgba32Sint,
    /// Four 32-bit unsigned integers
    Rgba32Uint,
    /// Four 8-bit signed integers
    Rgba8Sint,
    /// Four 8-bit unsigned integers
    Rgba8Uint,
}

impl TexelFormat {
    /// Size of one texel in bytes
    #[inline]
    pub const fn texel_size(self) -> u64 {
        match self {
            Self::Rgba32Float | Self::Rgba32Sint | Self::Rgba32Uint => 16,
            Self::Rgba16Float => 8,
            Self::Rgba8Sint | Self::Rgba8Uint => 4,
        }
    }
}
