//! Pipeline barrier model
//!
//! Explicit compute APIs do not order memory accesses between dispatches on
//! their own. Every resource remembers the last (stage, access) pair that
//! touched it; the next access compares against it and emits a barrier when a
//! hazard exists. Barriers for several resources can be accumulated into one
//! [`PipelineBarrier`] and submitted together.

use super::resource::ResourceId;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
        pub struct $name {
            bits: u32,
        }

        impl $name {
            /// Empty set
            pub const NONE: Self = Self { bits: 0 };
            $(
                $(#[$fmeta])*
                pub const $flag: Self = Self { bits: $bit };
            )*

            /// Raw bit representation
            #[inline]
            pub const fn bits(self) -> u32 {
                self.bits
            }

            /// Check if the set is empty
            #[inline]
            pub const fn is_empty(self) -> bool {
                self.bits == 0
            }

            /// Check if every flag of `other` is set
            #[inline]
            pub const fn contains(self, other: Self) -> bool {
                self.bits & other.bits == other.bits
            }

            /// Check if any flag of `other` is set
            #[inline]
            pub const fn intersects(self, other: Self) -> bool {
                self.bits & other.bits != 0
            }

            /// Union of two sets
            #[inline]
            pub const fn union(self, other: Self) -> Self {
                Self { bits: self.bits | other.bits }
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.bits |= rhs.bits;
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self { bits: self.bits & rhs.bits }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_empty() {
                    return write!(f, "{}(NONE)", stringify!($name));
                }
                let mut names = Vec::new();
                $(
                    if self.contains(Self::$flag) {
                        names.push(stringify!($flag));
                    }
                )*
                write!(f, "{}({})", stringify!($name), names.join(" | "))
            }
        }
    };
}

flag_set! {
    /// Phase of GPU execution an access happens in
    PipelineStage {
        /// Compute shader dispatch
        COMPUTE = 1 << 0,
        /// Host reads/writes of mapped memory
        HOST = 1 << 1,
        /// Copy commands
        TRANSFER = 1 << 2,
    }
}

flag_set! {
    /// Read and/or write intent of an access
    MemoryAccess {
        /// Resource is read
        READ = 1 << 0,
        /// Resource is written
        WRITE = 1 << 1,
    }
}

flag_set! {
    /// Concrete access bits placed in a memory barrier
    AccessMask {
        /// Shader read
        SHADER_READ = 1 << 0,
        /// Shader write
        SHADER_WRITE = 1 << 1,
        /// Host read
        HOST_READ = 1 << 2,
        /// Host write
        HOST_WRITE = 1 << 3,
        /// Transfer read
        TRANSFER_READ = 1 << 4,
        /// Transfer write
        TRANSFER_WRITE = 1 << 5,
    }
}

flag_set! {
    /// Pipeline stage bits placed in a barrier's source/destination scope
    StageMask {
        /// Start of the pipeline; used when nothing precedes the barrier
        TOP_OF_PIPE = 1 << 0,
        /// Compute shader stage
        COMPUTE_SHADER = 1 << 1,
        /// Host access
        HOST = 1 << 2,
        /// Transfer stage
        TRANSFER = 1 << 3,
        /// End of the pipeline; used when nothing waits on the barrier
        BOTTOM_OF_PIPE = 1 << 4,
    }
}

impl MemoryAccess {
    /// Read and write
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// True if the access includes a write
    #[inline]
    pub const fn writes(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl PipelineStage {
    /// Stage bits for the barrier scope
    pub fn stage_mask(self) -> StageMask {
        let mut mask = StageMask::NONE;
        if self.contains(Self::COMPUTE) {
            mask |= StageMask::COMPUTE_SHADER;
        }
        if self.contains(Self::HOST) {
            mask |= StageMask::HOST;
        }
        if self.contains(Self::TRANSFER) {
            mask |= StageMask::TRANSFER;
        }
        mask
    }
}

/// Access bits for a (stage, access) pair
pub fn access_mask(stage: PipelineStage, access: MemoryAccess) -> AccessMask {
    let mut mask = AccessMask::NONE;
    if access.contains(MemoryAccess::READ) {
        if stage.contains(PipelineStage::COMPUTE) {
            mask |= AccessMask::SHADER_READ;
        }
        if stage.contains(PipelineStage::HOST) {
            mask |= AccessMask::HOST_READ;
        }
        if stage.contains(PipelineStage::TRANSFER) {
            mask |= AccessMask::TRANSFER_READ;
        }
    }
    if access.contains(MemoryAccess::WRITE) {
        if stage.contains(PipelineStage::COMPUTE) {
            mask |= AccessMask::SHADER_WRITE;
        }
        if stage.contains(PipelineStage::HOST) {
            mask |= AccessMask::HOST_WRITE;
        }
        if stage.contains(PipelineStage::TRANSFER) {
            mask |= AccessMask::TRANSFER_WRITE;
        }
    }
    mask
}

/// Memory layout an image must be in for an access
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents undefined; freshly created or discarded
    #[default]
    Undefined,
    /// Read/write storage image access
    General,
    /// Sampled, read-only shader access
    ShaderReadOnly,
    /// Source of a copy
    TransferSrc,
    /// Destination of a copy
    TransferDst,
}

impl ImageLayout {
    /// Layout required for a (stage, access) pair
    pub fn for_access(stage: PipelineStage, access: MemoryAccess) -> Self {
        if access.is_empty() {
            return Self::Undefined;
        }
        let transfer = stage.contains(PipelineStage::TRANSFER);
        match (access.writes(), transfer) {
            (false, true) => Self::TransferSrc,
            (false, false) => Self::ShaderReadOnly,
            (true, true) => Self::TransferDst,
            (true, false) => Self::General,
        }
    }
}

/// Most recent access to a resource
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LastAccess {
    /// Stage the access happened in
    pub stage: PipelineStage,
    /// Access mode
    pub access: MemoryAccess,
}

impl LastAccess {
    /// Create a last-access record
    pub const fn new(stage: PipelineStage, access: MemoryAccess) -> Self {
        Self { stage, access }
    }

    /// True if nothing has touched the resource yet
    #[inline]
    pub const fn is_none(&self) -> bool {
        self.access.is_empty()
    }
}

// ============================================================================
// Barriers
// ============================================================================

/// Source and destination stage scopes
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StageScope {
    /// Stages that must complete before the barrier
    pub src: StageMask,
    /// Stages that wait on the barrier
    pub dst: StageMask,
}

/// Memory barrier on a buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferMemoryBarrier {
    /// Buffer the barrier applies to
    pub buffer: ResourceId,
    /// Accesses made available
    pub src_access: AccessMask,
    /// Accesses made visible
    pub dst_access: AccessMask,
}

/// Memory barrier with layout transition on an image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageMemoryBarrier {
    /// Image the barrier applies to
    pub image: ResourceId,
    /// Accesses made available
    pub src_access: AccessMask,
    /// Accesses made visible
    pub dst_access: AccessMask,
    /// Layout before the barrier
    pub old_layout: ImageLayout,
    /// Layout after the barrier
    pub new_layout: ImageLayout,
}

/// Accumulator of barriers to be submitted as one pipeline barrier command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineBarrier {
    /// Combined stage scope
    pub stage: StageScope,
    /// Buffer barriers
    pub buffers: Vec<BufferMemoryBarrier>,
    /// Image barriers
    pub images: Vec<ImageMemoryBarrier>,
}

impl PipelineBarrier {
    /// Create an empty barrier
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no resource barrier has been added
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    /// Number of resource barriers
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len() + self.images.len()
    }

    /// Widen the stage scope for a transition from `prev` to `cur`
    pub(crate) fn add_stages(&mut self, prev: PipelineStage, cur: PipelineStage) {
        let mut src = prev.stage_mask();
        if src.is_empty() {
            src = StageMask::TOP_OF_PIPE;
        }
        let mut dst = cur.stage_mask();
        if dst.is_empty() {
            dst = StageMask::BOTTOM_OF_PIPE;
        }
        self.stage.src |= src;
        self.stage.dst |= dst;
    }

    /// Move all barriers of `other` into `self`
    pub fn append(&mut self, other: &mut PipelineBarrier) {
        self.stage.src |= other.stage.src;
        self.stage.dst |= other.stage.dst;
        self.buffers.append(&mut other.buffers);
        self.images.append(&mut other.images);
        other.stage = StageScope::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_ops() {
        let rw = MemoryAccess::READ | MemoryAccess::WRITE;
        assert_eq!(rw, MemoryAccess::READ_WRITE);
        assert!(rw.writes());
        assert!(!MemoryAccess::READ.writes());
        assert!(rw.contains(MemoryAccess::READ));
        assert!(MemoryAccess::NONE.is_empty());
        assert_eq!(format!("{:?}", rw), "MemoryAccess(READ | WRITE)");
        assert_eq!(format!("{:?}", PipelineStage::NONE), "PipelineStage(NONE)");
    }

    #[test]
    fn test_image_layout_for_access() {
        use ImageLayout::*;
        assert_eq!(ImageLayout::for_access(PipelineStage::COMPUTE, MemoryAccess::READ), ShaderReadOnly);
        assert_eq!(ImageLayout::for_access(PipelineStage::COMPUTE, MemoryAccess::WRITE), General);
        assert_eq!(ImageLayout::for_access(PipelineStage::COMPUTE, MemoryAccess::READ_WRITE), General);
        assert_eq!(ImageLayout::for_access(PipelineStage::TRANSFER, MemoryAccess::READ), TransferSrc);
        assert_eq!(ImageLayout::for_access(PipelineStage::TRANSFER, MemoryAccess::WRITE), TransferDst);
        assert_eq!(ImageLayout::for_access(PipelineStage::COMPUTE, MemoryAccess::NONE), Undefined);
    }

    #[test]
    fn test_access_mask() {
        assert_eq!(
            access_mask(PipelineStage::COMPUTE, MemoryAccess::READ_WRITE),
            AccessMask::SHADER_READ | AccessMask::SHADER_WRITE
        );
        assert_eq!(access_mask(PipelineStage::HOST, MemoryAccess::READ), AccessMask::HOST_READ);
        assert_eq!(access_mask(PipelineStage::NONE, MemoryAccess::WRITE), AccessMask::NONE);
    }

    #[test]
    fn test_stage_scope_defaults() {
        let mut barrier = PipelineBarrier::new();
        barrier.add_stages(PipelineStage::NONE, PipelineStage::NONE);
        assert_eq!(barrier.stage.src, StageMask::TOP_OF_PIPE);
        assert_eq!(barrier.stage.dst, StageMask::BOTTOM_OF_PIPE);

        barrier.add_stages(PipelineStage::COMPUTE, PipelineStage::TRANSFER);
        assert!(barrier.stage.src.contains(StageMask::COMPUTE_SHADER));
        assert!(barrier.stage.dst.contains(StageMask::TRANSFER));
    }

    #[test]
    fn test_append() {
        let mut a = PipelineBarrier::new();
        let mut b = PipelineBarrier::new();
        b.add_stages(PipelineStage::COMPUTE, PipelineStage::COMPUTE);
        b.buffers.push(BufferMemoryBarrier {
            buffer: ResourceId::from_raw(7),
            src_access: AccessMask::SHADER_WRITE,
            dst_access: AccessMask::SHADER_READ,
        });
        a.append(&mut b);
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert_eq!(a.stage.src, StageMask::COMPUTE_SHADER);
    }
}
