//! Error types for vtensor

use crate::tensor::StorageType;
use thiserror::Error;

/// Result type alias using vtensor's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating, accessing or resizing GPU tensors
#[derive(Error, Debug)]
pub enum Error {
    /// The GPU memory subsystem refused an allocation
    ///
    /// Never retried internally. Callers may free other resources and retry.
    #[error("Allocation failure: could not allocate {requested} bytes ({reason})")]
    AllocationFailure {
        /// Requested size in bytes
        requested: u64,
        /// Why the context refused the request
        reason: String,
    },

    /// The requested storage type cannot represent the rank/layout/dtype combination
    #[error("Invalid configuration for {storage_type:?} storage: {reason}")]
    InvalidConfiguration {
        /// Storage type that was requested
        storage_type: StorageType,
        /// What made the combination invalid
        reason: String,
    },

    /// A method was called in a state where its precondition does not hold
    #[error("Precondition violated in '{operation}': {reason}")]
    PreconditionViolation {
        /// The operation that was called
        operation: &'static str,
        /// Which precondition failed
        reason: String,
    },

    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),

    /// WebGPU-specific error
    #[cfg(feature = "wgpu")]
    #[error("WebGPU error: {0}")]
    Wgpu(#[from] crate::runtime::wgpu::WgpuError),
}

impl Error {
    /// Create an allocation failure error
    pub fn allocation_failure(requested: u64, reason: impl Into<String>) -> Self {
        Self::AllocationFailure {
            requested,
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(storage_type: StorageType, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            storage_type,
            reason: reason.into(),
        }
    }

    /// Create a precondition violation error
    pub fn precondition(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::PreconditionViolation {
            operation,
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Returns true for errors that signal a caller bug rather than a runtime condition
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::PreconditionViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::allocation_failure(1024, "budget exhausted");
        assert_eq!(
            err.to_string(),
            "Allocation failure: could not allocate 1024 bytes (budget exhausted)"
        );

        let err = Error::invalid_configuration(StorageType::Texture3D, "rank 5 exceeds 4");
        assert!(err.to_string().contains("Texture3D"));
        assert!(err.to_string().contains("rank 5"));
    }

    #[test]
    fn test_precondition_classification() {
        assert!(Error::precondition("virtual_resize", "too large").is_precondition());
        assert!(!Error::Backend("lost".into()).is_precondition());
    }
}
