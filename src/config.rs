//! Context configuration
//!
//! `ContextConfig` carries the tunables every [`GpuContext`](crate::runtime::GpuContext)
//! honours. Values come from `Default`, builder setters, or the process
//! environment via [`ContextConfig::from_env`].
//!
//! # Environment Variables
//!
//! - `VTENSOR_MEMORY_BUDGET`: device memory budget in bytes (unset = unlimited)
//! - `VTENSOR_BUFFER_ALIGNMENT`: alignment of storage buffer/image allocations
//! - `VTENSOR_UNIFORM_ALIGNMENT`: alignment of uniform buffer allocations
//! - `VTENSOR_LABEL`: label prefix for created GPU objects

use crate::error::{Error, Result};
use std::str::FromStr;

/// Environment variable holding the memory budget
pub const ENV_MEMORY_BUDGET: &str = "VTENSOR_MEMORY_BUDGET";
/// Environment variable holding the storage alignment
pub const ENV_BUFFER_ALIGNMENT: &str = "VTENSOR_BUFFER_ALIGNMENT";
/// Environment variable holding the uniform alignment
pub const ENV_UNIFORM_ALIGNMENT: &str = "VTENSOR_UNIFORM_ALIGNMENT";
/// Environment variable holding the object label prefix
pub const ENV_LABEL: &str = "VTENSOR_LABEL";

/// Tunables shared by all contexts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextConfig {
    /// Maximum bytes of device memory the context may hand out
    ///
    /// `None` means only the device's own limits apply.
    pub memory_budget: Option<u64>,
    /// Alignment of storage buffer and image allocations, in bytes
    pub buffer_alignment: u64,
    /// Alignment of uniform buffer allocations, in bytes
    pub uniform_alignment: u64,
    /// Prefix for labels of created GPU objects
    pub label: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            memory_budget: None,
            buffer_alignment: 256,
            uniform_alignment: 256,
            label: "vtensor".to_string(),
        }
    }
}

impl ContextConfig {
    /// Set the memory budget
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Set the storage allocation alignment
    pub fn with_buffer_alignment(mut self, bytes: u64) -> Self {
        self.buffer_alignment = bytes;
        self
    }

    /// Set the uniform allocation alignment
    pub fn with_uniform_alignment(mut self, bytes: u64) -> Self {
        self.uniform_alignment = bytes;
        self
    }

    /// Set the label prefix
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Build a config from defaults overridden by `VTENSOR_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(budget) = read_env::<u64>(ENV_MEMORY_BUDGET, "memory_budget")? {
            config.memory_budget = Some(budget);
        }
        if let Some(align) = read_env::<u64>(ENV_BUFFER_ALIGNMENT, "buffer_alignment")? {
            config.buffer_alignment = align;
        }
        if let Some(align) = read_env::<u64>(ENV_UNIFORM_ALIGNMENT, "uniform_alignment")? {
            config.uniform_alignment = align;
        }
        if let Ok(label) = std::env::var(ENV_LABEL) {
            config.label = label;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that alignments are non-zero powers of two
    pub fn validate(&self) -> Result<()> {
        if !self.buffer_alignment.is_power_of_two() {
            return Err(Error::invalid_argument(
                "buffer_alignment",
                format!("{} is not a power of two", self.buffer_alignment),
            ));
        }
        if !self.uniform_alignment.is_power_of_two() {
            return Err(Error::invalid_argument(
                "uniform_alignment",
                format!("{} is not a power of two", self.uniform_alignment),
            ));
        }
        Ok(())
    }
}

fn read_env<T>(name: &'static str, arg: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::invalid_argument(arg, format!("{name}='{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}
