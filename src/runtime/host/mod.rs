//! Host-memory GPU context (requires `host` feature, enabled by default)
//!
//! `HostContext` emulates an explicit GPU compute context in host memory.
//! Images, buffers and memory blocks live in a registry keyed by
//! [`ResourceId`](super::ResourceId); memory is plain zeroed byte vectors.
//! The context enforces the configured memory budget, defers release of
//! resources registered for cleanup until [`HostContext::flush_cleanup`],
//! counts every submitted pipeline barrier, and keeps the most recent ones
//! so callers can inspect the synchronization a sequence of accesses
//! produced.
//!
//! It is the reference context for tests and for running tensor graphs on
//! machines without a GPU.

mod context;
mod memory;

pub use context::{DEFAULT_BARRIER_LOG_CAPACITY, HostContext, HostStats};
