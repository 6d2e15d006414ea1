//! Tether Core - Foundation types for the native-memory bridge
//!
//! This crate provides the types shared by every layer of the bridge:
//! - Native handles and the external reference count cell
//! - Memory models and the registry of the active one
//! - Tuning and lifecycle configuration
//! - The error taxonomy

pub mod config;
pub mod error;
pub mod handle;
pub mod model;

pub use config::{BridgeConfig, ReclaimPolicy, RetryPolicy, TrackerConfig};
pub use error::{BridgeError, Result};
pub use handle::{ExternalRefCount, NativeHandle};
pub use model::{Backing, MemoryModel, ModelRegistry};

/// Sizing constants shared by the allocator and the reference heap.
pub mod limits {
    /// Default emergency reserve held by the parachute.
    pub const PARACHUTE_BYTES: usize = 10_000;

    /// Size of the allocation made right after the parachute is pulled.
    pub const PARACHUTE_NUDGE_BYTES: usize = 4;

    /// Default floor for the reference heap's slot capacity.
    pub const MIN_REFERENCES_TO_CACHE: usize = 4 * 1024;
}
