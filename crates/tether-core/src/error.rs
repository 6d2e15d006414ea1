//! Error types for Tether.

use thiserror::Error;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Retries exhausted (or cancelled) while allocating.
    #[error("Out of memory: could not allocate {size} bytes after {attempts} attempt(s)")]
    OutOfMemory { size: usize, attempts: u32 },

    /// The emergency reserve could not be re-established.
    #[error("Out of memory: could not pack {bytes}-byte parachute")]
    ParachutePack { bytes: usize },

    #[error("Already released: {0}")]
    AlreadyReleased(String),

    /// Freed a block this allocator does not track (double free or foreign block).
    #[error("Block {0} is not tracked by this allocator")]
    UnknownBlock(u64),

    #[error("Background collector is already running")]
    CollectorRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid memory model value: {0}")]
    InvalidMemoryModel(i32),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True for every flavour of resource exhaustion.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::ParachutePack { .. })
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
