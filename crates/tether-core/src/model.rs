//! Allocation strategies and the registry holding the active one.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

/// Where the bytes behind a native-backed proxy live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backing {
    /// Blocks handed out by the managed-side allocator.
    Managed,
    /// Off-heap blocks allocated by the allocator on behalf of native code.
    ///
    /// Served from the same backing store as [`Backing::Managed`]; the two
    /// differ only in how the model reports and associates them.
    Direct,
    /// Blocks owned entirely by the native library.
    Native,
}

/// Allocation strategy for large native-backed blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryModel {
    /// Managed-heap arrays; the most robust option.
    #[default]
    ManagedHeap,
    /// Managed-heap arrays with allocation-pressure hints.
    ManagedHeapWithHint,
    /// Direct buffers, no hints.
    DirectBuffers,
    /// Direct buffers with allocation-pressure hints.
    DirectBuffersWithHint,
    /// Pure native allocation, no hints. Fastest, least forgiving.
    NativeBuffers,
    /// Pure native allocation with allocation-pressure hints.
    NativeBuffersWithHint,
}

impl MemoryModel {
    /// Every model, in native-value order.
    pub const ALL: [MemoryModel; 6] = [
        Self::ManagedHeap,
        Self::DirectBuffers,
        Self::DirectBuffersWithHint,
        Self::NativeBuffers,
        Self::NativeBuffersWithHint,
        Self::ManagedHeapWithHint,
    ];

    /// Stable integer understood by the native library.
    pub fn native_value(self) -> i32 {
        match self {
            Self::ManagedHeap => 0,
            Self::DirectBuffers => 1,
            Self::DirectBuffersWithHint => 2,
            Self::NativeBuffers => 3,
            Self::NativeBuffersWithHint => 4,
            Self::ManagedHeapWithHint => 5,
        }
    }

    /// Inverse of [`native_value`](Self::native_value).
    pub fn from_native_value(value: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.native_value() == value)
            .ok_or(BridgeError::InvalidMemoryModel(value))
    }

    pub fn backing(self) -> Backing {
        match self {
            Self::ManagedHeap | Self::ManagedHeapWithHint => Backing::Managed,
            Self::DirectBuffers | Self::DirectBuffersWithHint => Backing::Direct,
            Self::NativeBuffers | Self::NativeBuffersWithHint => Backing::Native,
        }
    }

    /// Whether allocations are reported as collector pressure.
    pub fn hints_collector(self) -> bool {
        matches!(
            self,
            Self::ManagedHeapWithHint | Self::DirectBuffersWithHint | Self::NativeBuffersWithHint
        )
    }

    /// Whether proxies created under this model get an allocator association.
    ///
    /// The two hint-less off-heap models skip the bookkeeping entirely.
    pub fn uses_allocator(self) -> bool {
        !matches!(self, Self::DirectBuffers | Self::NativeBuffers)
    }
}

/// Holder of the process-wide active [`MemoryModel`].
///
/// Changing the model is not coordinated with allocations already in
/// flight: callers switch models only during initialization or at a
/// quiescent point. Blocks allocated before a switch keep the model they
/// were allocated under.
#[derive(Debug)]
pub struct ModelRegistry {
    current: AtomicU8,
}

impl ModelRegistry {
    pub fn new(model: MemoryModel) -> Self {
        Self {
            current: AtomicU8::new(model.native_value() as u8),
        }
    }

    /// The active model.
    pub fn get(&self) -> MemoryModel {
        let raw = self.current.load(Ordering::SeqCst) as i32;
        // Only valid values are ever stored.
        MemoryModel::from_native_value(raw).unwrap_or_default()
    }

    /// Switch the active model, returning the previous one.
    pub fn set(&self, model: MemoryModel) -> MemoryModel {
        let previous = self
            .current
            .swap(model.native_value() as u8, Ordering::SeqCst);
        let previous = MemoryModel::from_native_value(previous as i32).unwrap_or_default();
        if previous != model {
            info!("Memory model changed: {:?} -> {:?}", previous, model);
        }
        previous
    }

    /// Switch the active model from its native value.
    pub fn set_native_value(&self, value: i32) -> Result<MemoryModel> {
        let model = MemoryModel::from_native_value(value)?;
        Ok(self.set(model))
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(MemoryModel::default())
    }
}
