//! Native handles and the managed-side reference count that guards them.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Opaque identifier of one native-side resource.
///
/// Zero is reserved as the "empty" value, so a handle is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeHandle(NonZeroU64);

impl NativeHandle {
    /// Wrap a raw native value, rejecting zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// The raw native value.
    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.get())
    }
}

/// Count of proxies currently claiming one native handle.
///
/// Clones share the same cell. A fresh cell starts at 1 (the creating
/// proxy's claim); every copied proxy calls [`retain`](Self::retain)
/// before registering, and every released proxy calls
/// [`release`](Self::release) exactly once.
#[derive(Clone)]
pub struct ExternalRefCount(Arc<AtomicI64>);

impl ExternalRefCount {
    /// A cell holding the creator's single claim.
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(1)))
    }

    /// Current number of claims.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Add a claim, returning the new count.
    pub fn retain(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop a claim, returning the new count.
    ///
    /// Never goes below zero: releasing an exhausted cell is reported as
    /// [`BridgeError::AlreadyReleased`] and leaves the count at zero.
    pub fn release(&self) -> Result<i64> {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if current <= 0 {
                return Err(BridgeError::AlreadyReleased(
                    "external reference count is already zero".into(),
                ));
            }
            match self.0.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(current - 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// True if both values share one cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for ExternalRefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExternalRefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExternalRefCount").field(&self.get()).finish()
    }
}
