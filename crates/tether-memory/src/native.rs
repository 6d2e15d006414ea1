//! The seam to the native library that owns the real resources.

use crate::allocator::MemoryAllocator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_core::NativeHandle;
use tracing::trace;

/// Operations the bridge needs from the native side.
///
/// Implementations must be callable from any thread.
pub trait NativeLibrary: Send + Sync {
    /// Create a native object backed by `size` bytes, with a native
    /// reference count of 1. `None` signals exhaustion.
    fn allocate(&self, size: usize) -> Option<NativeHandle>;

    /// The native library's own reference count for `handle`.
    fn native_ref_count(&self, handle: NativeHandle) -> u32;

    /// Take an additional native reference (a native-side copy).
    fn acquire(&self, handle: NativeHandle);

    /// Drop one native reference; the object is destroyed at zero.
    fn release(&self, handle: NativeHandle);

    /// Make `allocator` the one that serves memory for `handle`.
    fn attach_allocator(&self, handle: NativeHandle, allocator: Arc<MemoryAllocator>);

    /// Allocator previously attached to `handle`, if any.
    fn attached_allocator(&self, handle: NativeHandle) -> Option<Arc<MemoryAllocator>>;
}

struct SimulatedObject {
    refs: u32,
    size: usize,
    allocator: Option<Arc<MemoryAllocator>>,
}

/// In-process stand-in for a native library.
///
/// Objects are bookkeeping only: `size` is recorded, not allocated, so
/// tests can model large native blocks cheaply.
pub struct SimulatedLibrary {
    objects: Mutex<HashMap<NativeHandle, SimulatedObject>>,
    releases: Mutex<HashMap<NativeHandle, u32>>,
    next_handle: AtomicU64,
    destroyed: AtomicU64,
    byte_limit: Option<usize>,
}

impl SimulatedLibrary {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            releases: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            destroyed: AtomicU64::new(0),
            byte_limit: None,
        }
    }

    /// A library whose live objects may never exceed `limit` bytes.
    pub fn with_byte_limit(limit: usize) -> Self {
        Self {
            byte_limit: Some(limit),
            ..Self::new()
        }
    }

    /// Create an object or panic; convenient for fixtures.
    pub fn create(&self, size: usize) -> NativeHandle {
        match self.allocate(size) {
            Some(handle) => handle,
            None => panic!("simulated library exhausted allocating {size} bytes"),
        }
    }

    /// How many times `release` was called for `handle`.
    pub fn release_calls(&self, handle: NativeHandle) -> u32 {
        self.releases.lock().get(&handle).copied().unwrap_or(0)
    }

    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.objects.lock().contains_key(&handle)
    }

    pub fn live_objects(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn live_bytes(&self) -> usize {
        self.objects.lock().values().map(|o| o.size).sum()
    }

    /// Objects destroyed because their native count reached zero.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeLibrary for SimulatedLibrary {
    fn allocate(&self, size: usize) -> Option<NativeHandle> {
        let mut objects = self.objects.lock();
        if let Some(limit) = self.byte_limit {
            let live: usize = objects.values().map(|o| o.size).sum();
            if live + size > limit {
                return None;
            }
        }
        let handle = NativeHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst))?;
        objects.insert(
            handle,
            SimulatedObject {
                refs: 1,
                size,
                allocator: None,
            },
        );
        Some(handle)
    }

    fn native_ref_count(&self, handle: NativeHandle) -> u32 {
        self.objects.lock().get(&handle).map_or(0, |o| o.refs)
    }

    fn acquire(&self, handle: NativeHandle) {
        if let Some(object) = self.objects.lock().get_mut(&handle) {
            object.refs += 1;
        }
    }

    fn release(&self, handle: NativeHandle) {
        *self.releases.lock().entry(handle).or_insert(0) += 1;
        let mut objects = self.objects.lock();
        let destroy = match objects.get_mut(&handle) {
            Some(object) => {
                object.refs -= 1;
                object.refs == 0
            }
            None => false,
        };
        if destroy {
            objects.remove(&handle);
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            trace!("Native object {} destroyed", handle);
        }
    }

    fn attach_allocator(&self, handle: NativeHandle, allocator: Arc<MemoryAllocator>) {
        if let Some(object) = self.objects.lock().get_mut(&handle) {
            object.allocator = Some(allocator);
        }
    }

    fn attached_allocator(&self, handle: NativeHandle) -> Option<Arc<MemoryAllocator>> {
        self.objects
            .lock()
            .get(&handle)
            .and_then(|o| o.allocator.clone())
    }
}
