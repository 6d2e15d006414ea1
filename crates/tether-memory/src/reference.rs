//! Per-proxy records pairing a weak proxy pointer with a native handle.

use crate::allocator::MemoryAllocator;
use crate::native::NativeLibrary;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_core::{BridgeError, ExternalRefCount, MemoryModel, NativeHandle, ReclaimPolicy, Result};
use tracing::{error, trace};

/// How a wrapper relates to the allocator serving its handle.
///
/// Decided once at creation and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Sole claimant on both sides; the wrapper attached the allocator.
    Exclusive,
    /// Other claimants exist; the wrapper keeps their allocator alive.
    Shared,
    /// The active model does not route this handle through the allocator.
    Unmanaged,
}

/// Optional metadata captured when memory debugging is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugInfo {
    pub type_name: &'static str,
    pub identity: usize,
}

pub struct ReferenceWrapper {
    proxy: Weak<dyn Any + Send + Sync>,
    /// Raw handle value; zero once deleted.
    handle: AtomicU64,
    external: ExternalRefCount,
    tracked_resource: bool,
    ownership: Ownership,
    allocator: Mutex<Option<Arc<MemoryAllocator>>>,
    library: Arc<dyn NativeLibrary>,
    debug: Option<DebugInfo>,
}

impl ReferenceWrapper {
    /// Create the record for a freshly constructed proxy.
    ///
    /// The wrapper takes over one claim on `external`; it gives it back
    /// in [`delete`](Self::delete).
    #[allow(clippy::too_many_arguments)]
    pub fn new<P: Any + Send + Sync>(
        proxy: &Weak<P>,
        handle: NativeHandle,
        tracked_resource: bool,
        external: ExternalRefCount,
        library: Arc<dyn NativeLibrary>,
        allocator: &Arc<MemoryAllocator>,
        model: MemoryModel,
        debugging: bool,
    ) -> Self {
        let (ownership, association) = if !model.uses_allocator() {
            (Ownership::Unmanaged, None)
        } else if external.get() == 1 && library.native_ref_count(handle) == 1 {
            library.attach_allocator(handle, Arc::clone(allocator));
            (Ownership::Exclusive, Some(Arc::clone(allocator)))
        } else {
            (Ownership::Shared, library.attached_allocator(handle))
        };

        let debug = debugging.then(|| DebugInfo {
            type_name: std::any::type_name::<P>(),
            identity: proxy.as_ptr() as *const () as usize,
        });

        let proxy: Weak<dyn Any + Send + Sync> = proxy.clone();
        Self {
            proxy,
            handle: AtomicU64::new(handle.get()),
            external,
            tracked_resource,
            ownership,
            allocator: Mutex::new(association),
            library,
            debug,
        }
    }

    /// Release this wrapper's claim on the native handle.
    ///
    /// Safe to race: exactly one caller sees `true`. The native release
    /// runs only when the external count reaches zero, and never twice.
    pub fn delete(&self) -> bool {
        let raw = self.handle.swap(0, Ordering::SeqCst);
        let Some(handle) = NativeHandle::new(raw) else {
            return false;
        };

        match self.external.release() {
            Ok(0) => {
                trace!("Releasing native object {}", handle);
                self.library.release(handle);
            }
            Ok(_) => {}
            Err(e) => error!("Refcount underflow deleting {}: {}", handle, e),
        }
        self.allocator.lock().take();
        true
    }

    pub fn is_deleted(&self) -> bool {
        self.handle.load(Ordering::SeqCst) == 0
    }

    /// The native handle, or `AlreadyReleased` once deleted.
    pub fn handle(&self) -> Result<NativeHandle> {
        NativeHandle::new(self.handle.load(Ordering::SeqCst))
            .ok_or_else(|| BridgeError::AlreadyReleased(self.to_string()))
    }

    pub fn external_ref_count(&self) -> &ExternalRefCount {
        &self.external
    }

    pub fn is_tracked_resource(&self) -> bool {
        self.tracked_resource
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Whether the wrapper still pins an allocator association.
    pub fn holds_allocator(&self) -> bool {
        self.allocator.lock().is_some()
    }

    pub fn is_proxy_alive(&self) -> bool {
        self.proxy.strong_count() > 0
    }

    pub fn debug_info(&self) -> Option<DebugInfo> {
        self.debug
    }
}

impl fmt::Display for ReferenceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceWrapper[native={:#x};", self.handle.load(Ordering::SeqCst))?;
        match &self.debug {
            Some(info) => write!(f, "proxy={};identity={:#x};", info.type_name, info.identity)?,
            None => write!(f, "proxy=?;")?,
        }
        write!(f, "alive={}]", self.is_proxy_alive())
    }
}

impl fmt::Debug for ReferenceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceWrapper")
            .field("handle", &self.handle.load(Ordering::SeqCst))
            .field("external", &self.external.get())
            .field("tracked_resource", &self.tracked_resource)
            .field("ownership", &self.ownership)
            .field("debug", &self.debug)
            .finish()
    }
}

/// Owned by a proxy; dropping it tells the bridge the proxy is gone.
pub struct ProxyLink {
    wrapper: Arc<ReferenceWrapper>,
    queue: Sender<Arc<ReferenceWrapper>>,
    reclaim: ReclaimPolicy,
}

impl ProxyLink {
    pub(crate) fn new(
        wrapper: Arc<ReferenceWrapper>,
        queue: Sender<Arc<ReferenceWrapper>>,
        reclaim: ReclaimPolicy,
    ) -> Self {
        Self {
            wrapper,
            queue,
            reclaim,
        }
    }

    pub fn handle(&self) -> Result<NativeHandle> {
        self.wrapper.handle()
    }

    /// Explicit release. Releasing twice is a caller bug.
    pub fn release(&self) -> Result<()> {
        if self.wrapper.delete() {
            Ok(())
        } else {
            Err(BridgeError::AlreadyReleased(self.wrapper.to_string()))
        }
    }

    pub fn is_released(&self) -> bool {
        self.wrapper.is_deleted()
    }

    pub fn wrapper(&self) -> &Arc<ReferenceWrapper> {
        &self.wrapper
    }
}

impl Drop for ProxyLink {
    fn drop(&mut self) {
        if self.wrapper.is_deleted() {
            return;
        }
        match self.reclaim {
            ReclaimPolicy::Deferred => {
                if let Err(unsent) = self.queue.send(Arc::clone(&self.wrapper)) {
                    // Bridge already gone; nobody will drain.
                    unsent.0.delete();
                }
            }
            ReclaimPolicy::OnDrop => {
                self.wrapper.delete();
            }
        }
    }
}

impl fmt::Debug for ProxyLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyLink")
            .field("wrapper", &self.wrapper)
            .field("reclaim", &self.reclaim)
            .finish()
    }
}
