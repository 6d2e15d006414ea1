//! A ready-made proxy: a byte buffer fronting one native object.

use crate::allocator::{Block, MemoryAllocator};
use crate::bridge::MemoryBridge;
use crate::reference::ProxyLink;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::Arc;
use tether_core::{Backing, BridgeError, ExternalRefCount, MemoryModel, NativeHandle, Result};
use tracing::error;

/// Bytes held on the bridge side for managed and direct backings.
struct BufferStorage {
    block: Mutex<Option<Block>>,
    allocator: Arc<MemoryAllocator>,
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        if let Some(block) = self.block.get_mut().take() {
            if let Err(e) = self.allocator.free(block) {
                error!("Failed to return buffer storage: {}", e);
            }
        }
    }
}

pub struct NativeBuffer {
    link: ProxyLink,
    storage: Option<Arc<BufferStorage>>,
    size: usize,
    model: MemoryModel,
}

impl NativeBuffer {
    pub fn handle(&self) -> Result<NativeHandle> {
        self.link.handle()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Model active when the buffer was made.
    pub fn model(&self) -> MemoryModel {
        self.model
    }

    pub fn link(&self) -> &ProxyLink {
        &self.link
    }

    /// Number of proxies sharing the native object.
    pub fn ref_count(&self) -> i64 {
        self.link.wrapper().external_ref_count().get()
    }

    /// Bridge-side bytes, or `None` when the native library owns them.
    ///
    /// Fails once the buffer has been released.
    pub fn bytes(&self) -> Result<Option<MappedMutexGuard<'_, [u8]>>> {
        self.link.handle()?;
        Ok(self.storage.as_ref().and_then(|s| {
            MutexGuard::try_map(s.block.lock(), |b| b.as_mut().map(Block::as_mut_slice)).ok()
        }))
    }

    /// Release this proxy's claim now instead of at drop.
    pub fn release(&self) -> Result<()> {
        self.link.release()
    }

    pub fn is_released(&self) -> bool {
        self.link.is_released()
    }

    /// A second proxy for the same native object, sharing the external
    /// reference count and the bytes.
    pub fn copy_reference(&self, bridge: &MemoryBridge) -> Result<Arc<NativeBuffer>> {
        let handle = self.link.handle()?;
        let external = self.link.wrapper().external_ref_count().clone();
        if external.retain() <= 1 {
            // Raced with the final release.
            let _ = external.release();
            return Err(BridgeError::AlreadyReleased(handle.to_string()));
        }
        let storage = self.storage.clone();
        let (size, model) = (self.size, self.model);
        Ok(Arc::new_cyclic(|weak| NativeBuffer {
            link: bridge.link(handle, weak, true, external),
            storage,
            size,
            model,
        }))
    }
}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("handle", &self.link.handle().ok())
            .field("size", &self.size)
            .field("model", &self.model)
            .finish()
    }
}

impl MemoryBridge {
    /// Make a `size`-byte buffer under the active memory model.
    ///
    /// Managed and direct backings take their bytes from the allocator and
    /// a zero-sized native object; the native backing asks the library for
    /// all `size` bytes. Both paths retry on exhaustion.
    pub fn make_buffer(&self, size: usize) -> Result<Arc<NativeBuffer>> {
        if size == 0 {
            return Err(BridgeError::InvalidParameter(
                "buffer size must be positive".into(),
            ));
        }
        let model = self.memory_model();
        let allocator = self.allocator();

        let (storage, native_size) = match model.backing() {
            // Direct blocks share the allocator's store with managed ones.
            Backing::Managed | Backing::Direct => {
                let block = allocator.allocate(size)?;
                let storage = Arc::new(BufferStorage {
                    block: Mutex::new(Some(block)),
                    allocator: Arc::clone(allocator),
                });
                (Some(storage), 0)
            }
            Backing::Native => {
                if model.hints_collector() {
                    self.heap().gc_internal();
                }
                (None, size)
            }
        };

        let library = self.library();
        let handle = allocator.with_retries(size, None, || library.allocate(native_size))?;

        Ok(Arc::new_cyclic(|weak| NativeBuffer {
            link: self.link(handle, weak, true, ExternalRefCount::new()),
            storage,
            size,
            model,
        }))
    }
}
