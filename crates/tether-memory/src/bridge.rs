//! The bridge facade: one explicitly constructed instance owns the heap,
//! the allocator, the reclamation queue and the background collector.

use crate::allocator::{BackingStore, Block, HeapStore, MemoryAllocator, RetryCancel};
use crate::collector::BackgroundCollector;
use crate::heap::ReferenceHeap;
use crate::native::NativeLibrary;
use crate::queue::ReclamationQueue;
use crate::reference::{ProxyLink, ReferenceWrapper};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tether_core::{
    BridgeConfig, BridgeError, ExternalRefCount, MemoryModel, ModelRegistry, NativeHandle,
    ReclaimPolicy, Result, TrackerConfig,
};
use tracing::{debug, info};

pub struct MemoryBridge {
    library: Arc<dyn NativeLibrary>,
    models: Arc<ModelRegistry>,
    queue: Arc<ReclamationQueue>,
    heap: ReferenceHeap,
    allocator: Arc<MemoryAllocator>,
    collector: BackgroundCollector,
    debugging: AtomicBool,
    reclaim: ReclaimPolicy,
}

impl MemoryBridge {
    pub fn new(library: Arc<dyn NativeLibrary>, config: BridgeConfig) -> Result<Self> {
        Self::with_store(library, config, Arc::new(HeapStore))
    }

    /// Construct with a custom allocator backing store.
    pub fn with_store(
        library: Arc<dyn NativeLibrary>,
        config: BridgeConfig,
        store: Arc<dyn BackingStore>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(ReclamationQueue::new());
        let models = Arc::new(ModelRegistry::new(config.memory_model));
        let allocator = MemoryAllocator::new(
            &queue,
            Arc::clone(&models),
            config.retry.clone(),
            config.parachute_bytes,
        )
        .with_store(store);
        let heap = ReferenceHeap::new(Arc::clone(&queue), &config.tracker)?;

        info!(
            "Memory bridge ready: model={:?}, reclaim={:?}, min_refs={}",
            config.memory_model, config.reclaim, config.tracker.minimum_references_to_cache
        );

        Ok(Self {
            library,
            models,
            collector: BackgroundCollector::new(Arc::clone(&queue)),
            queue,
            heap,
            allocator: Arc::new(allocator),
            debugging: AtomicBool::new(config.tracker.memory_debugging),
            reclaim: config.reclaim,
        })
    }

    /// Start tracking a proxy.
    ///
    /// `external` carries the claim this proxy holds; it is given back
    /// when the returned link is released or dropped.
    pub fn register_proxy<P: Any + Send + Sync>(
        &self,
        handle: NativeHandle,
        proxy: &Weak<P>,
        tracked_resource: bool,
        external: ExternalRefCount,
    ) -> Result<ProxyLink> {
        if external.get() <= 0 {
            return Err(BridgeError::AlreadyReleased(format!(
                "cannot register {handle}: external reference count is {}",
                external.get()
            )));
        }
        Ok(self.link(handle, proxy, tracked_resource, external))
    }

    /// Infallible half of [`register_proxy`](Self::register_proxy), usable
    /// inside `Arc::new_cyclic`.
    pub(crate) fn link<P: Any + Send + Sync>(
        &self,
        handle: NativeHandle,
        proxy: &Weak<P>,
        tracked_resource: bool,
        external: ExternalRefCount,
    ) -> ProxyLink {
        self.heap.gc_internal();

        let wrapper = Arc::new(ReferenceWrapper::new(
            proxy,
            handle,
            tracked_resource,
            external,
            Arc::clone(&self.library),
            &self.allocator,
            self.models.get(),
            self.memory_debugging(),
        ));
        self.heap.add_reference(Arc::clone(&wrapper));
        ProxyLink::new(wrapper, self.queue.sender(), self.reclaim)
    }

    pub fn release_proxy(&self, link: &ProxyLink) -> Result<()> {
        link.release()
    }

    pub fn allocate(&self, size: usize) -> Result<Block> {
        self.allocator.allocate(size)
    }

    pub fn allocate_cancellable(&self, size: usize, cancel: &RetryCancel) -> Result<Block> {
        self.allocator.allocate_cancellable(size, cancel)
    }

    /// Null-tolerant allocation; see [`MemoryAllocator::try_allocate`].
    pub fn try_allocate(&self, size: usize) -> Option<Block> {
        self.allocator.try_allocate(size)
    }

    pub fn free(&self, block: Block) -> Result<()> {
        self.allocator.free(block)
    }

    /// Caller must ensure no allocation is in flight.
    pub fn set_memory_model(&self, model: MemoryModel) -> MemoryModel {
        self.models.set(model)
    }

    pub fn set_memory_model_value(&self, value: i32) -> Result<MemoryModel> {
        self.models.set_native_value(value)
    }

    pub fn memory_model(&self) -> MemoryModel {
        self.models.get()
    }

    /// Release every wrapper whose proxy is gone. Returns how many native
    /// references were released.
    pub fn collect(&self) -> usize {
        self.heap.gc(false)
    }

    pub fn collect_with(&self, do_sweep: bool) -> usize {
        self.heap.gc(do_sweep)
    }

    pub fn start_background_collector(&self) -> Result<()> {
        self.collector.start()
    }

    pub fn stop_background_collector(&self) -> bool {
        self.collector.stop()
    }

    pub fn is_collector_running(&self) -> bool {
        self.collector.is_running()
    }

    pub fn pinned_object_count(&self) -> usize {
        self.heap.pinned_object_count()
    }

    pub fn dump_live_references(&self) -> String {
        self.heap.dump_live_references()
    }

    /// Apply new tuning. Memory debugging affects wrappers created afterwards.
    pub fn configure(&self, config: &TrackerConfig) -> Result<()> {
        self.heap.configure(config)?;
        self.set_memory_debugging(config.memory_debugging);
        Ok(())
    }

    pub fn set_memory_debugging(&self, enabled: bool) {
        if self.debugging.swap(enabled, Ordering::SeqCst) != enabled {
            debug!("Memory debugging {}", if enabled { "on" } else { "off" });
        }
    }

    pub fn memory_debugging(&self) -> bool {
        self.debugging.load(Ordering::SeqCst)
    }

    pub fn reclaim_policy(&self) -> ReclaimPolicy {
        self.reclaim
    }

    /// See [`ReferenceHeap::flush`]. Returns the number of wrappers this
    /// call released.
    pub fn flush(&self) -> usize {
        self.heap.flush()
    }

    /// Stop the collector, drain pending reclamations and flush the heap.
    pub fn shutdown(&self) {
        self.collector.stop();
        let drained = self.heap.gc_internal();
        let flushed = self.heap.flush();
        info!(
            "Memory bridge shut down ({} pending reclamations drained, {} flushed)",
            drained, flushed
        );
    }

    pub fn heap(&self) -> &ReferenceHeap {
        &self.heap
    }

    pub fn queue(&self) -> &Arc<ReclamationQueue> {
        &self.queue
    }

    pub fn allocator(&self) -> &Arc<MemoryAllocator> {
        &self.allocator
    }

    pub fn library(&self) -> &Arc<dyn NativeLibrary> {
        &self.library
    }
}

impl std::fmt::Debug for MemoryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBridge")
            .field("model", &self.memory_model())
            .field("reclaim", &self.reclaim)
            .field("heap", &self.heap)
            .field("queue", &self.queue)
            .field("allocator", &self.allocator)
            .field("collector", &self.collector)
            .finish()
    }
}

impl Drop for MemoryBridge {
    /// Live links outlive the bridge: once the queue is gone their drops
    /// fail to send and release the native object in place. Anything
    /// already queued is released here.
    fn drop(&mut self) {
        self.collector.stop();
        let drained = self.heap.gc_internal();
        debug!("Memory bridge dropped ({} pending reclamations drained)", drained);
    }
}
