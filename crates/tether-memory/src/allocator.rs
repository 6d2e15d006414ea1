//! Retrying allocator for large blocks.
//!
//! Allocation failures are frequently transient: proxies that are already
//! unreachable still pin native memory until the reclamation queue is
//! drained. The allocator therefore retries with an escalating backoff,
//! draining the queue before every retry, and only gives up after the
//! configured number of attempts. On the terminal failure it pulls the
//! [`Parachute`] so the caller has headroom to unwind.
//!
//! Call sites and their failure contract:
//! - [`MemoryAllocator::allocate`] and [`MemoryAllocator::allocate_cancellable`]
//!   always surface exhaustion as [`BridgeError::OutOfMemory`].
//! - [`MemoryAllocator::try_allocate`] is the only call site allowed to turn
//!   exhaustion into `None`; it exists for native callbacks that expect a
//!   null pointer on failure.

use crate::parachute::Parachute;
use crate::queue::ReclamationQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_core::{BridgeError, MemoryModel, ModelRegistry, Result, RetryPolicy};
use tracing::{debug, warn};

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one outstanding allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Source of raw bytes. `None` means the store is exhausted.
pub trait BackingStore: Send + Sync {
    fn try_allocate(&self, size: usize) -> Option<Box<[u8]>>;
}

/// Process heap, using fallible reservation so exhaustion is observable
/// instead of aborting.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStore;

impl BackingStore for HeapStore {
    fn try_allocate(&self, size: usize) -> Option<Box<[u8]>> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).ok()?;
        // Touch every page so the memory is committed now, not on first write.
        bytes.resize(size, 0);
        Some(bytes.into_boxed_slice())
    }
}

/// Reports a block's size as collector pressure for as long as it lives.
struct PressureGuard {
    counter: Arc<AtomicI64>,
    amount: i64,
}

impl PressureGuard {
    fn new(counter: Arc<AtomicI64>, amount: i64) -> Self {
        counter.fetch_add(amount, Ordering::SeqCst);
        Self { counter, amount }
    }
}

impl Drop for PressureGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.amount, Ordering::SeqCst);
    }
}

/// A block handed out by a [`MemoryAllocator`].
pub struct Block {
    id: BlockId,
    data: Box<[u8]>,
    model: MemoryModel,
    _pressure: Option<PressureGuard>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Model active when the block was allocated.
    pub fn model(&self) -> MemoryModel {
        self.model
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("model", &self.model)
            .finish()
    }
}

struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cancels an allocation that is sleeping between retries.
#[derive(Clone)]
pub struct RetryCancel(Arc<CancelState>);

impl RetryCancel {
    pub fn new() -> Self {
        Self(Arc::new(CancelState {
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        }))
    }

    /// Signal cancellation and wake any sleeping retry.
    pub fn cancel(&self) {
        *self.0.cancelled.lock() = true;
        self.0.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.cancelled.lock()
    }

    /// Sleep up to `timeout`; returns true if cancelled.
    fn wait(&self, timeout: Duration) -> bool {
        let mut cancelled = self.0.cancelled.lock();
        if !*cancelled {
            self.0.wake.wait_for(&mut cancelled, timeout);
        }
        *cancelled
    }
}

impl Default for RetryCancel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RetryCancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetryCancel")
            .field(&self.is_cancelled())
            .finish()
    }
}

/// Allocator for large blocks with retry, backoff and an OOM reserve.
pub struct MemoryAllocator {
    store: Arc<dyn BackingStore>,
    outstanding: Mutex<HashMap<BlockId, usize>>,
    parachute: Parachute,
    queue: Weak<ReclamationQueue>,
    models: Arc<ModelRegistry>,
    retry: RetryPolicy,
    pressure: Arc<AtomicI64>,
}

impl MemoryAllocator {
    /// The allocator only borrows the queue: wrappers queued after the
    /// owning bridge is gone must not keep it alive through this handle.
    pub fn new(
        queue: &Arc<ReclamationQueue>,
        models: Arc<ModelRegistry>,
        retry: RetryPolicy,
        parachute_bytes: usize,
    ) -> Self {
        Self {
            store: Arc::new(HeapStore),
            outstanding: Mutex::new(HashMap::new()),
            parachute: Parachute::new(parachute_bytes),
            queue: Arc::downgrade(queue),
            models,
            retry,
            pressure: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Replace the backing store.
    pub fn with_store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = store;
        self
    }

    /// Allocate `size` bytes, surfacing exhaustion as an error.
    pub fn allocate(&self, size: usize) -> Result<Block> {
        self.allocate_inner(size, None)
    }

    /// Like [`allocate`](Self::allocate), but the backoff sleeps wake
    /// immediately when `cancel` fires. A cancelled allocation reports the
    /// exhaustion that caused the retry.
    pub fn allocate_cancellable(&self, size: usize, cancel: &RetryCancel) -> Result<Block> {
        self.allocate_inner(size, Some(cancel))
    }

    /// Null-tolerant allocation for native callbacks.
    pub fn try_allocate(&self, size: usize) -> Option<Block> {
        match self.allocate(size) {
            Ok(block) => Some(block),
            Err(e) => {
                warn!("Allocation of {} bytes failed: {}", size, e);
                None
            }
        }
    }

    fn allocate_inner(&self, size: usize, cancel: Option<&RetryCancel>) -> Result<Block> {
        if size == 0 {
            return Err(BridgeError::InvalidParameter(
                "cannot allocate a zero-sized block".into(),
            ));
        }

        let model = self.models.get();
        if model.hints_collector() {
            self.drain_queue();
        }

        let data = self.with_retries(size, cancel, || self.store.try_allocate(size))?;
        let id = BlockId(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed));
        let previous = self.outstanding.lock().insert(id, size);
        debug_assert!(previous.is_none(), "{id} tracked twice");

        let pressure = model
            .hints_collector()
            .then(|| PressureGuard::new(Arc::clone(&self.pressure), size as i64));

        Ok(Block {
            id,
            data,
            model,
            _pressure: pressure,
        })
    }

    /// Run `attempt` until it yields a value or the retry budget is spent.
    ///
    /// The first retry only yields the scheduler; later retries sleep with
    /// exponential backoff. The reclamation queue is drained before every
    /// retry. On the final failure the parachute is pulled, one more drain
    /// runs, and [`BridgeError::OutOfMemory`] is returned.
    pub fn with_retries<T>(
        &self,
        size: usize,
        cancel: Option<&RetryCancel>,
        mut attempt: impl FnMut() -> Option<T>,
    ) -> Result<T> {
        self.parachute.pack()?;

        let mut attempts = 0u32;
        let mut backoff = self.retry.initial_backoff();
        loop {
            if let Some(value) = attempt() {
                return Ok(value);
            }
            attempts += 1;

            if attempts >= self.retry.max_attempts {
                warn!(
                    "Allocation of {} bytes failed after {} attempts",
                    size, attempts
                );
                self.parachute.pull_cord();
                self.drain_queue();
                return Err(BridgeError::OutOfMemory { size, attempts });
            }

            debug!("Retrying ({}) allocation of {} bytes", attempts, size);
            if attempts <= 1 {
                std::thread::yield_now();
            } else {
                let cancelled = match cancel {
                    Some(cancel) => cancel.wait(backoff),
                    None => {
                        std::thread::sleep(backoff);
                        false
                    }
                };
                if cancelled {
                    warn!("Allocation of {} bytes cancelled during backoff", size);
                    return Err(BridgeError::OutOfMemory { size, attempts });
                }
                backoff = self.retry.next_backoff(backoff);
            }
            self.drain_queue();
        }
    }

    fn drain_queue(&self) -> usize {
        self.queue.upgrade().map_or(0, |queue| queue.drain())
    }

    /// Return a block. Freeing a block this allocator does not track is a
    /// programming error and is reported, never ignored.
    pub fn free(&self, block: Block) -> Result<()> {
        let id = block.id;
        match self.outstanding.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(BridgeError::UnknownBlock(id.0)),
        }
    }

    /// Outstanding allocations as `(id, size)` pairs, sorted by id.
    pub fn outstanding(&self) -> Vec<(BlockId, usize)> {
        let mut blocks: Vec<_> = self
            .outstanding
            .lock()
            .iter()
            .map(|(id, size)| (*id, *size))
            .collect();
        blocks.sort_unstable();
        blocks
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.lock().values().sum()
    }

    /// Bytes currently reported as collector pressure.
    pub fn external_pressure(&self) -> i64 {
        self.pressure.load(Ordering::SeqCst)
    }

    pub fn parachute(&self) -> &Parachute {
        &self.parachute
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

impl fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("outstanding", &self.outstanding_count())
            .field("parachute", &self.parachute)
            .field("pressure", &self.external_pressure())
            .finish()
    }
}
