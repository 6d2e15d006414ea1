//! Reclamation queue: wrappers whose proxies became unreachable.
//!
//! Producers are proxy links being dropped on any thread; consumers are
//! opportunistic drains ([`ReclamationQueue::drain`]) and the background
//! collector. The channel is MPMC, so both kinds of consumer can run at
//! once and each wrapper is handed to exactly one of them.

use crate::reference::ReferenceWrapper;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

pub struct ReclamationQueue {
    sender: Sender<Arc<ReferenceWrapper>>,
    receiver: Receiver<Arc<ReferenceWrapper>>,
    drain_passes: AtomicU64,
    reclaimed: AtomicU64,
}

impl ReclamationQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            drain_passes: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Report a wrapper whose proxy is gone.
    pub fn enqueue(&self, wrapper: Arc<ReferenceWrapper>) {
        // The queue owns its receiver, so the send cannot fail while `self` lives.
        let _ = self.sender.send(wrapper);
    }

    pub(crate) fn sender(&self) -> Sender<Arc<ReferenceWrapper>> {
        self.sender.clone()
    }

    pub(crate) fn receiver(&self) -> Receiver<Arc<ReferenceWrapper>> {
        self.receiver.clone()
    }

    /// Delete every queued wrapper without blocking.
    ///
    /// Returns how many native references this pass released.
    pub fn drain(&self) -> usize {
        self.drain_passes.fetch_add(1, Ordering::SeqCst);
        let mut released = 0;
        while let Ok(wrapper) = self.receiver.try_recv() {
            if self.reclaim(&wrapper) {
                released += 1;
            }
        }
        if released > 0 {
            trace!("Reclaimed {} unreachable references", released);
        }
        released
    }

    /// Delete one dequeued wrapper and account for it.
    pub(crate) fn reclaim(&self, wrapper: &ReferenceWrapper) -> bool {
        let released = wrapper.delete();
        if released {
            self.reclaimed.fetch_add(1, Ordering::SeqCst);
        }
        released
    }

    /// Wrappers waiting for a drain.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Number of times [`drain`](Self::drain) has run.
    pub fn drain_passes(&self) -> u64 {
        self.drain_passes.load(Ordering::SeqCst)
    }

    /// Wrappers released through this queue so far.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::SeqCst)
    }
}

impl Default for ReclamationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReclamationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclamationQueue")
            .field("pending", &self.pending())
            .field("drain_passes", &self.drain_passes())
            .field("reclaimed", &self.reclaimed())
            .finish()
    }
}
