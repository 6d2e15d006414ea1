//! Emergency reserve released when allocation retries are exhausted.
//!
//! After a terminal allocation failure the caller still has to unwind:
//! build an error, log it, drop partially constructed state. Each of those
//! may need a little memory. Holding a small reserve that is discarded at
//! the moment of failure leaves that much headroom for the unwinding path.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tether_core::limits::PARACHUTE_NUDGE_BYTES;
use tether_core::{BridgeError, Result};
use tracing::{debug, warn};

const MARKER: &[u8] = b"PARACHUTE!";

pub struct Parachute {
    payload: Mutex<Option<Box<[u8]>>>,
    packed: AtomicBool,
    bytes: usize,
    pulls: AtomicU64,
}

impl Parachute {
    /// An unpacked parachute that will reserve `bytes` on first pack.
    pub fn new(bytes: usize) -> Self {
        Self {
            payload: Mutex::new(None),
            packed: AtomicBool::new(false),
            bytes,
            pulls: AtomicU64::new(0),
        }
    }

    /// Ensure the reserve is held. Idempotent.
    ///
    /// Failing to reserve is itself an out-of-memory condition.
    pub fn pack(&self) -> Result<()> {
        if self.packed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut payload = self.payload.lock();
        if payload.is_some() {
            return Ok(());
        }

        let mut reserve = Vec::new();
        reserve
            .try_reserve_exact(self.bytes)
            .map_err(|_| BridgeError::ParachutePack { bytes: self.bytes })?;
        reserve.resize(self.bytes, 0);
        let marked = MARKER.len().min(self.bytes);
        reserve[..marked].copy_from_slice(&MARKER[..marked]);

        *payload = Some(reserve.into_boxed_slice());
        self.packed.store(true, Ordering::Release);
        debug!("Parachute packed ({} bytes)", self.bytes);
        Ok(())
    }

    /// Discard the reserve, then make one tiny allocation so the freed
    /// space is put back into circulation. Leaves the parachute empty.
    pub fn pull_cord(&self) {
        if !self.packed.load(Ordering::Acquire) {
            return;
        }
        let mut payload = self.payload.lock();
        let Some(reserve) = payload.take() else {
            return;
        };
        self.packed.store(false, Ordering::Release);
        drop(reserve);
        self.pulls.fetch_add(1, Ordering::SeqCst);

        let mut nudge: Vec<u8> = Vec::new();
        if nudge.try_reserve_exact(PARACHUTE_NUDGE_BYTES).is_ok() {
            nudge.resize(PARACHUTE_NUDGE_BYTES, 0);
            nudge[1] = 2;
            std::hint::black_box(&nudge);
        }
        warn!("Parachute pulled: released {} reserved bytes", self.bytes);
    }

    pub fn is_packed(&self) -> bool {
        self.packed.load(Ordering::Acquire)
    }

    /// Reserve size in bytes.
    pub fn size(&self) -> usize {
        self.bytes
    }

    /// How many times the reserve has been released.
    pub fn pulls(&self) -> u64 {
        self.pulls.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Parachute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parachute")
            .field("bytes", &self.bytes)
            .field("packed", &self.is_packed())
            .field("pulls", &self.pulls())
            .finish()
    }
}
