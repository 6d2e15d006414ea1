//! The reference heap: every live [`ReferenceWrapper`], in a growable slot
//! table.
//!
//! Registration is the hottest path in the bridge, so the slot table sits
//! behind two locks:
//!
//! - a spin flag ([`SpinLock`]) taken with a single CAS, enough to claim the
//!   next free slot when one exists;
//! - a coarse mutex serializing everything that may resize the table
//!   (overflow, sweep, flush, diagnostics).
//!
//! Lock order is always coarse, then spin. The spin flag is never held
//! while waiting for the coarse mutex.

use crate::queue::ReclamationQueue;
use crate::reference::ReferenceWrapper;
use crate::spin::{SpinGuard, SpinLock};
use parking_lot::{Mutex, MutexGuard};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_core::config::{
    validate_expand_increment, validate_minimum, validate_ratio, validate_shrink_factor,
};
use tether_core::{BridgeError, Result, TrackerConfig};
use tracing::{debug, info};

/// Resize policy, in fractions rather than the percentages of
/// [`TrackerConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapTuning {
    pub minimum: usize,
    pub expand_increment: f64,
    pub shrink_factor: f64,
    pub max_free_ratio: f64,
    pub min_free_ratio: f64,
}

impl HeapTuning {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            minimum: config.minimum_references_to_cache,
            expand_increment: config.expand_increment / 100.0,
            shrink_factor: config.shrink_factor / 100.0,
            max_free_ratio: config.max_free_ratio / 100.0,
            min_free_ratio: config.min_free_ratio / 100.0,
        }
    }

    /// Capacity the table should have after a sweep left `live` survivors
    /// in a table of `capacity` slots.
    ///
    /// Always leaves room for at least one more wrapper and never goes
    /// below the minimum.
    pub fn next_capacity(&self, capacity: usize, live: usize) -> usize {
        let free = capacity.saturating_sub(live) as f64;
        let len = capacity as f64;
        let resized = if free > len * self.max_free_ratio {
            (len * (1.0 - self.expand_increment * self.shrink_factor)) as usize
        } else if free <= len * self.min_free_ratio {
            ((len * (1.0 + self.expand_increment)) as usize).max(capacity + 1)
        } else {
            capacity
        };
        resized.max(self.minimum).max(live + 1)
    }
}

impl Default for HeapTuning {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

struct SlotTable {
    slots: Vec<Option<Arc<ReferenceWrapper>>>,
    cursor: usize,
}

impl SlotTable {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            cursor: 0,
        }
    }

    #[inline]
    fn has_room(&self) -> bool {
        self.cursor < self.slots.len()
    }

    #[inline]
    fn push(&mut self, wrapper: Arc<ReferenceWrapper>) {
        debug_assert!(self.has_room());
        self.slots[self.cursor] = Some(wrapper);
        self.cursor += 1;
    }

    fn occupied(&self) -> impl Iterator<Item = (usize, &Arc<ReferenceWrapper>)> {
        self.slots[..self.cursor]
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|w| (i, w)))
    }
}

/// Both locks, released spin flag first.
struct Exclusive<'a> {
    table: SpinGuard<'a, SlotTable>,
    _coarse: MutexGuard<'a, ()>,
}

/// Counters for heap maintenance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub sweeps: u64,
    pub grows: u64,
    pub shrinks: u64,
}

pub struct ReferenceHeap {
    table: SpinLock<SlotTable>,
    coarse: Mutex<()>,
    tuning: Mutex<HeapTuning>,
    queue: Arc<ReclamationQueue>,
    sweeps: AtomicU64,
    grows: AtomicU64,
    shrinks: AtomicU64,
}

impl ReferenceHeap {
    pub fn new(queue: Arc<ReclamationQueue>, config: &TrackerConfig) -> Result<Self> {
        config.validate()?;
        let tuning = HeapTuning::from_config(config);
        Ok(Self {
            table: SpinLock::new(SlotTable::with_capacity(tuning.minimum)),
            coarse: Mutex::new(()),
            tuning: Mutex::new(tuning),
            queue,
            sweeps: AtomicU64::new(0),
            grows: AtomicU64::new(0),
            shrinks: AtomicU64::new(0),
        })
    }

    fn exclusive(&self) -> Exclusive<'_> {
        let coarse = self.coarse.try_lock().unwrap_or_else(|| self.coarse.lock());
        Exclusive {
            table: self.table.lock(),
            _coarse: coarse,
        }
    }

    /// Track a wrapper.
    ///
    /// Returns `true` if the slot was claimed on the lock-free fast path,
    /// `false` if the table was full and the coarse path ran (possibly
    /// sweeping and resizing).
    pub fn add_reference(&self, wrapper: Arc<ReferenceWrapper>) -> bool {
        if let Some(mut table) = self.table.try_lock() {
            if table.has_room() {
                table.push(wrapper);
                return true;
            }
        }

        let mut guard = self.exclusive();
        if !guard.table.has_room() {
            self.sweep_locked(&mut guard.table);
        }
        guard.table.push(wrapper);
        false
    }

    /// Drop deleted wrappers, compact survivors to the front and resize.
    /// Returns the survivor count.
    ///
    /// O(capacity); not for the hot path.
    pub fn sweep_and_collect(&self) -> usize {
        let mut guard = self.exclusive();
        self.sweep_locked(&mut guard.table)
    }

    fn sweep_locked(&self, table: &mut SlotTable) -> usize {
        let capacity = table.slots.len();
        let mut survivors: Vec<Option<Arc<ReferenceWrapper>>> = table
            .slots
            .drain(..)
            .flatten()
            .filter(|w| !w.is_deleted())
            .map(Some)
            .collect();
        let live = survivors.len();

        let tuning = *self.tuning.lock();
        let resized = tuning.next_capacity(capacity, live);
        survivors.resize(resized, None);
        survivors.shrink_to_fit();

        table.slots = survivors;
        table.cursor = live;

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        if resized > capacity {
            self.grows.fetch_add(1, Ordering::Relaxed);
            debug!("Reference heap grew {} -> {} ({} live)", capacity, resized, live);
        } else if resized < capacity {
            self.shrinks.fetch_add(1, Ordering::Relaxed);
            debug!("Reference heap shrank {} -> {} ({} live)", capacity, resized, live);
        }
        live
    }

    /// Delete every wrapper whose proxy has been reported unreachable.
    ///
    /// Needs neither lock: queued wrappers are no longer reachable from
    /// any proxy.
    pub fn gc_internal(&self) -> usize {
        self.queue.drain()
    }

    /// [`gc_internal`](Self::gc_internal), optionally followed by a sweep.
    pub fn gc(&self, do_sweep: bool) -> usize {
        let released = self.gc_internal();
        if do_sweep {
            self.sweep_and_collect();
        }
        released
    }

    /// Delete every tracked wrapper and reset to the minimum capacity.
    ///
    /// Any proxy still alive is left pointing at a released handle; use
    /// only at teardown. Returns how many wrappers this call released.
    pub fn flush(&self) -> usize {
        let mut guard = self.exclusive();
        self.sweep_locked(&mut guard.table);
        let deleted = guard
            .table
            .occupied()
            .filter(|(_, wrapper)| wrapper.delete())
            .count();
        self.sweep_locked(&mut guard.table);

        let minimum = self.tuning.lock().minimum;
        *guard.table = SlotTable::with_capacity(minimum);
        info!("Reference heap flushed ({} wrappers deleted)", deleted);
        deleted
    }

    /// Tracked wrappers that have not been deleted.
    pub fn pinned_object_count(&self) -> usize {
        let guard = self.exclusive();
        guard
            .table
            .occupied()
            .filter(|(_, w)| !w.is_deleted())
            .count()
    }

    /// One line per occupied slot. Also emitted at debug level.
    pub fn dump_live_references(&self) -> String {
        let guard = self.exclusive();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "ReferenceHeap[capacity={};cursor={}]",
            guard.table.slots.len(),
            guard.table.cursor
        );
        for (slot, wrapper) in guard.table.occupied() {
            debug!("[{}] {}", slot, wrapper);
            let _ = writeln!(out, "[{}] {}", slot, wrapper);
        }
        out
    }

    pub fn capacity(&self) -> usize {
        self.exclusive().table.slots.len()
    }

    /// Slots claimed since the last sweep, deleted or not.
    pub fn len(&self) -> usize {
        self.exclusive().table.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            grows: self.grows.load(Ordering::Relaxed),
            shrinks: self.shrinks.load(Ordering::Relaxed),
        }
    }

    pub fn tuning(&self) -> HeapTuning {
        *self.tuning.lock()
    }

    /// Apply a whole tracker configuration at once. Capacity follows on
    /// the next sweep.
    pub fn configure(&self, config: &TrackerConfig) -> Result<()> {
        config.validate()?;
        *self.tuning.lock() = HeapTuning::from_config(config);
        Ok(())
    }

    pub fn minimum_references_to_cache(&self) -> usize {
        self.tuning.lock().minimum
    }

    pub fn set_minimum_references_to_cache(&self, minimum: usize) -> Result<()> {
        validate_minimum(minimum)?;
        self.tuning.lock().minimum = minimum;
        Ok(())
    }

    /// Growth step, in percent.
    pub fn expand_increment(&self) -> f64 {
        self.tuning.lock().expand_increment * 100.0
    }

    pub fn set_expand_increment(&self, percent: f64) -> Result<()> {
        validate_expand_increment(percent)?;
        self.tuning.lock().expand_increment = percent / 100.0;
        Ok(())
    }

    /// Share of the growth step used when shrinking, in percent.
    pub fn shrink_factor(&self) -> f64 {
        self.tuning.lock().shrink_factor * 100.0
    }

    pub fn set_shrink_factor(&self, percent: f64) -> Result<()> {
        validate_shrink_factor(percent)?;
        self.tuning.lock().shrink_factor = percent / 100.0;
        Ok(())
    }

    pub fn max_free_ratio(&self) -> f64 {
        self.tuning.lock().max_free_ratio * 100.0
    }

    pub fn set_max_free_ratio(&self, percent: f64) -> Result<()> {
        validate_ratio("max_free_ratio", percent)?;
        let mut tuning = self.tuning.lock();
        if percent < tuning.min_free_ratio * 100.0 {
            return Err(BridgeError::InvalidConfig(format!(
                "max_free_ratio {percent} is below min_free_ratio"
            )));
        }
        tuning.max_free_ratio = percent / 100.0;
        Ok(())
    }

    pub fn min_free_ratio(&self) -> f64 {
        self.tuning.lock().min_free_ratio * 100.0
    }

    pub fn set_min_free_ratio(&self, percent: f64) -> Result<()> {
        validate_ratio("min_free_ratio", percent)?;
        let mut tuning = self.tuning.lock();
        if percent > tuning.max_free_ratio * 100.0 {
            return Err(BridgeError::InvalidConfig(format!(
                "min_free_ratio {percent} is above max_free_ratio"
            )));
        }
        tuning.min_free_ratio = percent / 100.0;
        Ok(())
    }
}

impl std::fmt::Debug for ReferenceHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceHeap")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
