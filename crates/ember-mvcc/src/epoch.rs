//! Epoch-based reclamation for unlinked version records.
//!
//! A version unlinked from a chain may still be referenced by a concurrent
//! reader that decoded its arena index from a chain word moments before the
//! unlink. Reclamation therefore goes through an epoch scheme: readers hold
//! an [`EpochGuard`] (a pinned read-side region) across any chain traversal
//! or cross-context inspection, and [`EpochManager::defer_free`] runs a
//! retirement closure only after every thread pinned at retirement time has
//! unpinned — the index can then be recycled with no observer left.
//!
//! The underlying mechanism is `crossbeam-epoch`; this module wraps its
//! pin/unpin in a registry so transaction lifecycle code never touches raw
//! epoch internals and long-held pins get surfaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_epoch::{self as epoch, Guard};
use parking_lot::Mutex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Global reclamation metrics singleton.
pub static GLOBAL_EPOCH_METRICS: EpochMetrics = EpochMetrics::new();

/// Counters for epoch activity. `Relaxed` loads may be stale, never torn.
pub struct EpochMetrics {
    /// Retirement closures deferred.
    pub retirements_deferred_total: AtomicU64,
    /// Read-side pins created.
    pub pins_total: AtomicU64,
    /// Read-side pins dropped.
    pub unpins_total: AtomicU64,
    /// Stale-pin warnings emitted.
    pub stale_pin_warnings_total: AtomicU64,
    /// High-water mark of concurrently pinned guards.
    pub active_pins_high_water: AtomicU64,
}

impl EpochMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            retirements_deferred_total: AtomicU64::new(0),
            pins_total: AtomicU64::new(0),
            unpins_total: AtomicU64::new(0),
            stale_pin_warnings_total: AtomicU64::new(0),
            active_pins_high_water: AtomicU64::new(0),
        }
    }

    fn record_pin(&self, current_active: u64) {
        self.pins_total.fetch_add(1, Ordering::Relaxed);
        loop {
            let prev = self.active_pins_high_water.load(Ordering::Relaxed);
            if current_active <= prev {
                break;
            }
            if self
                .active_pins_high_water
                .compare_exchange_weak(prev, current_active, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    fn record_unpin(&self) {
        self.unpins_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retirement(&self) {
        self.retirements_deferred_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> EpochMetricsSnapshot {
        EpochMetricsSnapshot {
            retirements_deferred_total: self.retirements_deferred_total.load(Ordering::Relaxed),
            pins_total: self.pins_total.load(Ordering::Relaxed),
            unpins_total: self.unpins_total.load(Ordering::Relaxed),
            stale_pin_warnings_total: self.stale_pin_warnings_total.load(Ordering::Relaxed),
            active_pins_high_water: self.active_pins_high_water.load(Ordering::Relaxed),
        }
    }
}

impl Default for EpochMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of [`EpochMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EpochMetricsSnapshot {
    pub retirements_deferred_total: u64,
    pub pins_total: u64,
    pub unpins_total: u64,
    pub stale_pin_warnings_total: u64,
    pub active_pins_high_water: u64,
}

// ---------------------------------------------------------------------------
// EpochManager
// ---------------------------------------------------------------------------

/// Stale-pin detection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalePinConfig {
    /// Pins older than this block reclamation and are reported.
    pub warn_after: Duration,
}

impl Default for StalePinConfig {
    fn default() -> Self {
        Self {
            warn_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PinState {
    pinned_at: Instant,
}

/// Process-wide reclamation coordinator.
///
/// Owns the pin registry; hands out [`EpochGuard`]s and accepts deferred
/// retirements.
#[derive(Debug)]
pub struct EpochManager {
    stale: StalePinConfig,
    next_pin_id: AtomicU64,
    active: Mutex<HashMap<u64, PinState>>,
}

impl EpochManager {
    #[must_use]
    pub fn new(stale: StalePinConfig) -> Self {
        Self {
            stale,
            next_pin_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Enter a read-side region. The region ends when the guard drops.
    #[must_use]
    pub fn enter(self: &Arc<Self>) -> EpochGuard {
        let pinned_at = Instant::now();
        let pin_id = self.next_pin_id.fetch_add(1, Ordering::Relaxed);
        let guard = epoch::pin();
        let active = {
            let mut map = self.active.lock();
            map.insert(pin_id, PinState { pinned_at });
            map.len() as u64
        };
        GLOBAL_EPOCH_METRICS.record_pin(active);
        tracing::trace!(target: "ember_mvcc::epoch", pin_id, active, "epoch pinned");
        EpochGuard {
            manager: Arc::clone(self),
            pin_id,
            pinned_at,
            guard,
        }
    }

    /// Defer a retirement closure until no pinned reader can observe the
    /// retired object.
    pub fn defer_free<F>(&self, retire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        GLOBAL_EPOCH_METRICS.record_retirement();
        let guard = epoch::pin();
        guard.defer(retire);
        guard.flush();
    }

    /// Number of currently pinned guards.
    #[must_use]
    pub fn active_pins(&self) -> usize {
        self.active.lock().len()
    }

    /// Report pins older than the stale threshold. Returns how many were
    /// reported.
    pub fn warn_on_stale_pins(&self) -> usize {
        let now = Instant::now();
        let mut warned = 0_usize;
        for (&pin_id, state) in self.active.lock().iter() {
            let pinned_for = now.saturating_duration_since(state.pinned_at);
            if pinned_for >= self.stale.warn_after {
                tracing::warn!(
                    target: "ember_mvcc::epoch",
                    pin_id,
                    pinned_for_ms = pinned_for.as_millis(),
                    "stale epoch pin is blocking version reclamation"
                );
                warned += 1;
            }
        }
        if warned > 0 {
            GLOBAL_EPOCH_METRICS
                .stale_pin_warnings_total
                .fetch_add(warned as u64, Ordering::Relaxed);
        }
        warned
    }

    /// Push deferred retirements toward execution.
    ///
    /// Each round pins and flushes, giving the collector a chance to
    /// advance. With no foreign pins outstanding a few rounds suffice for
    /// everything previously deferred.
    pub fn drain(&self) {
        for _ in 0..64 {
            let guard = epoch::pin();
            guard.flush();
            drop(guard);
            std::thread::yield_now();
        }
        tracing::debug!(
            target: "ember_mvcc::epoch",
            remaining_pins = self.active_pins(),
            "epoch drain pass complete"
        );
    }

    fn unregister(&self, pin_id: u64) -> Option<Duration> {
        self.active
            .lock()
            .remove(&pin_id)
            .map(|state| state.pinned_at.elapsed())
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new(StalePinConfig::default())
    }
}

// ---------------------------------------------------------------------------
// EpochGuard
// ---------------------------------------------------------------------------

/// RAII read-side region.
///
/// A transaction holds one for its whole lifetime; shorter-lived guards
/// cover maintenance traversals (GC pruning). Holding a guard pins the
/// current thread's epoch, so chain words decoded while it is live always
/// resolve to the records they named.
#[derive(Debug)]
pub struct EpochGuard {
    manager: Arc<EpochManager>,
    pin_id: u64,
    pinned_at: Instant,
    guard: Guard,
}

impl EpochGuard {
    /// Stable ID for diagnostics.
    #[must_use]
    pub const fn pin_id(&self) -> u64 {
        self.pin_id
    }

    /// Elapsed pin duration.
    #[must_use]
    pub fn pinned_for(&self) -> Duration {
        self.pinned_at.elapsed()
    }

    /// Defer a retirement through this guard's pin.
    pub fn defer_free<F>(&self, retire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        GLOBAL_EPOCH_METRICS.record_retirement();
        self.guard.defer(retire);
    }

    /// Flush this thread's local deferred queue toward execution.
    pub fn flush(&self) {
        self.guard.flush();
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        GLOBAL_EPOCH_METRICS.record_unpin();
        let pinned_for = self
            .manager
            .unregister(self.pin_id)
            .unwrap_or_else(|| self.pinned_at.elapsed());
        tracing::trace!(
            target: "ember_mvcc::epoch",
            pin_id = self.pin_id,
            pinned_for_us = pinned_for.as_micros(),
            "epoch unpinned"
        );
    }
}
