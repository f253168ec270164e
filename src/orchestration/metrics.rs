//! # Engine Metrics
//!
//! Lock-free counters maintained by the engine and the [`EngineStatus`]
//! snapshot returned by `BackgroundProcessingEngine::status()`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Monotonic counters for one engine instance
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub(crate) claimed: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    /// Successful steps that left the object pending for a further step
    pub(crate) advanced: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) permanently_failed: AtomicU64,
    pub(crate) claim_errors: AtomicU64,
    pub(crate) unlock_failures: AtomicU64,
    pub(crate) stale_locks_reset: AtomicU64,
}

impl EngineMetrics {
    pub(crate) fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            advanced: self.advanced.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
            claim_errors: self.claim_errors.load(Ordering::Relaxed),
            unlock_failures: self.unlock_failures.load(Ordering::Relaxed),
            stale_locks_reset: self.stale_locks_reset.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub claimed: u64,
    pub succeeded: u64,
    pub advanced: u64,
    pub retried: u64,
    pub permanently_failed: u64,
    pub claim_errors: u64,
    pub unlock_failures: u64,
    pub stale_locks_reset: u64,
}

impl MetricsSnapshot {
    /// Claims whose outcome has been persisted
    pub fn completed_cycles(&self) -> u64 {
        self.succeeded + self.advanced + self.retried + self.permanently_failed
    }
}

/// Engine state as reported by `status()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub engine_id: Uuid,
    pub object_type: String,
    pub lock_owner: String,
    pub running: bool,
    /// Maximum objects held at once: workers plus queue slots
    pub capacity: usize,
    pub queued: usize,
    pub active: usize,
    pub metrics: MetricsSnapshot,
}

impl EngineStatus {
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.active == 0
    }

    /// Fraction of capacity currently in use
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.queued + self.active) as f64 / self.capacity as f64
    }
}
