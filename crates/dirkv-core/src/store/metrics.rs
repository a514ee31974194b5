//! Store activity counters for profiling and tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for queueing, conversions and change reconciliation.
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Operations that reserved a queue slot
    pub operations_queued: AtomicU64,

    /// Operations that found a predecessor in their path's queue
    pub queue_waits: AtomicU64,

    /// Directories created on disk by walks
    pub directories_created: AtomicU64,

    /// File nodes converted into directories
    pub conversions: AtomicU64,

    /// Raw filesystem events handed to the reconciler
    pub events_observed: AtomicU64,

    /// File events that did not reach the callback (self-caused or stale)
    pub events_suppressed: AtomicU64,

    /// Change callback invocations
    pub callbacks_fired: AtomicU64,

    /// Reads that failed with an error other than not-found
    pub read_failures: AtomicU64,
}

impl StoreMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_operation_queued(&self) {
        self.operations_queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_wait(&self) {
        self.queue_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_directory_created(&self) {
        self.directories_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_conversion(&self) {
        self.conversions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_observed(&self) {
        self.events_observed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_suppressed(&self) {
        self.events_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_callback_fired(&self) {
        self.callbacks_fired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            operations_queued: self.operations_queued.load(Ordering::Relaxed),
            queue_waits: self.queue_waits.load(Ordering::Relaxed),
            directories_created: self.directories_created.load(Ordering::Relaxed),
            conversions: self.conversions.load(Ordering::Relaxed),
            events_observed: self.events_observed.load(Ordering::Relaxed),
            events_suppressed: self.events_suppressed.load(Ordering::Relaxed),
            callbacks_fired: self.callbacks_fired.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.operations_queued.store(0, Ordering::Relaxed);
        self.queue_waits.store(0, Ordering::Relaxed);
        self.directories_created.store(0, Ordering::Relaxed);
        self.conversions.store(0, Ordering::Relaxed);
        self.events_observed.store(0, Ordering::Relaxed);
        self.events_suppressed.store(0, Ordering::Relaxed);
        self.callbacks_fired.store(0, Ordering::Relaxed);
        self.read_failures.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of store metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    pub operations_queued: u64,
    pub queue_waits: u64,
    pub directories_created: u64,
    pub conversions: u64,
    pub events_observed: u64,
    pub events_suppressed: u64,
    pub callbacks_fired: u64,
    pub read_failures: u64,
}

impl StoreMetricsSnapshot {
    /// Fraction of queued operations that had to wait for a predecessor
    /// (0.0 to 1.0).
    #[allow(clippy::cast_precision_loss)]
    pub fn contention_rate(&self) -> f64 {
        if self.operations_queued == 0 {
            0.0
        } else {
            self.queue_waits as f64 / self.operations_queued as f64
        }
    }
}

impl fmt::Display for StoreMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Queue:")?;
        writeln!(
            f,
            "  Operations: {:>10}  Waits: {:>10} ({:.1}%)",
            self.operations_queued,
            self.queue_waits,
            self.contention_rate() * 100.0
        )?;
        writeln!(f, "Layout:")?;
        writeln!(
            f,
            "  Directories created: {:>10}  Conversions: {:>10}",
            self.directories_created, self.conversions
        )?;
        writeln!(f, "Reconciler:")?;
        writeln!(
            f,
            "  Events: {:>10}  Suppressed: {:>10}  Callbacks: {:>10}",
            self.events_observed, self.events_suppressed, self.callbacks_fired
        )?;
        write!(f, "Read failures: {}", self.read_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = StoreMetrics::new();
        metrics.record_operation_queued();
        metrics.record_operation_queued();
        metrics.record_queue_wait();
        metrics.record_conversion();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations_queued, 2);
        assert_eq!(snapshot.queue_waits, 1);
        assert_eq!(snapshot.conversions, 1);
        assert!((snapshot.contention_rate() - 0.5).abs() < f64::EPSILON);

        metrics.reset();
        assert_eq!(metrics.snapshot(), StoreMetricsSnapshot::default());
        assert!(metrics.snapshot().contention_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_display_mentions_every_section() {
        let text = StoreMetrics::new().snapshot().to_string();
        assert!(text.contains("Queue:"));
        assert!(text.contains("Reconciler:"));
        assert!(text.contains("Read failures: 0"));
    }
}
