//! Atomic scheduler counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use tessera_core::error::{EngineError, Result};

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub tasks_submitted: AtomicU64,
    /// Tasks handed back complete (sync return or `Done` poll).
    pub tasks_completed: AtomicU64,
    /// Tasks handed back incomplete (sync error or `Failed` poll).
    pub tasks_failed: AtomicU64,
    pub sub_inferences_created: AtomicU64,
    /// Sub-inferences whose result reached post-processing.
    pub sub_inferences_completed: AtomicU64,
    /// Sub-inferences discarded by dispatch failures, retraction or teardown.
    pub sub_inferences_dropped: AtomicU64,
    pub batches_dispatched: AtomicU64,
    pub rows_dispatched: AtomicU64,
    pub dispatch_failures: AtomicU64,
    /// Cumulative dispatch → completion time in microseconds.
    pub inference_total_us: AtomicU64,
    pub peak_inference_us: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_inference(&self, elapsed_us: u64) {
        self.inference_total_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
        self.peak_inference_us
            .fetch_max(elapsed_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self, peak_busy_slots: usize) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Acquire);
        let batches = load(&self.batches_dispatched);
        MetricsSnapshot {
            tasks_submitted: load(&self.tasks_submitted),
            tasks_completed: load(&self.tasks_completed),
            tasks_failed: load(&self.tasks_failed),
            sub_inferences_created: load(&self.sub_inferences_created),
            sub_inferences_completed: load(&self.sub_inferences_completed),
            sub_inferences_dropped: load(&self.sub_inferences_dropped),
            batches_dispatched: batches,
            rows_dispatched: load(&self.rows_dispatched),
            dispatch_failures: load(&self.dispatch_failures),
            avg_inference_us: if batches > 0 {
                load(&self.inference_total_us) / batches
            } else {
                0
            },
            peak_inference_us: load(&self.peak_inference_us),
            peak_busy_slots: peak_busy_slots as u64,
        }
    }
}

/// Point-in-time copy of [`SchedulerMetrics`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub sub_inferences_created: u64,
    pub sub_inferences_completed: u64,
    pub sub_inferences_dropped: u64,
    pub batches_dispatched: u64,
    pub rows_dispatched: u64,
    pub dispatch_failures: u64,
    pub avg_inference_us: u64,
    pub peak_inference_us: u64,
    pub peak_busy_slots: u64,
}

impl MetricsSnapshot {
    /// Sub-inferences neither completed nor dropped.
    pub fn sub_inferences_live(&self) -> u64 {
        self.sub_inferences_created
            .saturating_sub(self.sub_inferences_completed + self.sub_inferences_dropped)
    }

    /// Every created sub-inference is completed, dropped, or one of `live`.
    pub fn check_conservation(&self, live: usize) -> Result<()> {
        let accounted = self.sub_inferences_completed + self.sub_inferences_dropped + live as u64;
        if accounted == self.sub_inferences_created {
            return Ok(());
        }
        Err(EngineError::InvariantViolation(format!(
            "sub-inference conservation: created={} completed={} dropped={} live={live}",
            self.sub_inferences_created, self.sub_inferences_completed, self.sub_inferences_dropped
        )))
    }

    pub fn report(&self, model: &str) {
        info!(
            model,
            tasks_submitted = self.tasks_submitted,
            tasks_completed = self.tasks_completed,
            tasks_failed = self.tasks_failed,
            batches = self.batches_dispatched,
            rows = self.rows_dispatched,
            dispatch_failures = self.dispatch_failures,
            avg_inference_us = self.avg_inference_us,
            peak_inference_us = self.peak_inference_us,
            peak_busy_slots = self.peak_busy_slots,
            "Scheduler metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservation_counts_live_items() {
        let m = SchedulerMetrics::new();
        SchedulerMetrics::add(&m.sub_inferences_created, 5);
        SchedulerMetrics::add(&m.sub_inferences_completed, 3);
        SchedulerMetrics::add(&m.sub_inferences_dropped, 1);
        let snap = m.snapshot(0);
        assert_eq!(snap.sub_inferences_live(), 1);
        snap.check_conservation(1).unwrap();
        let err = snap.check_conservation(0).expect_err("one item unaccounted");
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn average_latency_is_per_batch() {
        let m = SchedulerMetrics::new();
        SchedulerMetrics::add(&m.batches_dispatched, 2);
        m.record_inference(100);
        m.record_inference(300);
        let snap = m.snapshot(2);
        assert_eq!(snap.avg_inference_us, 200);
        assert_eq!(snap.peak_inference_us, 300);
        assert_eq!(snap.peak_busy_slots, 2);
    }
}
