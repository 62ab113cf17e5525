use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Fire-and-forget counters for the telemetry sink. Shared across the hot
/// path and the background jobs, so plain relaxed atomics.
#[derive(Debug, Default)]
pub struct CreditMetrics {
    reservations: AtomicU64,
    reservations_rejected: AtomicU64,
    finalized: AtomicU64,
    duplicates: AtomicU64,
    stale_fences: AtomicU64,
    budget_exceeded: AtomicU64,
    insufficient_credit: AtomicU64,
    halts_tripped: AtomicU64,
    swept_lots: AtomicU64,
    reconciled_events: AtomicU64,
    finalize_latency_ms_total: AtomicU64,
    last_drift_micros: AtomicI64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreditMetricsSnapshot {
    pub reservations: u64,
    pub reservations_rejected: u64,
    pub finalized: u64,
    pub duplicates: u64,
    pub stale_fences: u64,
    pub budget_exceeded: u64,
    pub insufficient_credit: u64,
    pub halts_tripped: u64,
    pub swept_lots: u64,
    pub reconciled_events: u64,
    pub finalize_latency_ms_total: u64,
    pub last_drift_micros: i64,
}

impl CreditMetrics {
    pub fn record_reservation(&self) {
        self.reservations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reservation_rejected(&self) {
        self.reservations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finalized(&self, latency_ms: u64) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
        self.finalize_latency_ms_total
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_fence(&self) {
        self.stale_fences.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_budget_exceeded(&self) {
        self.budget_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insufficient_credit(&self) {
        self.insufficient_credit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_halt_tripped(&self) {
        self.halts_tripped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swept_lots(&self, count: u64) {
        self.swept_lots.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_reconciled_events(&self, count: u64) {
        self.reconciled_events.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_drift(&self, drift_micros: i64) {
        self.last_drift_micros.store(drift_micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CreditMetricsSnapshot {
        CreditMetricsSnapshot {
            reservations: self.reservations.load(Ordering::Relaxed),
            reservations_rejected: self.reservations_rejected.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale_fences: self.stale_fences.load(Ordering::Relaxed),
            budget_exceeded: self.budget_exceeded.load(Ordering::Relaxed),
            insufficient_credit: self.insufficient_credit.load(Ordering::Relaxed),
            halts_tripped: self.halts_tripped.load(Ordering::Relaxed),
            swept_lots: self.swept_lots.load(Ordering::Relaxed),
            reconciled_events: self.reconciled_events.load(Ordering::Relaxed),
            finalize_latency_ms_total: self.finalize_latency_ms_total.load(Ordering::Relaxed),
            last_drift_micros: self.last_drift_micros.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshot() {
        let metrics = CreditMetrics::default();
        metrics.record_reservation();
        metrics.record_reservation();
        metrics.record_finalized(12);
        metrics.record_finalized(8);
        metrics.record_stale_fence();
        metrics.record_swept_lots(3);
        metrics.record_drift(-42);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.reservations, 2);
        assert_eq!(snapshot.finalized, 2);
        assert_eq!(snapshot.finalize_latency_ms_total, 20);
        assert_eq!(snapshot.stale_fences, 1);
        assert_eq!(snapshot.swept_lots, 3);
        assert_eq!(snapshot.last_drift_micros, -42);
    }
}
