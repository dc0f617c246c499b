//! Prometheus metrics collected by the SL engine.

use chrono::Utc;
use prometheus::{Counter, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use ratchet_journal::MetricsSnapshotRecord;

/// Typed counters and gauges registered against a shared registry.
pub struct EngineMetrics {
    registry: Registry,
    update_attempts: IntCounter,
    update_successes: IntCounter,
    update_failures: IntCounter,
    outcomes: IntCounterVec,
    emergency_invocations: IntCounter,
    rate_limited_skips: IntCounter,
    lock_timeouts: IntCounter,
    stale_lock_releases: IntCounter,
    verifications_ok: IntCounter,
    verification_failures: IntCounter,
    slow_iterations: IntCounter,
    entries_total: IntCounter,
    entry_rejections: IntCounterVec,
    closures: IntCounterVec,
    activation_ms_sum: Counter,
    activations: IntCounter,
    apply_duration_ms: Gauge,
    worker_iteration_ms: Gauge,
    open_positions: IntGauge,
    open_circuits: IntGauge,
}

impl EngineMetrics {
    #[allow(clippy::missing_panics_doc)]
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();
        let update_attempts =
            IntCounter::new("ratchet_sl_update_attempts_total", "SL update attempts").unwrap();
        let update_successes =
            IntCounter::new("ratchet_sl_update_successes_total", "Successful SL updates").unwrap();
        let update_failures =
            IntCounter::new("ratchet_sl_update_failures_total", "Failed SL updates").unwrap();
        let outcomes = IntCounterVec::new(
            Opts::new("ratchet_sl_outcomes_total", "update_sl_atomic outcomes"),
            &["outcome"],
        )
        .unwrap();
        let emergency_invocations = IntCounter::new(
            "ratchet_emergency_invocations_total",
            "Lock-free strict-loss applies",
        )
        .unwrap();
        let rate_limited_skips = IntCounter::new(
            "ratchet_rate_limited_skips_total",
            "Updates skipped because the RPC bucket was empty",
        )
        .unwrap();
        let lock_timeouts = IntCounter::new(
            "ratchet_lock_timeouts_total",
            "Ticket lock acquisitions that timed out",
        )
        .unwrap();
        let stale_lock_releases = IntCounter::new(
            "ratchet_stale_lock_releases_total",
            "Locks force-released by the watchdog",
        )
        .unwrap();
        let verifications_ok = IntCounter::new(
            "ratchet_sl_verifications_ok_total",
            "Applied SL values observed at the broker",
        )
        .unwrap();
        let verification_failures = IntCounter::new(
            "ratchet_sl_verification_failures_total",
            "Applied SL values not observed at the broker",
        )
        .unwrap();
        let slow_iterations = IntCounter::new(
            "ratchet_worker_slow_iterations_total",
            "Worker iterations exceeding the time budget",
        )
        .unwrap();
        let entries_total =
            IntCounter::new("ratchet_entries_total", "Positions opened by the entry engine")
                .unwrap();
        let entry_rejections = IntCounterVec::new(
            Opts::new("ratchet_entry_rejections_total", "Scan candidates rejected by gates"),
            &["gate"],
        )
        .unwrap();
        let closures = IntCounterVec::new(
            Opts::new("ratchet_closures_total", "Position closures by reason"),
            &["reason"],
        )
        .unwrap();
        let activation_ms_sum = Counter::new(
            "ratchet_sweet_spot_activation_ms_sum",
            "Sum of sweet-spot activation latencies",
        )
        .unwrap();
        let activations = IntCounter::new(
            "ratchet_sweet_spot_activations_total",
            "Sweet-spot locks applied",
        )
        .unwrap();
        let apply_duration_ms =
            Gauge::new("ratchet_sl_apply_duration_ms", "Duration of the last apply").unwrap();
        let worker_iteration_ms = Gauge::new(
            "ratchet_worker_iteration_ms",
            "Duration of the last worker iteration",
        )
        .unwrap();
        let open_positions =
            IntGauge::new("ratchet_open_positions", "Positions currently tracked").unwrap();
        let open_circuits =
            IntGauge::new("ratchet_open_circuits", "Tickets with an open circuit").unwrap();

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(update_attempts.clone()),
            Box::new(update_successes.clone()),
            Box::new(update_failures.clone()),
            Box::new(outcomes.clone()),
            Box::new(emergency_invocations.clone()),
            Box::new(rate_limited_skips.clone()),
            Box::new(lock_timeouts.clone()),
            Box::new(stale_lock_releases.clone()),
            Box::new(verifications_ok.clone()),
            Box::new(verification_failures.clone()),
            Box::new(slow_iterations.clone()),
            Box::new(entries_total.clone()),
            Box::new(entry_rejections.clone()),
            Box::new(closures.clone()),
            Box::new(activation_ms_sum.clone()),
            Box::new(activations.clone()),
            Box::new(apply_duration_ms.clone()),
            Box::new(worker_iteration_ms.clone()),
            Box::new(open_positions.clone()),
            Box::new(open_circuits.clone()),
        ];
        for collector in collectors {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            update_attempts,
            update_successes,
            update_failures,
            outcomes,
            emergency_invocations,
            rate_limited_skips,
            lock_timeouts,
            stale_lock_releases,
            verifications_ok,
            verification_failures,
            slow_iterations,
            entries_total,
            entry_rejections,
            closures,
            activation_ms_sum,
            activations,
            apply_duration_ms,
            worker_iteration_ms,
            open_positions,
            open_circuits,
        }
    }

    #[must_use]
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn inc_attempt(&self) {
        self.update_attempts.inc();
    }

    pub fn inc_success(&self, duration_ms: f64) {
        self.update_successes.inc();
        self.apply_duration_ms.set(duration_ms);
    }

    pub fn inc_failure(&self) {
        self.update_failures.inc();
    }

    pub fn observe_outcome(&self, outcome: &str) {
        self.outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn inc_emergency(&self) {
        self.emergency_invocations.inc();
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited_skips.inc();
    }

    pub fn inc_lock_timeout(&self) {
        self.lock_timeouts.inc();
    }

    pub fn inc_stale_release(&self) {
        self.stale_lock_releases.inc();
    }

    pub fn inc_verification_ok(&self) {
        self.verifications_ok.inc();
    }

    pub fn inc_verification_failure(&self) {
        self.verification_failures.inc();
    }

    pub fn inc_slow_iteration(&self) {
        self.slow_iterations.inc();
    }

    pub fn inc_entry(&self) {
        self.entries_total.inc();
    }

    pub fn inc_entry_rejection(&self, gate: &str) {
        self.entry_rejections.with_label_values(&[gate]).inc();
    }

    pub fn inc_closure(&self, reason: &str) {
        self.closures.with_label_values(&[reason]).inc();
    }

    pub fn observe_activation(&self, millis: f64) {
        self.activations.inc();
        self.activation_ms_sum.inc_by(millis.max(0.0));
    }

    pub fn set_worker_iteration_ms(&self, millis: f64) {
        self.worker_iteration_ms.set(millis);
    }

    pub fn set_open_positions(&self, count: usize) {
        self.open_positions.set(count as i64);
    }

    pub fn set_open_circuits(&self, count: usize) {
        self.open_circuits.set(count as i64);
    }

    /// Aggregate view published to the journal every snapshot interval.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshotRecord {
        let attempts = self.update_attempts.get();
        let successes = self.update_successes.get();
        let failures = self.update_failures.get();
        let activations = self.activations.get();
        let success_rate = if attempts == 0 {
            1.0
        } else {
            successes as f64 / attempts as f64
        };
        let lock_contention_rate = if attempts == 0 {
            0.0
        } else {
            self.lock_timeouts.get() as f64 / attempts as f64
        };
        let mean_activation_ms = if activations == 0 {
            0.0
        } else {
            self.activation_ms_sum.get() / activations as f64
        };
        MetricsSnapshotRecord {
            timestamp: Utc::now(),
            update_attempts: attempts,
            update_successes: successes,
            update_failures: failures,
            success_rate,
            lock_contention_rate,
            emergency_invocations: self.emergency_invocations.get(),
            rate_limited_skips: self.rate_limited_skips.get(),
            mean_activation_ms,
            open_positions: self.open_positions.get().max(0) as u64,
            open_circuits: self.open_circuits.get().max(0) as u64,
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_computes_rates() {
        let metrics = EngineMetrics::new();
        metrics.inc_attempt();
        metrics.inc_attempt();
        metrics.inc_success(3.0);
        metrics.inc_failure();
        metrics.observe_activation(100.0);
        metrics.observe_activation(300.0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.update_attempts, 2);
        assert!((snapshot.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((snapshot.mean_activation_ms - 200.0).abs() < f64::EPSILON);
    }
}
