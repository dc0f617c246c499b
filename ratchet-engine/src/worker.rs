//! The continuous SL worker.
//!
//! One dedicated task sweeps every tracked ticket each iteration, invoking
//! the application engine. Iterations are sequential; per-ticket locking
//! would also admit parallelism across disjoint tickets, but the reference
//! cadence of 50 ms makes the simple sweep sufficient.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::apply::SlApplicator;
use crate::shutdown::ShutdownSignal;

/// Run the worker until shutdown. Never holds a lock across iterations.
pub async fn run_sl_worker(applicator: Arc<SlApplicator>, shutdown: ShutdownSignal) {
    let interval = Duration::from_millis(applicator.execution().worker_interval_ms.max(50));
    let budget = Duration::from_millis(applicator.execution().slow_iteration_budget_ms);
    info!(interval_ms = interval.as_millis() as u64, "sl worker started");

    while !shutdown.triggered() {
        let started = Instant::now();
        let tickets = applicator.registry().tickets();
        let mut breakdown: Vec<(u64, u128, &'static str)> = Vec::with_capacity(tickets.len());

        for ticket in tickets {
            if shutdown.triggered() {
                break;
            }
            let t0 = Instant::now();
            let outcome = applicator.update_sl_atomic(ticket).await;
            applicator.metrics().observe_outcome(outcome.label());
            breakdown.push((ticket, t0.elapsed().as_millis(), outcome.label()));
        }

        applicator
            .metrics()
            .set_open_circuits(applicator.open_circuits());
        let elapsed = started.elapsed();
        applicator
            .metrics()
            .set_worker_iteration_ms(elapsed.as_secs_f64() * 1000.0);
        if elapsed > budget {
            applicator.metrics().inc_slow_iteration();
            let detail: Vec<String> = breakdown
                .iter()
                .map(|(ticket, ms, label)| format!("{ticket}={ms}ms:{label}"))
                .collect();
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                breakdown = %detail.join(","),
                "SLOW_ITERATION: worker sweep exceeded its budget"
            );
        }

        if !shutdown.sleep(interval.saturating_sub(elapsed)).await {
            break;
        }
    }

    info!("sl worker drained");
}
