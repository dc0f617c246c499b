//! Stop-loss lifecycle engine.
//!
//! Everything that moves a protective stop flows through one place:
//! [`SlApplicator::update_sl_atomic`]. The surrounding modules provide the
//! position registry, the per-ticket lock table with its watchdog, the pure
//! target computation, the continuous worker, and broker reconciliation.

mod apply;
mod compute;
mod emergency;
mod locks;
mod metrics;
mod reconcile;
mod registry;
mod shutdown;
mod state;
mod worker;

pub use apply::{ApplicatorDeps, SlApplicator, UpdateOutcome};
pub use compute::{compute_target, Computed, SlDecision};
pub use locks::{LockKind, LockTable, LockTimeout, StaleRelease};
pub use metrics::EngineMetrics;
pub use reconcile::{
    classify_exit, run_lock_watchdog, run_metrics_publisher, run_position_monitor, ClosureSender,
    MonitorDeps,
};
pub use registry::{PositionRegistry, ReconcileReport, SymbolTable};
pub use shutdown::ShutdownSignal;
pub use state::{SlReason, SlState, SlStateView, StateStore};
pub use worker::run_sl_worker;
