//! The SL application engine.
//!
//! [`SlApplicator::update_sl_atomic`] is the single source of truth for SL
//! updates: no other component calls `Broker::modify_sl`. The one sanctioned
//! exception is the emergency path in [`crate::emergency`], which this
//! module hands off to when a losing position cannot take its lock.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ratchet_broker::{Broker, ModifyOutcome, RejectReason, RpcLimiter};
use ratchet_config::{ExecutionConfig, ProfitLockConfig};
use ratchet_core::{
    at_least_as_protective, normalize_price, profit_usd, Clock, Direction, Position, Price, Quote,
    SymbolInfo, Ticket, Usd,
};
use ratchet_journal::{JournalHandle, SlAttemptRecord};
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, error, info, warn};

use crate::compute::{compute_target, SlDecision};
use crate::locks::{LockKind, LockTable};
use crate::metrics::EngineMetrics;
use crate::registry::{PositionRegistry, SymbolTable};
use crate::state::{within_tolerance, SlReason, SlStateView, StateStore};

/// Tagged result of one `update_sl_atomic` invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// Applied; verification is scheduled.
    Ok { reason: SlReason, applied_sl: Price },
    /// Ticket vanished from the registry or the broker.
    NoPosition,
    /// Circuit cool-off active for this ticket.
    CircuitOpen,
    /// Per-ticket minimum interval has not elapsed.
    Throttled,
    /// Lock contention beyond the timeout; not a losing position.
    LockTimeout,
    /// The computation produced no change.
    NoUpdate,
    /// The proposal would reduce protection; dropped without an RPC.
    NonMonotonic,
    /// No protective price satisfies the broker's stops level.
    BrokerConstraint,
    /// Global RPC bucket exhausted for this tick.
    RateLimited,
    /// Broker kept rejecting; circuit opened.
    ApplyFailed { attempts: u32 },
    /// Lock-free strict-loss enforcement succeeded.
    EmergencyApplied { applied_sl: Price },
}

impl UpdateOutcome {
    /// Stable label used for metrics and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "ok",
            Self::NoPosition => "no_position",
            Self::CircuitOpen => "circuit_open",
            Self::Throttled => "throttled",
            Self::LockTimeout => "lock_timeout",
            Self::NoUpdate => "no_update",
            Self::NonMonotonic => "non_monotonic",
            Self::BrokerConstraint => "broker_constraint",
            Self::RateLimited => "rate_limited",
            Self::ApplyFailed { .. } => "apply_failed",
            Self::EmergencyApplied { .. } => "emergency_applied",
        }
    }
}

/// Everything the applicator needs, threaded explicitly.
pub struct ApplicatorDeps {
    pub broker: Arc<dyn Broker>,
    pub registry: Arc<PositionRegistry>,
    pub symbols: Arc<SymbolTable>,
    pub locks: Arc<LockTable>,
    pub limiter: Arc<RpcLimiter>,
    pub metrics: Arc<EngineMetrics>,
    pub journal: JournalHandle,
    pub clock: Clock,
    pub execution: ExecutionConfig,
    pub locking: ProfitLockConfig,
    pub max_risk_usd: Usd,
}

/// The SL application engine. Owns the per-ticket SL state.
pub struct SlApplicator {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) registry: Arc<PositionRegistry>,
    pub(crate) symbols: Arc<SymbolTable>,
    pub(crate) locks: Arc<LockTable>,
    pub(crate) limiter: Arc<RpcLimiter>,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) journal: JournalHandle,
    pub(crate) clock: Clock,
    pub(crate) execution: ExecutionConfig,
    pub(crate) locking: ProfitLockConfig,
    pub(crate) max_risk_usd: Usd,
    pub(crate) states: StateStore,
    weak: Weak<SlApplicator>,
}

impl SlApplicator {
    #[must_use]
    pub fn new(deps: ApplicatorDeps) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            broker: deps.broker,
            registry: deps.registry,
            symbols: deps.symbols,
            locks: deps.locks,
            limiter: deps.limiter,
            metrics: deps.metrics,
            journal: deps.journal,
            clock: deps.clock,
            execution: deps.execution,
            locking: deps.locking,
            max_risk_usd: deps.max_risk_usd,
            states: StateStore::new(),
            weak: weak.clone(),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &PositionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    #[must_use]
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    #[must_use]
    pub fn journal(&self) -> &JournalHandle {
        &self.journal
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[must_use]
    pub fn symbol_info(&self, symbol: &str) -> Option<SymbolInfo> {
        self.symbols.get(symbol)
    }

    /// Read-only SL state for a ticket, if tracked.
    #[must_use]
    pub fn state_view(&self, ticket: Ticket) -> Option<SlStateView> {
        self.states.peek(ticket)
    }

    /// Initialize SL state after a fill. `initial_sl` is the stop the order
    /// was placed with.
    pub fn init_state_after_fill(&self, ticket: Ticket, initial_sl: Price) {
        self.states.ensure_default(ticket);
        self.states.record_success(
            ticket,
            initial_sl,
            SlReason::StrictLoss,
            Usd::ZERO,
            self.clock.monotonic(),
        );
        self.states.verification_ok(ticket);
    }

    /// Default state for a position discovered at reconciliation.
    pub fn ensure_default_state(&self, ticket: Ticket) {
        self.states.ensure_default(ticket);
    }

    /// Drop state for a closed ticket. Returns the final state, if any.
    pub fn remove_state(&self, ticket: Ticket) -> Option<SlStateView> {
        self.states.remove(ticket)
    }

    /// Operator reset for a ticket disabled by persistent verification
    /// failures.
    pub fn reset_disabled(&self, ticket: Ticket) {
        self.states.reset_disabled(ticket);
    }

    /// Number of tickets currently in circuit cool-off.
    #[must_use]
    pub fn open_circuits(&self) -> usize {
        self.states.open_circuits(self.clock.monotonic())
    }

    /// Compute and enforce the protective stop for one ticket.
    ///
    /// Returns a boxed future (rather than `async fn`) because this call and
    /// [`Self::verify_applied`]'s deferred retry form a call cycle; without
    /// boxing, the compiler cannot finish computing the recursively-nested
    /// opaque future type.
    pub fn update_sl_atomic<'a>(
        &'a self,
        ticket: Ticket,
    ) -> Pin<Box<dyn Future<Output = UpdateOutcome> + Send + 'a>> {
        Box::pin(async move {
        let started = self.clock.monotonic();
        let Some(position) = self.registry.get(ticket) else {
            return UpdateOutcome::NoPosition;
        };
        let Some(info) = self.symbols.get(&position.symbol) else {
            warn!(ticket, symbol = %position.symbol, "no symbol metadata; skipping SL update");
            return UpdateOutcome::NoUpdate;
        };

        let now = self.clock.monotonic();
        let state = self.states.view(ticket);
        if state.disabled {
            return UpdateOutcome::CircuitOpen;
        }
        if let Some(until) = state.circuit_open_until {
            if now < until {
                return UpdateOutcome::CircuitOpen;
            }
        }
        if let Some(last) = state.last_attempt {
            let min_interval =
                Duration::from_millis(self.execution.sl_update_min_interval_ms_per_ticket);
            if now.saturating_sub(last) < min_interval {
                return UpdateOutcome::Throttled;
            }
        }

        // Lock timeout depends on whether the position is near profit
        // locking; the estimate uses the registry snapshot.
        let estimated_profit = position.profit(info.contract_value);
        let (kind, timeout) = if estimated_profit >= self.locking.sweet_spot_min_usd {
            (
                LockKind::ProfitLocking,
                Duration::from_millis(self.execution.lock_timeout_ms_profit_locking),
            )
        } else {
            (
                LockKind::Normal,
                Duration::from_millis(self.execution.lock_timeout_ms_normal),
            )
        };

        let guard = match self.locks.acquire(ticket, kind, timeout).await {
            Ok(guard) => guard,
            Err(_) => {
                self.metrics.inc_lock_timeout();
                warn!(ticket, ?kind, "ticket lock acquisition timed out");
                if estimated_profit < -self.max_risk_usd {
                    return self.emergency_enforce(&position, &info).await;
                }
                return UpdateOutcome::LockTimeout;
            }
        };

        let outcome = self.apply_locked(&position, &info, started).await;
        drop(guard);
        outcome
        })
    }

    async fn apply_locked(
        &self,
        position: &Position,
        info: &SymbolInfo,
        started: Duration,
    ) -> UpdateOutcome {
        let ticket = position.ticket;
        let quote = match self.broker.quote(&position.symbol).await {
            Ok(quote) => quote,
            Err(err) => {
                warn!(ticket, error = %err, "quote fetch failed during SL update");
                let now = self.clock.monotonic();
                self.states.record_failure(
                    ticket,
                    now,
                    self.execution.circuit_breaker_threshold,
                    Duration::from_millis(self.execution.circuit_cooloff_ms),
                );
                return UpdateOutcome::ApplyFailed { attempts: 0 };
            }
        };
        let price = quote.closing_price(position.direction);
        self.registry.observe_quote(ticket, price, None);
        let profit = profit_usd(
            position.direction,
            position.entry_price,
            price,
            position.volume,
            info.contract_value,
        );

        let now = self.clock.monotonic();
        let state = self.states.view(ticket);
        if profit >= self.locking.sweet_spot_min_usd && profit <= self.locking.sweet_spot_max_usd {
            self.states.note_sweet_spot_entry(ticket, now);
        }

        let computed = compute_target(
            position,
            info.contract_value,
            profit,
            &state,
            &self.locking,
            self.max_risk_usd,
        );
        self.states.raise_peak(ticket, computed.new_peak);

        let (raw_target, locked_usd, reason) = match computed.decision {
            SlDecision::NoUpdate => return UpdateOutcome::NoUpdate,
            SlDecision::Update {
                target_sl,
                locked_usd,
                reason,
            } => (target_sl, locked_usd, reason),
        };

        // Protection never regresses once a profit lock has been applied.
        if reason == SlReason::StrictLoss && state.is_protected() {
            debug!(ticket, "strict-loss proposal after profit lock dropped");
            return UpdateOutcome::NonMonotonic;
        }

        let mut target_sl = normalize_price(raw_target, info.point);
        let min_distance = info.stops_level + quote.spread();
        let (clamped, constrained) =
            clamp_to_stops_level(position.direction, target_sl, &quote, min_distance, info.point);
        target_sl = clamped;

        let tolerance = info.point;
        if let Some(last) = state.last_applied_sl {
            if within_tolerance(target_sl, last, tolerance) {
                return UpdateOutcome::NoUpdate;
            }
            if !at_least_as_protective(position.direction, target_sl, last) {
                if constrained {
                    debug!(
                        ticket,
                        %target_sl,
                        "stops level leaves no protective price"
                    );
                    return UpdateOutcome::BrokerConstraint;
                }
                // Elastic pullback or a sweet-spot target beneath an
                // established lock: expected, silent.
                return UpdateOutcome::NoUpdate;
            }
        }
        if let Some(broker_sl) = position.current_sl {
            if within_tolerance(target_sl, broker_sl, tolerance) {
                return UpdateOutcome::NoUpdate;
            }
            if !at_least_as_protective(position.direction, target_sl, broker_sl) {
                warn!(
                    ticket,
                    %broker_sl,
                    %target_sl,
                    "proposal would reduce protection versus broker SL"
                );
                return UpdateOutcome::NonMonotonic;
            }
        }

        // Re-check the per-ticket interval now that the lock is held: a
        // caller that waited out contention may no longer be due.
        let now = self.clock.monotonic();
        if let Some(last) = state.last_attempt {
            let min_interval =
                Duration::from_millis(self.execution.sl_update_min_interval_ms_per_ticket);
            if now.saturating_sub(last) < min_interval {
                return UpdateOutcome::Throttled;
            }
        }

        if !self.limiter.try_acquire() {
            self.metrics.inc_rate_limited();
            return UpdateOutcome::RateLimited;
        }

        // Anchor the per-ticket throttle once per RPC series, irrespective
        // of retries.
        self.states.mark_attempt(ticket, now);
        self.metrics.inc_attempt();

        let mut attempts = 0u32;
        let mut last_failure: Option<String> = None;
        while attempts < self.execution.max_retries {
            if attempts > 0 {
                let backoff = self.execution.retry_backoff_base_ms * (1u64 << (attempts - 1));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                if !self.limiter.try_acquire() {
                    last_failure = Some("rate limited during retry".into());
                    break;
                }
            }
            attempts += 1;
            match self.broker.modify_sl(ticket, target_sl).await {
                Ok(ModifyOutcome::Ok) => {
                    return self
                        .finish_success(position, info, target_sl, locked_usd, reason, profit, started, attempts)
                        .await;
                }
                Ok(ModifyOutcome::Rejected {
                    reason: RejectReason::PositionClosed,
                }) => {
                    debug!(ticket, "position closed during SL modify");
                    return UpdateOutcome::NoPosition;
                }
                Ok(ModifyOutcome::Rejected { reason: rejection }) => {
                    last_failure = Some(rejection.to_string());
                    self.record_rpc_failure(ticket);
                }
                Err(err) => {
                    last_failure = Some(err.to_string());
                    self.record_rpc_failure(ticket);
                }
            }
        }

        let failure = last_failure.unwrap_or_else(|| "unknown".into());
        warn!(
            ticket,
            attempts,
            %target_sl,
            failure = %failure,
            "SL apply failed; circuit pending"
        );
        self.metrics.inc_failure();
        self.journal.record_attempt(self.attempt_record(
            position,
            profit,
            target_sl,
            None,
            reason,
            Some(failure),
            attempts,
            started,
        ));
        UpdateOutcome::ApplyFailed { attempts }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_success(
        &self,
        position: &Position,
        info: &SymbolInfo,
        applied_sl: Price,
        locked_usd: Usd,
        reason: SlReason,
        profit: Usd,
        started: Duration,
        attempts: u32,
    ) -> UpdateOutcome {
        let ticket = position.ticket;
        let now = self.clock.monotonic();
        let activation = self
            .states
            .record_success(ticket, applied_sl, reason, profit, now);
        self.registry.observe_sl(ticket, applied_sl);

        let duration = now.saturating_sub(started);
        let duration_ms = duration.as_secs_f64() * 1000.0;
        self.metrics.inc_success(duration_ms);
        if let Some(activation) = activation {
            let millis = activation.as_secs_f64() * 1000.0;
            self.metrics.observe_activation(millis);
            info!(
                ticket,
                activation_ms = millis,
                "sweet spot lock active"
            );
        }
        info!(
            ticket,
            symbol = %position.symbol,
            reason = reason.as_str(),
            %applied_sl,
            locked_usd = %locked_usd,
            profit = %profit,
            attempts,
            "SL applied"
        );
        self.journal.record_attempt(self.attempt_record(
            position,
            profit,
            applied_sl,
            Some(applied_sl),
            reason,
            None,
            attempts,
            started,
        ));

        if let Some(strong) = self.weak.upgrade() {
            let delay = Duration::from_millis(self.execution.verification_delay_ms);
            let tolerance = info.point * Usd::from(self.execution.verification_tolerance_points);
            tokio::spawn(async move {
                strong
                    .verify_applied(ticket, applied_sl, delay, tolerance)
                    .await;
            });
        }

        UpdateOutcome::Ok { reason, applied_sl }
    }

    /// Deferred check that the broker really carries the applied value.
    async fn verify_applied(
        self: Arc<Self>,
        ticket: Ticket,
        expected: Price,
        delay: Duration,
        tolerance: Price,
    ) {
        tokio::time::sleep(delay).await;
        let positions = match self.broker.positions().await {
            Ok(positions) => positions,
            Err(err) => {
                warn!(ticket, error = %err, "verification fetch failed");
                return;
            }
        };
        let Some(position) = positions.into_iter().find(|p| p.ticket == ticket) else {
            // Closed in the meantime; the monitor reconciles it.
            self.states.verification_abandoned(ticket);
            return;
        };

        let observed = position.current_sl.unwrap_or_default();
        if within_tolerance(observed, expected, tolerance) {
            self.states.verification_ok(ticket);
            self.registry.observe_sl(ticket, observed);
            self.metrics.inc_verification_ok();
            return;
        }

        self.metrics.inc_verification_failure();
        warn!(
            ticket,
            %expected,
            %observed,
            "VERIFICATION_FAILED: broker SL does not match applied value"
        );
        let now = self.clock.monotonic();
        let disabled = self.states.verification_failed(
            ticket,
            now,
            self.execution.circuit_breaker_threshold,
            Duration::from_millis(self.execution.circuit_cooloff_ms),
            Duration::from_secs(self.execution.disable_after_verification_failure_minutes * 60),
        );
        if disabled {
            error!(
                ticket,
                "ticket DISABLED after persistent verification failures; operator reset required"
            );
            return;
        }
        // Retry the whole pipeline; throttling and the circuit still apply.
        let outcome = self.update_sl_atomic(ticket).await;
        debug!(ticket, outcome = outcome.label(), "verification retry outcome");
    }

    fn record_rpc_failure(&self, ticket: Ticket) {
        let now = self.clock.monotonic();
        let failures = self.states.record_failure(
            ticket,
            now,
            self.execution.circuit_breaker_threshold,
            Duration::from_millis(self.execution.circuit_cooloff_ms),
        );
        if failures == self.execution.circuit_breaker_threshold {
            warn!(
                ticket,
                failures, "circuit opened after consecutive SL failures"
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attempt_record(
        &self,
        position: &Position,
        profit: Usd,
        target_sl: Price,
        applied_sl: Option<Price>,
        reason: SlReason,
        failure_reason: Option<String>,
        attempts: u32,
        started: Duration,
    ) -> SlAttemptRecord {
        let duration = self.clock.monotonic().saturating_sub(started);
        SlAttemptRecord {
            timestamp: self.clock.wall(),
            ticket: position.ticket,
            symbol: position.symbol.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            current_price: position.current_price,
            profit_usd: profit,
            target_sl,
            applied_sl,
            reason: reason.as_str().to_string(),
            success: failure_reason.is_none(),
            failure_reason,
            attempts,
            duration_ms: duration.as_millis().to_u64().unwrap_or(u64::MAX),
        }
    }
}

/// Clamp a target SL to the broker's minimum stop distance, moving only
/// toward the current price's protective side. Returns the (possibly
/// adjusted) price and whether clamping occurred.
pub(crate) fn clamp_to_stops_level(
    direction: Direction,
    target: Price,
    quote: &Quote,
    min_distance: Price,
    point: Price,
) -> (Price, bool) {
    match direction {
        Direction::Long => {
            let max_allowed = quote.bid - min_distance;
            if target > max_allowed {
                (normalize_price(max_allowed, point), true)
            } else {
                (target, false)
            }
        }
        Direction::Short => {
            let min_allowed = quote.ask + min_distance;
            if target < min_allowed {
                (normalize_price(min_allowed, point), true)
            } else {
                (target, false)
            }
        }
    }
}
