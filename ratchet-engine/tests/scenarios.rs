//! End-to-end lifecycle scenarios against the simulation broker.
//!
//! A single long position on a 5-digit symbol: one point is worth $0.01 at
//! 0.01 lots, so a profit of $p sits at `entry + p/1000`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ratchet_broker::{RejectReason, RpcLimiter};
use ratchet_config::{ExecutionConfig, ProfitLockConfig};
use ratchet_core::{
    at_least_as_protective, Clock, Direction, ManualClock, Position, Price, SymbolInfo, TradeMode,
};
use ratchet_engine::{
    ApplicatorDeps, EngineMetrics, LockKind, LockTable, PositionRegistry, SlApplicator, SlReason,
    SymbolTable, UpdateOutcome,
};
use ratchet_journal::{Journal, JournalSettings};
use ratchet_sim::SimBroker;
use rust_decimal::Decimal;
use tempfile::TempDir;

const ENTRY: &str = "1.10000";
const TICKET: u64 = 1;

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn symbol_info() -> SymbolInfo {
    SymbolInfo {
        symbol: "EURUSD".into(),
        min_lot: d("0.01"),
        lot_step: d("0.01"),
        contract_value: d("100000"),
        point: d("0.00001"),
        stops_level: d("0.00002"),
        trade_mode: TradeMode::Full,
        swap_free: true,
    }
}

/// Bid at which a 0.01-lot long from `ENTRY` shows `profit` dollars.
fn bid_for_profit(profit: &str) -> Decimal {
    d(ENTRY) + d(profit) / d("1000")
}

fn strict_loss_sl() -> Decimal {
    // -$2.00 at 0.01 lots and contract value 100000.
    d(ENTRY) - d("0.00200")
}

struct Harness {
    sim: Arc<SimBroker>,
    applicator: Arc<SlApplicator>,
    clock_handle: Option<ManualClock>,
    journal: Option<Journal>,
    _tmp: TempDir,
}

impl Harness {
    async fn new(tune: impl FnOnce(&mut ExecutionConfig), manual_clock: bool) -> Self {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::spawn(JournalSettings {
            dir: tmp.path().to_path_buf(),
            flush_interval: Duration::from_millis(20),
            channel_capacity: 256,
        })
        .await
        .unwrap();

        let mut execution = ExecutionConfig::default();
        execution.sl_update_min_interval_ms_per_ticket = 0;
        execution.verification_delay_ms = 10;
        execution.retry_backoff_base_ms = 5;
        execution.global_rpc_rate_per_sec = 1_000;
        tune(&mut execution);

        let (clock, clock_handle) = if manual_clock {
            let (clock, handle) = Clock::manual(Utc::now());
            (clock, Some(handle))
        } else {
            (Clock::system(), None)
        };

        let sim = Arc::new(SimBroker::new(vec![symbol_info()]));
        let registry = Arc::new(PositionRegistry::new());
        let symbols = Arc::new(SymbolTable::new());
        symbols.replace_all(vec![symbol_info()]);

        let limiter = Arc::new(RpcLimiter::new(execution.global_rpc_rate_per_sec));
        let applicator = SlApplicator::new(ApplicatorDeps {
            broker: sim.clone(),
            registry,
            symbols,
            locks: Arc::new(LockTable::new(clock.clone())),
            limiter,
            metrics: Arc::new(EngineMetrics::new()),
            journal: journal.handle(),
            clock,
            execution,
            locking: ProfitLockConfig::default(),
            max_risk_usd: d("2.00"),
        });

        Self {
            sim,
            applicator,
            clock_handle,
            journal: Some(journal),
            _tmp: tmp,
        }
    }

    /// Open the standard long position with its strict-loss stop attached.
    fn open_position(&self, current_profit: &str) {
        let bid = bid_for_profit(current_profit);
        self.sim.push_quote("EURUSD", bid, bid + d("0.00001"));
        let position = Position {
            ticket: TICKET,
            symbol: "EURUSD".into(),
            direction: Direction::Long,
            entry_price: d(ENTRY),
            volume: d("0.01"),
            current_price: bid,
            current_sl: Some(strict_loss_sl()),
            opened_at: Utc::now(),
            version: 0,
        };
        self.sim.inject_position(position.clone());
        self.applicator.registry().insert(position);
        self.applicator.init_state_after_fill(TICKET, strict_loss_sl());
    }

    /// Open a losing position that somehow carries no stop at all (e.g. a
    /// backfilled external position).
    fn open_unprotected_position(&self, current_profit: &str) {
        let bid = bid_for_profit(current_profit);
        self.sim.push_quote("EURUSD", bid, bid + d("0.00001"));
        let position = Position {
            ticket: TICKET,
            symbol: "EURUSD".into(),
            direction: Direction::Long,
            entry_price: d(ENTRY),
            volume: d("0.01"),
            current_price: bid,
            current_sl: None,
            opened_at: Utc::now(),
            version: 0,
        };
        self.sim.inject_position(position.clone());
        self.applicator.registry().insert(position);
        self.applicator.ensure_default_state(TICKET);
    }

    /// Push a quote at the given profit and run one update.
    async fn step(&self, profit: &str) -> UpdateOutcome {
        let bid = bid_for_profit(profit);
        self.sim.push_quote("EURUSD", bid, bid + d("0.00001"));
        self.applicator.update_sl_atomic(TICKET).await
    }

    async fn shutdown(mut self) {
        if let Some(journal) = self.journal.take() {
            journal.shutdown().await.unwrap();
        }
    }
}

fn assert_monotone(applied: &[Price]) {
    for window in applied.windows(2) {
        assert!(
            at_least_as_protective(Direction::Long, window[1], window[0]),
            "SL regressed from {} to {}",
            window[0],
            window[1]
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_sweet_spot_lock_then_trailing_exit() {
    let harness = Harness::new(|_| {}, false).await;
    harness.open_position("-0.40");

    let profits = [
        "-0.40", "-0.20", "0.02", "0.05", "0.09", "0.14", "0.22", "0.31", "0.18", "0.08",
    ];
    let mut outcomes = Vec::new();
    let mut applied = vec![strict_loss_sl()];
    for profit in profits {
        let outcome = harness.step(profit).await;
        if let UpdateOutcome::Ok { applied_sl, .. } = &outcome {
            applied.push(*applied_sl);
        }
        outcomes.push(outcome);
    }

    // Losing and dead-zone ticks change nothing; the entry stop stands.
    for outcome in &outcomes[..3] {
        assert_eq!(*outcome, UpdateOutcome::NoUpdate, "{outcomes:?}");
    }
    // Sweet spot locks break-even the instant profit enters the band.
    assert!(
        matches!(
            outcomes[3],
            UpdateOutcome::Ok {
                reason: SlReason::SweetSpot,
                ..
            }
        ),
        "{outcomes:?}"
    );
    // Re-entering the band with the lock in place is a no-op.
    assert_eq!(outcomes[4], UpdateOutcome::NoUpdate);
    // Three trailing tightenings as profit climbs.
    for outcome in &outcomes[5..8] {
        assert!(
            matches!(
                outcome,
                UpdateOutcome::Ok {
                    reason: SlReason::Trailing,
                    ..
                }
            ),
            "{outcomes:?}"
        );
    }
    // The pullback is inside tolerance, and by then the stop has fired.
    assert_eq!(outcomes[8], UpdateOutcome::NoUpdate);

    assert_monotone(&applied);

    let closed = harness.sim.closed();
    assert_eq!(closed.len(), 1, "position should exit via its stop");
    assert_eq!(closed[0].reason, "sl");
    assert!(
        closed[0].profit >= Decimal::ZERO,
        "trailing exit must realize a profit, got {}",
        closed[0].profit
    );
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_hard_stop_caps_the_loss() {
    let harness = Harness::new(|_| {}, false).await;
    harness.open_position("-0.10");

    let mut outcomes = Vec::new();
    for profit in ["-0.10", "-0.40", "-0.90", "-1.50", "-2.00"] {
        outcomes.push(harness.step(profit).await);
    }

    for outcome in &outcomes {
        assert!(
            !matches!(
                outcome,
                UpdateOutcome::Ok {
                    reason: SlReason::SweetSpot | SlReason::Trailing,
                    ..
                }
            ),
            "no profit lock may ever fire on a losing trade: {outcomes:?}"
        );
    }

    let closed = harness.sim.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, "sl");
    assert_eq!(closed[0].profit, d("-2.00"));
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_big_jump_locks_peak_minus_margin() {
    let harness = Harness::new(|_| {}, false).await;
    harness.open_position("0.05");

    let first = harness.step("0.05").await;
    assert!(matches!(
        first,
        UpdateOutcome::Ok {
            reason: SlReason::SweetSpot,
            ..
        }
    ));
    assert_eq!(harness.step("0.08").await, UpdateOutcome::NoUpdate);

    // +$0.47 in one tick: the big-jump override locks peak - margin.
    let jump = harness.step("0.55").await;
    match jump {
        UpdateOutcome::Ok {
            reason: SlReason::Trailing,
            applied_sl,
        } => {
            // $0.45 locked = entry + 45 points.
            assert_eq!(applied_sl, d(ENTRY) + d("0.00045"));
        }
        other => panic!("expected a trailing big-jump lock, got {other:?}"),
    }

    // The retreat to 0.42 crosses the lock; the stop fires, nothing regresses.
    assert_eq!(harness.step("0.42").await, UpdateOutcome::NoUpdate);
    let closed = harness.sim.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].profit, d("0.45"));
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_contention_recovers_without_regression() {
    let harness = Harness::new(
        |execution| {
            execution.lock_timeout_ms_normal = 50;
            execution.lock_timeout_ms_profit_locking = 2_000;
        },
        false,
    )
    .await;
    harness.open_position("0.00");

    // Adversary holds the ticket lock across the first updates.
    let guard = harness
        .applicator
        .locks()
        .acquire(TICKET, LockKind::Normal, Duration::from_millis(100))
        .await
        .unwrap();
    let adversary = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        drop(guard);
    });

    let mut sweet_spot_applies = 0;
    let mut lock_timeouts = 0;
    for profit in ["0.02", "0.04", "0.06", "0.08", "0.10", "0.12"] {
        match harness.step(profit).await {
            UpdateOutcome::Ok {
                reason: SlReason::SweetSpot,
                ..
            } => sweet_spot_applies += 1,
            UpdateOutcome::LockTimeout => lock_timeouts += 1,
            UpdateOutcome::NoUpdate | UpdateOutcome::Ok { .. } => {}
            other => panic!("unexpected outcome under contention: {other:?}"),
        }
    }
    adversary.await.unwrap();

    // The sweet-spot lock lands exactly once despite the contention.
    assert_eq!(sweet_spot_applies, 1);
    assert!(lock_timeouts <= 4, "excessive lock timeouts: {lock_timeouts}");

    let state = harness.applicator.state_view(TICKET).unwrap();
    assert!(state.is_protected());
    assert!(state.consecutive_failures <= 1);
    // Protection sits at break-even or better.
    assert!(harness.sim.position_sl(TICKET).unwrap() >= d(ENTRY));
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn emergency_path_enforces_the_cap_without_the_lock() {
    let harness = Harness::new(
        |execution| {
            execution.lock_timeout_ms_normal = 30;
        },
        false,
    )
    .await;
    harness.open_unprotected_position("-2.50");

    let guard = harness
        .applicator
        .locks()
        .acquire(TICKET, LockKind::Normal, Duration::from_millis(100))
        .await
        .unwrap();

    let outcome = harness.step("-2.50").await;
    match outcome {
        UpdateOutcome::EmergencyApplied { applied_sl } => {
            // Price is already past the cap, so the stop lands at the
            // closest protective price the stops level allows.
            assert!(applied_sl <= bid_for_profit("-2.50"));
            assert_eq!(harness.sim.position_sl(TICKET), Some(applied_sl));
        }
        other => panic!("expected emergency enforcement, got {other:?}"),
    }
    drop(guard);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn strict_loss_never_regresses_a_profit_lock() {
    let harness = Harness::new(|_| {}, false).await;
    harness.open_position("0.05");
    assert!(matches!(
        harness.step("0.05").await,
        UpdateOutcome::Ok {
            reason: SlReason::SweetSpot,
            ..
        }
    ));

    // A negative tick after the lock: the stop has fired at break-even in
    // the sim, and the engine must refuse the strict-loss proposal.
    let outcome = harness.step("-0.10").await;
    assert_eq!(outcome, UpdateOutcome::NonMonotonic);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn back_to_back_updates_are_idempotent() {
    let harness = Harness::new(|_| {}, false).await;
    harness.open_position("0.05");

    let first = harness.step("0.05").await;
    assert!(matches!(first, UpdateOutcome::Ok { .. }));
    // Same quote, immediate re-run: nothing to do.
    let second = harness.applicator.update_sl_atomic(TICKET).await;
    assert_eq!(second, UpdateOutcome::NoUpdate);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn per_ticket_throttle_spaces_rpc_series() {
    let harness = Harness::new(
        |execution| {
            execution.sl_update_min_interval_ms_per_ticket = 100;
        },
        true,
    )
    .await;
    harness.open_position("0.05");

    let first = harness.step("0.05").await;
    assert!(matches!(first, UpdateOutcome::Ok { .. }));

    // Within the min interval the ticket is throttled before any RPC.
    let throttled = harness.step("0.06").await;
    assert_eq!(throttled, UpdateOutcome::Throttled);

    harness
        .clock_handle
        .as_ref()
        .unwrap()
        .advance(Duration::from_millis(150));
    let after = harness.step("0.06").await;
    assert_eq!(after, UpdateOutcome::NoUpdate);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_rejections_open_the_circuit() {
    let harness = Harness::new(|_| {}, true).await;
    harness.open_position("0.05");
    harness.sim.set_behavior(|b| {
        b.reject_modifies = 3;
        b.modify_reject_reason = Some(RejectReason::Other("busy".into()));
    });

    let outcome = harness.step("0.05").await;
    assert_eq!(outcome, UpdateOutcome::ApplyFailed { attempts: 3 });

    let state = harness.applicator.state_view(TICKET).unwrap();
    assert!(state.circuit_open_until.is_some());
    assert_eq!(harness.step("0.05").await, UpdateOutcome::CircuitOpen);

    // After the cool-off the lock goes through.
    harness
        .clock_handle
        .as_ref()
        .unwrap()
        .advance(Duration::from_millis(10_500));
    let recovered = harness.step("0.05").await;
    assert!(matches!(
        recovered,
        UpdateOutcome::Ok {
            reason: SlReason::SweetSpot,
            ..
        }
    ));
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rpc_bucket_exhaustion_skips_without_blocking() {
    let harness = Harness::new(
        |execution| {
            execution.global_rpc_rate_per_sec = 1;
        },
        false,
    )
    .await;
    harness.open_position("0.05");

    let first = harness.step("0.05").await;
    assert!(matches!(first, UpdateOutcome::Ok { .. }));

    // A different target within the same second finds the bucket empty.
    let outcome = harness.step("0.14").await;
    assert_eq!(outcome, UpdateOutcome::RateLimited);
    harness.shutdown().await;
}
