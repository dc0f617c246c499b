//! Entry-to-exit flows against the simulation broker.

use std::sync::Arc;
use std::time::Duration;

use ratchet_broker::{Broker, RpcLimiter};
use ratchet_config::{
    ExecutionConfig, MicroProfitConfig, ProfitLockConfig, RiskConfig,
};
use ratchet_core::{Clock, Direction, SymbolInfo, TradeMode};
use ratchet_engine::{
    ApplicatorDeps, EngineMetrics, LockTable, PositionRegistry, SlApplicator, SlReason,
    SymbolTable, UpdateOutcome,
};
use ratchet_gates::SignalCandidate;
use ratchet_journal::{Journal, JournalSettings};
use ratchet_sim::SimBroker;
use ratchet_trade::{EntryEngine, EntryResult, MicroProfitEngine};
use rust_decimal::Decimal;
use tempfile::TempDir;

const ENTRY_ASK: &str = "1.10002";

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn symbol_info(stops_level: &str) -> SymbolInfo {
    SymbolInfo {
        symbol: "EURUSD".into(),
        min_lot: d("0.01"),
        lot_step: d("0.01"),
        contract_value: d("100000"),
        point: d("0.00001"),
        stops_level: d(stops_level),
        trade_mode: TradeMode::Full,
        swap_free: true,
    }
}

fn candidate() -> SignalCandidate {
    SignalCandidate {
        symbol: "EURUSD".into(),
        direction: Direction::Long,
        quality_score: 85,
        bar_volume: d("1000"),
    }
}

struct Flow {
    sim: Arc<SimBroker>,
    registry: Arc<PositionRegistry>,
    applicator: Arc<SlApplicator>,
    entry: EntryEngine,
    limiter: Arc<RpcLimiter>,
    metrics: Arc<EngineMetrics>,
    journal: Option<Journal>,
    clock: Clock,
    _tmp: TempDir,
}

impl Flow {
    async fn new(stops_level: &str, risk: RiskConfig) -> Self {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::spawn(JournalSettings {
            dir: tmp.path().to_path_buf(),
            flush_interval: Duration::from_millis(20),
            channel_capacity: 128,
        })
        .await
        .unwrap();

        let clock = Clock::system();
        let sim = Arc::new(SimBroker::new(vec![symbol_info(stops_level)]));
        sim.push_quote("EURUSD", d("1.10000"), d(ENTRY_ASK));

        let registry = Arc::new(PositionRegistry::new());
        let symbols = Arc::new(SymbolTable::new());
        symbols.replace_all(vec![symbol_info(stops_level)]);
        let metrics = Arc::new(EngineMetrics::new());
        let limiter = Arc::new(RpcLimiter::new(1_000));

        let mut execution = ExecutionConfig::default();
        execution.sl_update_min_interval_ms_per_ticket = 0;
        execution.verification_delay_ms = 10;

        let applicator = SlApplicator::new(ApplicatorDeps {
            broker: sim.clone(),
            registry: registry.clone(),
            symbols: symbols.clone(),
            locks: Arc::new(LockTable::new(clock.clone())),
            limiter: limiter.clone(),
            metrics: metrics.clone(),
            journal: journal.handle(),
            clock: clock.clone(),
            execution,
            locking: ProfitLockConfig::default(),
            max_risk_usd: risk.max_risk_per_trade_usd,
        });
        let entry = EntryEngine::new(
            sim.clone(),
            registry.clone(),
            applicator.clone(),
            metrics.clone(),
            clock.clone(),
            risk,
        );

        Self {
            sim,
            registry,
            applicator,
            entry,
            limiter,
            metrics,
            journal: Some(journal),
            clock,
            _tmp: tmp,
        }
    }

    fn micro(&self) -> Arc<MicroProfitEngine> {
        Arc::new(MicroProfitEngine::new(
            self.sim.clone(),
            self.registry.clone(),
            self.applicator.clone(),
            self.limiter.clone(),
            self.journal.as_ref().unwrap().handle(),
            self.metrics.clone(),
            self.clock.clone(),
            MicroProfitConfig::default(),
            ProfitLockConfig::default(),
        ))
    }

    async fn shutdown(mut self) {
        if let Some(journal) = self.journal.take() {
            journal.shutdown().await.unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn entry_always_carries_a_stop_at_the_loss_cap() {
    let flow = Flow::new("0.00002", RiskConfig::default()).await;
    let quote = flow.sim.quote("EURUSD").await.unwrap();
    let info = symbol_info("0.00002");

    let result = flow.entry.try_enter(&candidate(), &info, &quote).await.unwrap();
    let (ticket, initial_sl) = match result {
        EntryResult::Entered {
            ticket, initial_sl, ..
        } => (ticket, initial_sl),
        other => panic!("expected entry, got {other:?}"),
    };

    // -$2.00 at 0.01 lots from the expected ask.
    assert_eq!(initial_sl, d(ENTRY_ASK) - d("0.00200"));
    assert_eq!(flow.sim.position_sl(ticket), Some(initial_sl));

    let position = flow.registry.get(ticket).unwrap();
    assert_eq!(position.volume, d("0.01"));
    let state = flow.applicator.state_view(ticket).unwrap();
    assert_eq!(state.last_applied_reason, Some(SlReason::StrictLoss));
    flow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_fills_register_only_the_reported_portion() {
    let mut risk = RiskConfig::default();
    risk.default_lot = d("0.04");
    let flow = Flow::new("0.00002", risk).await;
    flow.sim.set_behavior(|b| b.partial_fill_ratio = Some(d("0.5")));

    let quote = flow.sim.quote("EURUSD").await.unwrap();
    let info = symbol_info("0.00002");
    let result = flow.entry.try_enter(&candidate(), &info, &quote).await.unwrap();
    match result {
        EntryResult::Entered { ticket, volume, .. } => {
            assert_eq!(volume, d("0.02"));
            assert_eq!(flow.registry.get(ticket).unwrap().volume, d("0.02"));
        }
        other => panic!("expected partial acceptance, got {other:?}"),
    }
    flow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tight_stops_level_widens_the_initial_stop() {
    // Stops level of 300 points forces the stop wider than the $2 cap.
    let flow = Flow::new("0.00300", RiskConfig::default()).await;
    let quote = flow.sim.quote("EURUSD").await.unwrap();
    let info = symbol_info("0.00300");

    let result = flow.entry.try_enter(&candidate(), &info, &quote).await.unwrap();
    match result {
        EntryResult::Entered { initial_sl, .. } => {
            assert!(
                initial_sl < d(ENTRY_ASK) - d("0.00200"),
                "stop must be widened past the cap, got {initial_sl}"
            );
        }
        other => panic!("expected entry with widened stop, got {other:?}"),
    }
    flow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn micro_profit_closes_only_protected_positions() {
    let flow = Flow::new("0.00002", RiskConfig::default()).await;
    let quote = flow.sim.quote("EURUSD").await.unwrap();
    let info = symbol_info("0.00002");
    let result = flow.entry.try_enter(&candidate(), &info, &quote).await.unwrap();
    let ticket = match result {
        EntryResult::Entered { ticket, .. } => ticket,
        other => panic!("unexpected {other:?}"),
    };
    let micro = flow.micro();

    // Profit in band but the stop is still the entry stop: no close.
    let bid = d(ENTRY_ASK) + d("0.00006");
    flow.sim.push_quote("EURUSD", bid, bid + d("0.00002"));
    flow.registry.observe_quote(ticket, bid, None);
    assert!(!micro.check_and_close(ticket).await);
    assert_eq!(flow.sim.open_count(), 1);

    // Apply the sweet-spot lock, then the same profit qualifies.
    let outcome = flow.applicator.update_sl_atomic(ticket).await;
    assert!(matches!(
        outcome,
        UpdateOutcome::Ok {
            reason: SlReason::SweetSpot,
            ..
        }
    ));
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(micro.check_and_close(ticket).await);
    assert_eq!(flow.sim.open_count(), 0);
    assert!(flow.registry.get(ticket).is_none());
    let closed = flow.sim.closed();
    assert_eq!(closed.len(), 1);
    assert!(closed[0].reason.contains("micro-profit"));
    flow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn micro_profit_never_touches_losing_positions() {
    let flow = Flow::new("0.00002", RiskConfig::default()).await;
    let quote = flow.sim.quote("EURUSD").await.unwrap();
    let info = symbol_info("0.00002");
    let result = flow.entry.try_enter(&candidate(), &info, &quote).await.unwrap();
    let ticket = match result {
        EntryResult::Entered { ticket, .. } => ticket,
        other => panic!("unexpected {other:?}"),
    };
    let micro = flow.micro();

    let bid = d(ENTRY_ASK) - d("0.00050");
    flow.sim.push_quote("EURUSD", bid, bid + d("0.00002"));
    flow.registry.observe_quote(ticket, bid, None);
    assert!(!micro.check_and_close(ticket).await);
    assert_eq!(flow.sim.open_count(), 1);
    flow.shutdown().await;
}
