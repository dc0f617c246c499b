//! Runtime wiring: builds every component from the configuration and runs
//! the four concurrent agents (scan loop, SL worker, position monitor, lock
//! watchdog) plus the closure engines and telemetry tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ratchet_broker::{Broker, BrokerError, RpcLimiter};
use ratchet_config::AppConfig;
use ratchet_core::Clock;
use ratchet_engine::{
    run_lock_watchdog, run_metrics_publisher, run_position_monitor, run_sl_worker, ApplicatorDeps,
    EngineMetrics, LockTable, MonitorDeps, PositionRegistry, ShutdownSignal, SlApplicator,
    SymbolTable,
};
use ratchet_gates::{FilterPipeline, MarketHours, NewsCalendar};
use ratchet_journal::{Journal, JournalSettings};
use ratchet_trade::{
    ComplianceEngine, DailyLossTracker, EntryEngine, KillSwitch, MicroProfitEngine, SignalSource,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::telemetry::spawn_metrics_server;

/// Fully wired trading runtime.
pub struct Runtime {
    config: AppConfig,
    clock: Clock,
    broker: Arc<dyn Broker>,
    registry: Arc<PositionRegistry>,
    symbols: Arc<SymbolTable>,
    metrics: Arc<EngineMetrics>,
    applicator: Arc<SlApplicator>,
    journal: Journal,
    pipeline: Arc<FilterPipeline>,
    entry: Arc<EntryEngine>,
    micro: Arc<MicroProfitEngine>,
    compliance: Arc<ComplianceEngine>,
    signals: Arc<dyn SignalSource>,
    kill_switch: Arc<KillSwitch>,
    loss_tracker: Arc<DailyLossTracker>,
    closure_tx: ratchet_engine::ClosureSender,
    closure_rx: Option<tokio::sync::mpsc::UnboundedReceiver<ratchet_journal::ClosureRecord>>,
}

impl Runtime {
    /// Build every component; fetches symbol metadata and reconciles the
    /// initial position list from the broker.
    pub async fn build(
        config: AppConfig,
        broker: Arc<dyn Broker>,
        signals: Arc<dyn SignalSource>,
        hours: Box<dyn MarketHours>,
        news: Box<dyn NewsCalendar>,
    ) -> Result<Self> {
        let clock = Clock::system();
        let registry = Arc::new(PositionRegistry::new());
        let symbols = Arc::new(SymbolTable::new());
        let metrics = Arc::new(EngineMetrics::new());
        let limiter = Arc::new(RpcLimiter::new(config.execution.global_rpc_rate_per_sec));
        let locks = Arc::new(LockTable::new(clock.clone()));

        let journal = Journal::spawn(JournalSettings {
            dir: config.journal.dir.clone(),
            flush_interval: Duration::from_millis(config.journal.flush_interval_ms),
            channel_capacity: config.journal.channel_capacity,
        })
        .await
        .context("failed to start the journal")?;

        let listed = broker
            .symbols()
            .await
            .context("failed to list broker symbols")?;
        info!(count = listed.len(), "symbol metadata loaded");
        symbols.replace_all(listed);

        let initial = broker
            .positions()
            .await
            .context("failed to fetch the initial position list")?;
        let report = registry.sync_with_broker(initial);

        let applicator = SlApplicator::new(ApplicatorDeps {
            broker: broker.clone(),
            registry: registry.clone(),
            symbols: symbols.clone(),
            locks,
            limiter: limiter.clone(),
            metrics: metrics.clone(),
            journal: journal.handle(),
            clock: clock.clone(),
            execution: config.execution.clone(),
            locking: config.locking.clone(),
            max_risk_usd: config.risk.max_risk_per_trade_usd,
        });
        for position in &report.backfilled {
            warn!(ticket = position.ticket, "adopting pre-existing broker position");
            applicator.ensure_default_state(position.ticket);
        }
        metrics.set_open_positions(registry.len());

        let pipeline = Arc::new(FilterPipeline::new(
            config.gates.clone(),
            hours,
            news,
            config.risk.max_open_trades,
            config.compliance.enabled && config.compliance.require_swap_free,
        ));
        let entry = Arc::new(EntryEngine::new(
            broker.clone(),
            registry.clone(),
            applicator.clone(),
            metrics.clone(),
            clock.clone(),
            config.risk.clone(),
        ));

        let (closure_tx, closure_rx) = tokio::sync::mpsc::unbounded_channel();
        let micro = Arc::new(
            MicroProfitEngine::new(
                broker.clone(),
                registry.clone(),
                applicator.clone(),
                limiter.clone(),
                journal.handle(),
                metrics.clone(),
                clock.clone(),
                config.micro_profit.clone(),
                config.locking.clone(),
            )
            .with_closure_feed(closure_tx.clone()),
        );
        let compliance = Arc::new(
            ComplianceEngine::new(
                broker.clone(),
                registry.clone(),
                applicator.clone(),
                limiter.clone(),
                journal.handle(),
                metrics.clone(),
                clock.clone(),
                config.compliance.clone(),
            )
            .with_closure_feed(closure_tx.clone()),
        );

        let loss_tracker = Arc::new(DailyLossTracker::new(
            config.gates.daily_loss_floor_usd,
            config.gates.standdown_minutes,
            clock.wall(),
        ));

        Ok(Self {
            config,
            clock,
            broker,
            registry,
            symbols,
            metrics,
            applicator,
            journal,
            pipeline,
            entry,
            micro,
            compliance,
            signals,
            kill_switch: Arc::new(KillSwitch::new()),
            loss_tracker,
            closure_tx,
            closure_rx: Some(closure_rx),
        })
    }

    /// Run all tasks until shutdown, then drain.
    pub async fn run(mut self, shutdown: ShutdownSignal) -> Result<()> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let metrics_addr = self
            .config
            .telemetry
            .metrics_addr
            .parse()
            .context("invalid telemetry.metrics_addr")?;
        handles.push(spawn_metrics_server(self.metrics.registry(), metrics_addr));

        handles.push(tokio::spawn(run_lock_watchdog(
            self.applicator.clone(),
            shutdown.clone(),
            Duration::from_millis(self.config.execution.watchdog_interval_ms),
            Duration::from_millis(self.config.execution.max_lock_hold_ms),
        )));

        handles.push(tokio::spawn(run_position_monitor(
            MonitorDeps {
                applicator: self.applicator.clone(),
                closure_tx: Some(self.closure_tx.clone()),
            },
            shutdown.clone(),
            Duration::from_secs(self.config.execution.reconcile_interval_secs),
        )));

        handles.push(tokio::spawn(run_sl_worker(
            self.applicator.clone(),
            shutdown.clone(),
        )));

        let worker_interval = Duration::from_millis(self.config.execution.worker_interval_ms);
        handles.push(tokio::spawn(
            self.micro.clone().run(shutdown.clone(), worker_interval),
        ));
        handles.push(tokio::spawn(self.compliance.clone().run(shutdown.clone())));

        handles.push(tokio::spawn(run_metrics_publisher(
            self.applicator.clone(),
            shutdown.clone(),
            Duration::from_secs(self.config.journal.metrics_snapshot_secs),
        )));

        // Realized-PnL feed into the daily-loss tracker.
        if let Some(mut rx) = self.closure_rx.take() {
            let tracker = self.loss_tracker.clone();
            let clock = self.clock.clone();
            let feed_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        record = rx.recv() => match record {
                            Some(record) => tracker.record_closure(record.profit_usd, clock.wall()),
                            None => break,
                        },
                        _ = feed_shutdown.wait() => break,
                    }
                }
            }));
        }

        // Kill-switch watcher: engages the global shutdown.
        {
            let kill = self.kill_switch.clone();
            let sd = shutdown.clone();
            handles.push(tokio::spawn(async move {
                while sd.sleep(Duration::from_millis(200)).await {
                    if kill.engaged() {
                        warn!("kill switch engaged; triggering shutdown");
                        sd.trigger();
                        break;
                    }
                }
            }));
        }

        self.scan_loop(&shutdown).await;

        shutdown.trigger();
        let drain = Duration::from_millis(self.config.execution.shutdown_drain_ms);
        info!(drain_ms = drain.as_millis() as u64, "draining tasks");
        tokio::time::sleep(drain).await;
        for handle in &handles {
            handle.abort();
        }
        self.journal
            .shutdown()
            .await
            .context("journal failed to flush")?;
        info!("runtime stopped");
        Ok(())
    }

    /// The market scan loop: poll the signal source, gate candidates, and
    /// hand survivors to the entry engine, best quality first.
    async fn scan_loop(&self, shutdown: &ShutdownSignal) {
        let interval = Duration::from_secs(self.config.scan.cycle_interval_secs);
        info!(interval_secs = interval.as_secs(), "scan loop started");
        while shutdown.sleep(interval).await {
            if self.kill_switch.engaged() {
                break;
            }
            let now = self.clock.wall();
            if self.loss_tracker.entries_paused(now) {
                continue;
            }

            let symbols = self.symbols.all();
            let mut candidates = self.signals.scan(&symbols).await;
            candidates.sort_by(|a, b| b.quality_score.cmp(&a.quality_score));

            for candidate in candidates {
                if shutdown.triggered() {
                    break;
                }
                let Some(info) = self.symbols.get(&candidate.symbol) else {
                    warn!(symbol = %candidate.symbol, "signal for unknown symbol ignored");
                    continue;
                };
                let quote = match self.broker.quote(&candidate.symbol).await {
                    Ok(quote) => quote,
                    Err(BrokerError::ConnectionLost(reason)) => {
                        self.kill_switch.activate(format!("broker connection lost: {reason}"));
                        break;
                    }
                    Err(err) => {
                        warn!(symbol = %candidate.symbol, error = %err, "quote unavailable during scan");
                        continue;
                    }
                };
                match self.pipeline.evaluate(
                    &candidate,
                    &info,
                    &quote,
                    self.registry.len(),
                    self.clock.wall(),
                ) {
                    Err(rejection) => {
                        info!(symbol = %candidate.symbol, %rejection, "candidate rejected");
                        self.metrics.inc_entry_rejection(rejection.gate());
                    }
                    Ok(()) => {
                        if let Err(err) = self.entry.try_enter(&candidate, &info, &quote).await {
                            error!(symbol = %candidate.symbol, error = %err, "entry attempt failed");
                        }
                    }
                }
            }
        }
        info!("scan loop stopped");
    }
}
