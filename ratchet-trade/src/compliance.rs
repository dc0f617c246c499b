//! Compliance closure.
//!
//! Honors external holding rules: positions held past the overnight
//! threshold are closed regardless of profit, with a distinct reason
//! prefix. Entry-side compliance (swap-free symbols only) is enforced by
//! the gate pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use ratchet_broker::{Broker, CloseOutcome, RpcLimiter};
use ratchet_config::ComplianceConfig;
use ratchet_core::Clock;
use ratchet_engine::{ClosureSender, EngineMetrics, PositionRegistry, ShutdownSignal, SlApplicator};
use ratchet_journal::{ClosureRecord, JournalHandle};
use rust_decimal::Decimal;
use tracing::{info, warn};

const CLOSE_REASON: &str = "COMPLIANCE_OVERNIGHT";

/// Closes positions that violate holding rules.
pub struct ComplianceEngine {
    broker: Arc<dyn Broker>,
    registry: Arc<PositionRegistry>,
    applicator: Arc<SlApplicator>,
    limiter: Arc<RpcLimiter>,
    journal: JournalHandle,
    metrics: Arc<EngineMetrics>,
    clock: Clock,
    config: ComplianceConfig,
    closure_tx: Option<ClosureSender>,
}

impl ComplianceEngine {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<PositionRegistry>,
        applicator: Arc<SlApplicator>,
        limiter: Arc<RpcLimiter>,
        journal: JournalHandle,
        metrics: Arc<EngineMetrics>,
        clock: Clock,
        config: ComplianceConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            applicator,
            limiter,
            journal,
            metrics,
            clock,
            config,
            closure_tx: None,
        }
    }

    /// Announce closures on the given channel as well as the journal.
    #[must_use]
    pub fn with_closure_feed(mut self, tx: ClosureSender) -> Self {
        self.closure_tx = Some(tx);
        self
    }

    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        if !self.config.enabled {
            return;
        }
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        info!(
            max_hold_hours = self.config.max_overnight_hold_hours,
            "compliance engine started"
        );
        while shutdown.sleep(interval).await {
            self.sweep().await;
        }
    }

    /// Close every position held past the overnight threshold.
    pub async fn sweep(&self) {
        let limit = ChronoDuration::hours(self.config.max_overnight_hold_hours);
        let now = self.clock.wall();
        for ticket in self.registry.tickets() {
            let Some(position) = self.registry.get(ticket) else {
                continue;
            };
            if now - position.opened_at <= limit {
                continue;
            }
            if !self.limiter.try_acquire() {
                // Next sweep retries; compliance tolerates minutes of delay.
                continue;
            }
            let comment = format!("COMPLIANCE: overnight hold exceeded ({ticket})");
            match self.broker.close_position(ticket, &comment).await {
                Ok(CloseOutcome::Ok) => {
                    let profit = self
                        .applicator
                        .symbol_info(&position.symbol)
                        .map(|meta| position.profit(meta.contract_value))
                        .unwrap_or(Decimal::ZERO);
                    self.registry.remove(ticket);
                    self.applicator.remove_state(ticket);
                    self.metrics.inc_closure(CLOSE_REASON);
                    info!(
                        ticket,
                        symbol = %position.symbol,
                        held_hours = (now - position.opened_at).num_hours(),
                        profit = %profit,
                        "position closed for compliance"
                    );
                    let record = ClosureRecord {
                        ticket,
                        symbol: position.symbol.clone(),
                        close_time: now,
                        close_reason: CLOSE_REASON.into(),
                        profit_usd: profit,
                    };
                    if let Some(tx) = &self.closure_tx {
                        let _ = tx.send(record.clone());
                    }
                    self.journal.record_closure(record);
                }
                Ok(CloseOutcome::Rejected { reason }) => {
                    warn!(ticket, %reason, "compliance close rejected");
                }
                Err(err) => {
                    warn!(ticket, error = %err, "compliance close failed");
                }
            }
        }
    }
}
