//! Micro-profit closure.
//!
//! Closes a protected, profitable position to capture a small, confirmed
//! gain. It never closes a losing position, never touches a stop, and
//! re-reads profit immediately before the close request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ratchet_broker::{Broker, CloseOutcome, RpcLimiter};
use ratchet_config::{MicroProfitConfig, ProfitLockConfig};
use ratchet_core::{profit_usd, Clock, Ticket, Usd};
use ratchet_engine::{ClosureSender, EngineMetrics, PositionRegistry, ShutdownSignal, SlApplicator};
use ratchet_journal::{ClosureRecord, JournalHandle};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

const CLOSE_REASON: &str = "MICRO_PROFIT";
/// Minimum spacing between checks of the same ticket.
const PER_TICKET_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Scans open positions each worker tick and closes the ones sitting on a
/// small confirmed profit.
pub struct MicroProfitEngine {
    broker: Arc<dyn Broker>,
    registry: Arc<PositionRegistry>,
    applicator: Arc<SlApplicator>,
    limiter: Arc<RpcLimiter>,
    journal: JournalHandle,
    metrics: Arc<EngineMetrics>,
    clock: Clock,
    config: MicroProfitConfig,
    locking: ProfitLockConfig,
    closing: Mutex<HashSet<Ticket>>,
    last_check: Mutex<HashMap<Ticket, Duration>>,
    closure_tx: Option<ClosureSender>,
}

impl MicroProfitEngine {
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
        config: MicroProfitConfig,
        locking: ProfitLockConfig,
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
            locking,
            closing: Mutex::new(HashSet::new()),
            last_check: Mutex::new(HashMap::new()),
            closure_tx: None,
        }
    }

    /// Announce closures on the given channel as well as the journal.
    #[must_use]
    pub fn with_closure_feed(mut self, tx: ClosureSender) -> Self {
        self.closure_tx = Some(tx);
        self
    }

    /// Sweep every tracked ticket at the worker cadence until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal, interval: Duration) {
        if !self.config.enabled {
            return;
        }
        info!(
            interval_ms = interval.as_millis() as u64,
            "micro-profit engine started"
        );
        while shutdown.sleep(interval).await {
            for ticket in self.registry.tickets() {
                if shutdown.triggered() {
                    break;
                }
                self.check_and_close(ticket).await;
            }
        }
    }

    /// Whether the profit sits in a closable band.
    fn band_ok(&self, profit: Usd) -> bool {
        profit_in_close_band(&self.config, &self.locking, profit)
    }

    /// Close the ticket if every precondition holds. Returns whether a close
    /// was issued and acknowledged.
    pub async fn check_and_close(&self, ticket: Ticket) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self.closing.lock().contains(&ticket) {
            return false;
        }
        let now = self.clock.monotonic();
        {
            let mut last = self.last_check.lock();
            if let Some(previous) = last.get(&ticket) {
                if now.saturating_sub(*previous) < PER_TICKET_CHECK_INTERVAL {
                    return false;
                }
            }
            last.insert(ticket, now);
        }

        let Some(position) = self.registry.get(ticket) else {
            return false;
        };
        let Some(info) = self.applicator.symbol_info(&position.symbol) else {
            return false;
        };

        // The position must already be in a protected state; micro-profit
        // never substitutes for SL application.
        let protected = self
            .applicator
            .state_view(ticket)
            .is_some_and(|state| state.is_protected());
        if !protected {
            return false;
        }

        let estimated = position.profit(info.contract_value);
        if !self.band_ok(estimated) {
            return false;
        }

        // Confirm against a fresh quote immediately before closing.
        let fresh = match self.broker.quote(&position.symbol).await {
            Ok(quote) => profit_usd(
                position.direction,
                position.entry_price,
                quote.closing_price(position.direction),
                position.volume,
                info.contract_value,
            ),
            Err(err) => {
                debug!(ticket, error = %err, "micro-profit re-read failed");
                return false;
            }
        };
        let floor = self.locking.sweet_spot_min_usd + self.config.close_buffer_usd;
        if fresh < floor {
            debug!(ticket, profit = %fresh, "profit fell below the close floor before closing");
            return false;
        }

        if !self.limiter.try_acquire() {
            return false;
        }

        self.closing.lock().insert(ticket);
        let result = self.close_with_retries(ticket, fresh).await;
        self.closing.lock().remove(&ticket);
        if result {
            self.last_check.lock().remove(&ticket);
        }
        result
    }

    async fn close_with_retries(&self, ticket: Ticket, profit: Usd) -> bool {
        let comment = format!("micro-profit close (${profit:.2})");
        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                if !self.limiter.try_acquire() {
                    return false;
                }
            }
            match self.broker.close_position(ticket, &comment).await {
                Ok(CloseOutcome::Ok) => {
                    let position = self.registry.remove(ticket);
                    self.applicator.remove_state(ticket);
                    self.metrics.inc_closure(CLOSE_REASON);
                    info!(ticket, profit = %profit, "micro-profit captured");
                    if let Some(position) = position {
                        let record = ClosureRecord {
                            ticket,
                            symbol: position.symbol,
                            close_time: self.clock.wall(),
                            close_reason: CLOSE_REASON.into(),
                            profit_usd: profit,
                        };
                        if let Some(tx) = &self.closure_tx {
                            let _ = tx.send(record.clone());
                        }
                        self.journal.record_closure(record);
                    }
                    return true;
                }
                Ok(CloseOutcome::Rejected { reason }) => {
                    warn!(ticket, %reason, attempt, "micro-profit close rejected");
                }
                Err(err) => {
                    warn!(ticket, error = %err, attempt, "micro-profit close failed");
                }
            }
        }
        false
    }
}

/// The closable band: the buffered primary sweet-spot range, plus (when
/// enabled) profits within a margin of a whole multiple of the trailing
/// increment.
fn profit_in_close_band(
    config: &MicroProfitConfig,
    locking: &ProfitLockConfig,
    profit: Usd,
) -> bool {
    let floor = locking.sweet_spot_min_usd + config.close_buffer_usd;
    if profit < floor {
        return false;
    }
    if profit <= locking.sweet_spot_max_usd {
        return true;
    }
    if !config.extended_band_enabled {
        return false;
    }
    let increment = locking.trailing_increment_usd;
    if increment <= Decimal::ZERO {
        return false;
    }
    let remainder = profit % increment;
    remainder <= config.extended_band_margin_usd
        || increment - remainder <= config.extended_band_margin_usd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn band_ok(profit: &str, extended: bool) -> bool {
        let mut config = MicroProfitConfig::default();
        config.extended_band_enabled = extended;
        profit_in_close_band(&config, &ProfitLockConfig::default(), d(profit))
    }

    #[test]
    fn primary_band_requires_the_buffered_floor() {
        assert!(!band_ok("0.03", false), "floor + buffer not met");
        assert!(!band_ok("0.04", false));
        assert!(band_ok("0.05", false));
        assert!(band_ok("0.10", false));
        assert!(!band_ok("0.11", false), "above the primary band");
    }

    #[test]
    fn losing_or_tiny_profit_never_qualifies() {
        assert!(!band_ok("-0.50", false));
        assert!(!band_ok("0.00", false));
        assert!(!band_ok("0.02", false));
    }

    #[test]
    fn extended_band_is_gated_by_config() {
        // 0.21 is within 0.02 of the 0.20 multiple.
        assert!(!band_ok("0.21", false));
        assert!(band_ok("0.21", true));
        assert!(band_ok("0.39", true), "within margin below the 0.40 multiple");
        assert!(!band_ok("0.25", true), "mid-increment stays excluded");
    }
}
