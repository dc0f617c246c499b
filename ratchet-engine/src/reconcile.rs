//! Background observers: broker reconciliation, the lock watchdog, and the
//! periodic metrics publisher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ratchet_core::{locked_profit_usd, Position, Price, Ticket};
use ratchet_journal::ClosureRecord;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::apply::SlApplicator;
use crate::shutdown::ShutdownSignal;
use crate::state::SlStateView;

/// Channel through which closures are announced to interested parties
/// (e.g. the daily-loss tracker).
pub type ClosureSender = tokio::sync::mpsc::UnboundedSender<ClosureRecord>;

/// Dependencies of the position monitor task.
pub struct MonitorDeps {
    pub applicator: Arc<SlApplicator>,
    pub closure_tx: Option<ClosureSender>,
}

/// Classify how a position left the book, from its final SL state.
#[must_use]
pub fn classify_exit(
    position: &Position,
    state: Option<&SlStateView>,
    contract_value: Price,
) -> &'static str {
    let Some(state) = state else {
        return "CLOSED";
    };
    let Some(sl) = state.last_applied_sl else {
        return "CLOSED";
    };
    let locked = locked_profit_usd(
        position.direction,
        position.entry_price,
        sl,
        position.volume,
        contract_value,
    );
    if locked >= Decimal::ZERO {
        "SL_PROFIT"
    } else {
        "SL_LOSS"
    }
}

/// Poll the broker's position list, backfill unknown tickets, retire closed
/// ones, and reclaim lock entries absent from both views for two passes.
pub async fn run_position_monitor(deps: MonitorDeps, shutdown: ShutdownSignal, interval: Duration) {
    let MonitorDeps {
        applicator,
        closure_tx,
    } = deps;
    let interval = interval.max(Duration::from_secs(5));
    let mut absent_streaks: HashMap<Ticket, u32> = HashMap::new();
    info!(interval_secs = interval.as_secs(), "position monitor started");

    while shutdown.sleep(interval).await {
        let broker_positions = match applicator.broker().positions().await {
            Ok(positions) => positions,
            Err(err) => {
                error!(error = %err, "reconciliation position fetch failed");
                continue;
            }
        };
        let broker_tickets: Vec<Ticket> = broker_positions.iter().map(|p| p.ticket).collect();
        let report = applicator.registry().sync_with_broker(broker_positions);

        for position in &report.backfilled {
            warn!(
                ticket = position.ticket,
                symbol = %position.symbol,
                "backfilled broker-side position missing from the registry"
            );
            applicator.ensure_default_state(position.ticket);
        }

        for position in &report.closed {
            let state = applicator.remove_state(position.ticket);
            let contract_value = applicator
                .symbol_info(&position.symbol)
                .map(|info| info.contract_value)
                .unwrap_or(Decimal::ONE);
            let reason = classify_exit(position, state.as_ref(), contract_value);
            let profit = position.profit(contract_value);
            info!(
                ticket = position.ticket,
                symbol = %position.symbol,
                reason,
                profit = %profit,
                "tracked position is no longer open"
            );
            applicator.metrics().inc_closure(reason);
            let record = ClosureRecord {
                ticket: position.ticket,
                symbol: position.symbol.clone(),
                close_time: applicator.clock().wall(),
                close_reason: reason.to_string(),
                profit_usd: profit,
            };
            if let Some(tx) = &closure_tx {
                let _ = tx.send(record.clone());
            }
            applicator.journal().record_closure(record);
        }

        // Lock entries are reclaimed only after the ticket has been absent
        // from both the registry and the broker for two consecutive passes.
        let tracked = applicator.locks().tracked_tickets();
        for ticket in tracked {
            let in_registry = applicator.registry().get(ticket).is_some();
            let at_broker = broker_tickets.contains(&ticket);
            if in_registry || at_broker {
                absent_streaks.remove(&ticket);
                continue;
            }
            let streak = absent_streaks.entry(ticket).or_insert(0);
            *streak += 1;
            if *streak >= 2 {
                applicator.locks().reclaim(ticket);
                absent_streaks.remove(&ticket);
            }
        }

        applicator
            .metrics()
            .set_open_positions(applicator.registry().len());
    }

    info!("position monitor stopped");
}

/// Inspect the lock table every `interval` and force-release stale holders.
pub async fn run_lock_watchdog(
    applicator: Arc<SlApplicator>,
    shutdown: ShutdownSignal,
    interval: Duration,
    max_hold: Duration,
) {
    info!(
        interval_ms = interval.as_millis() as u64,
        max_hold_ms = max_hold.as_millis() as u64,
        "lock watchdog started"
    );
    while shutdown.sleep(interval).await {
        for release in applicator.locks().force_release_stale(max_hold) {
            applicator.metrics().inc_stale_release();
            warn!(
                ticket = release.ticket,
                holder = %release.holder,
                kind = ?release.kind,
                held_ms = release.held_for.as_millis() as u64,
                "STALE_LOCK_FORCE_RELEASED"
            );
        }
    }
    info!("lock watchdog stopped");
}

/// Publish an aggregated metrics snapshot to the journal periodically.
pub async fn run_metrics_publisher(
    applicator: Arc<SlApplicator>,
    shutdown: ShutdownSignal,
    interval: Duration,
) {
    while shutdown.sleep(interval).await {
        let snapshot = applicator.metrics().snapshot();
        applicator.journal().record_metrics(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ratchet_core::Direction;

    fn position() -> Position {
        Position {
            ticket: 5,
            symbol: "EURUSD".into(),
            direction: Direction::Long,
            entry_price: Decimal::new(11000, 4),
            volume: Decimal::new(1, 2),
            current_price: Decimal::new(11010, 4),
            current_sl: None,
            opened_at: Utc::now(),
            version: 0,
        }
    }

    #[test]
    fn exit_with_profit_locked_classifies_as_sl_profit() {
        let state = SlStateView {
            last_applied_sl: Some(Decimal::new(11002, 4)),
            ..Default::default()
        };
        let reason = classify_exit(&position(), Some(&state), Decimal::new(100_000, 0));
        assert_eq!(reason, "SL_PROFIT");
    }

    #[test]
    fn exit_below_entry_classifies_as_sl_loss() {
        let state = SlStateView {
            last_applied_sl: Some(Decimal::new(10980, 4)),
            ..Default::default()
        };
        let reason = classify_exit(&position(), Some(&state), Decimal::new(100_000, 0));
        assert_eq!(reason, "SL_LOSS");
    }

    #[test]
    fn exit_without_state_is_plain_closed() {
        assert_eq!(classify_exit(&position(), None, Decimal::ONE), "CLOSED");
    }
}
