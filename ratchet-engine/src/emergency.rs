//! Lock-free strict-loss enforcement.
//!
//! Invoked only when a ticket lock could not be acquired and the position is
//! losing beyond the per-trade cap. This is the only sanctioned path into
//! the broker that bypasses the ticket lock; it still takes an RPC token,
//! and every invocation is logged with full context.

use ratchet_broker::ModifyOutcome;
use ratchet_core::{
    normalize_price, profit_usd, sl_price_for_profit, Position, SymbolInfo,
};
use tracing::{error, warn};

use crate::apply::{SlApplicator, UpdateOutcome};
use crate::state::SlReason;

impl SlApplicator {
    pub(crate) async fn emergency_enforce(
        &self,
        position: &Position,
        info: &SymbolInfo,
    ) -> UpdateOutcome {
        let ticket = position.ticket;
        let started = self.clock.monotonic();

        let quote = match self.broker.quote(&position.symbol).await {
            Ok(quote) => quote,
            Err(err) => {
                error!(ticket, error = %err, "emergency enforcement could not fetch a quote");
                return UpdateOutcome::LockTimeout;
            }
        };
        let price = quote.closing_price(position.direction);
        let profit = profit_usd(
            position.direction,
            position.entry_price,
            price,
            position.volume,
            info.contract_value,
        );

        let Some(target) = sl_price_for_profit(
            position.direction,
            position.entry_price,
            -self.max_risk_usd,
            position.volume,
            info.contract_value,
        ) else {
            error!(ticket, "emergency enforcement could not derive a strict-loss price");
            return UpdateOutcome::LockTimeout;
        };
        let target = normalize_price(target, info.point);
        // Price may already sit past the cap; settle for the closest
        // protective price the stops level admits.
        let min_distance = info.stops_level + quote.spread();
        let (target, _) = crate::apply::clamp_to_stops_level(
            position.direction,
            target,
            &quote,
            min_distance,
            info.point,
        );

        if !self.limiter.try_acquire() {
            self.metrics.inc_rate_limited();
            warn!(ticket, "emergency enforcement rate limited");
            return UpdateOutcome::RateLimited;
        }

        match self.broker.modify_sl(ticket, target).await {
            Ok(ModifyOutcome::Ok) => {
                self.metrics.inc_emergency();
                self.states.record_success(
                    ticket,
                    target,
                    SlReason::Emergency,
                    profit,
                    self.clock.monotonic(),
                );
                self.registry.observe_sl(ticket, target);
                error!(
                    ticket,
                    symbol = %position.symbol,
                    profit = %profit,
                    target_sl = %target,
                    "EMERGENCY_APPLIED: lock-free strict-loss stop enforced"
                );
                self.journal.record_attempt(self.attempt_record(
                    position,
                    profit,
                    target,
                    Some(target),
                    SlReason::Emergency,
                    None,
                    1,
                    started,
                ));
                UpdateOutcome::EmergencyApplied { applied_sl: target }
            }
            Ok(ModifyOutcome::Rejected { reason }) => {
                error!(ticket, %reason, "emergency enforcement rejected by broker");
                UpdateOutcome::LockTimeout
            }
            Err(err) => {
                error!(ticket, error = %err, "emergency enforcement transport failure");
                UpdateOutcome::LockTimeout
            }
        }
    }
}
