//! Pure stop-loss target computation.
//!
//! Deterministic function of the position, the freshly computed profit, the
//! per-ticket SL state, and the configuration. No clock, no I/O. The
//! monotonicity filter is applied by the caller, not here.

use ratchet_core::{sl_price_for_profit, Position, Price, Usd};
use ratchet_config::ProfitLockConfig;
use rust_decimal::Decimal;

use crate::state::{SlReason, SlStateView};

/// Peak profit at which the lock floor is pinned to `max_peak_lock_usd`.
const PEAK_CAP_TRIGGER_USD: Decimal = Decimal::ONE;

/// What the computation decided for this tick.
#[derive(Clone, Debug, PartialEq)]
pub enum SlDecision {
    /// Move the stop to `target_sl`, locking `locked_usd` of profit (or
    /// capping the loss, for [`SlReason::StrictLoss`]).
    Update {
        target_sl: Price,
        locked_usd: Usd,
        reason: SlReason,
    },
    /// Nothing to do at this profit level.
    NoUpdate,
}

/// Decision plus the updated profit high-water mark.
#[derive(Clone, Debug, PartialEq)]
pub struct Computed {
    pub decision: SlDecision,
    pub new_peak: Usd,
}

/// Compute the target stop for the current tick.
///
/// Priority order, first match wins: strict loss, sweet spot, trailing.
/// Profit in `[0, sweet_spot_min_usd)` yields no update.
#[must_use]
pub fn compute_target(
    position: &Position,
    contract_value: Price,
    profit_usd: Usd,
    state: &SlStateView,
    locking: &ProfitLockConfig,
    max_risk_usd: Usd,
) -> Computed {
    let peak = state.peak_profit_usd;

    if profit_usd < Decimal::ZERO {
        let decision = sl_price_for_profit(
            position.direction,
            position.entry_price,
            -max_risk_usd,
            position.volume,
            contract_value,
        )
        .map_or(SlDecision::NoUpdate, |target_sl| SlDecision::Update {
            target_sl,
            locked_usd: -max_risk_usd,
            reason: SlReason::StrictLoss,
        });
        return Computed {
            decision,
            new_peak: peak,
        };
    }

    if profit_usd >= locking.sweet_spot_min_usd && profit_usd <= locking.sweet_spot_max_usd {
        return Computed {
            decision: SlDecision::Update {
                target_sl: position.entry_price,
                locked_usd: Decimal::ZERO,
                reason: SlReason::SweetSpot,
            },
            new_peak: peak.max(profit_usd),
        };
    }

    if profit_usd > locking.sweet_spot_max_usd {
        let new_peak = peak.max(profit_usd);
        let increment = locking.trailing_increment_usd;

        let floor_lock =
            ((profit_usd / increment).floor() * increment - increment).max(Decimal::ZERO);
        let allowed_pullback = new_peak * locking.pullback_tolerance_pct;
        let mut elastic_lock = floor_lock.max(new_peak - allowed_pullback);

        let jump = profit_usd - state.last_applied_profit_usd;
        if jump >= locking.big_jump_threshold_usd {
            elastic_lock = new_peak - locking.big_jump_lock_margin_usd;
        }

        if new_peak >= PEAK_CAP_TRIGGER_USD {
            elastic_lock = elastic_lock.max(locking.max_peak_lock_usd);
        }

        let decision = sl_price_for_profit(
            position.direction,
            position.entry_price,
            elastic_lock,
            position.volume,
            contract_value,
        )
        .map_or(SlDecision::NoUpdate, |target_sl| SlDecision::Update {
            target_sl,
            locked_usd: elastic_lock,
            reason: SlReason::Trailing,
        });
        return Computed {
            decision,
            new_peak,
        };
    }

    Computed {
        decision: SlDecision::NoUpdate,
        new_peak: peak,
    }
}
