//! Entry sizing and order placement.
//!
//! Lot size starts from the configured default, floors at the broker's
//! minimum, and skips the symbol past the cap. The initial stop targets the
//! per-trade loss cap exactly; when the broker's stops distance forces a
//! wider stop, the widening is logged and accepted rather than placing an
//! order without a stop.

use std::sync::Arc;

use anyhow::Result;
use ratchet_broker::{Broker, OrderRequest, PlaceOutcome};
use ratchet_config::RiskConfig;
use ratchet_core::{
    normalize_price, sl_price_for_profit, Clock, Position, Price, Quote, SymbolInfo, Ticket,
    Volume,
};
use ratchet_engine::{EngineMetrics, PositionRegistry, SlApplicator};
use ratchet_gates::SignalCandidate;
use tracing::{info, warn};

/// What the entry attempt produced.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryResult {
    Entered {
        ticket: Ticket,
        volume: Volume,
        price: Price,
        initial_sl: Price,
    },
    /// The symbol cannot be sized within the lot cap.
    Skipped { reason: String },
    /// The broker refused the order.
    Rejected { reason: String },
}

/// Pick the lot size for a symbol, or `None` to skip it.
#[must_use]
pub fn size_lot(info: &SymbolInfo, risk: &RiskConfig) -> Option<Volume> {
    let mut lot = risk.default_lot;
    if info.min_lot > lot {
        lot = info.min_lot;
    }
    if lot > risk.max_lot_cap {
        return None;
    }
    Some(lot)
}

/// Places entries produced by the scan loop.
pub struct EntryEngine {
    broker: Arc<dyn Broker>,
    registry: Arc<PositionRegistry>,
    applicator: Arc<SlApplicator>,
    metrics: Arc<EngineMetrics>,
    clock: Clock,
    risk: RiskConfig,
}

impl EntryEngine {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<PositionRegistry>,
        applicator: Arc<SlApplicator>,
        metrics: Arc<EngineMetrics>,
        clock: Clock,
        risk: RiskConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            applicator,
            metrics,
            clock,
            risk,
        }
    }

    /// Size, derive the initial stop, and place a market order for a
    /// candidate that already passed the gates.
    pub async fn try_enter(
        &self,
        candidate: &SignalCandidate,
        info: &SymbolInfo,
        quote: &Quote,
    ) -> Result<EntryResult> {
        let Some(volume) = size_lot(info, &self.risk) else {
            let reason = format!(
                "min lot {} exceeds cap {}",
                info.min_lot, self.risk.max_lot_cap
            );
            info!(symbol = %candidate.symbol, %reason, "symbol skipped at sizing");
            return Ok(EntryResult::Skipped { reason });
        };

        let expected_entry = quote.opening_price(candidate.direction);
        let Some(raw_sl) = sl_price_for_profit(
            candidate.direction,
            expected_entry,
            -self.risk.max_risk_per_trade_usd,
            volume,
            info.contract_value,
        ) else {
            return Ok(EntryResult::Skipped {
                reason: "cannot derive initial SL".into(),
            });
        };
        let mut initial_sl = normalize_price(raw_sl, info.point);

        // Respect the broker's stops distance; widen past the loss cap when
        // unavoidable, never place without a stop.
        let min_distance = info.stops_level + quote.spread();
        let widened = match candidate.direction {
            ratchet_core::Direction::Long => {
                let max_allowed = normalize_price(quote.bid - min_distance, info.point);
                if initial_sl > max_allowed {
                    initial_sl = max_allowed;
                    true
                } else {
                    false
                }
            }
            ratchet_core::Direction::Short => {
                let min_allowed = normalize_price(quote.ask + min_distance, info.point);
                if initial_sl < min_allowed {
                    initial_sl = min_allowed;
                    true
                } else {
                    false
                }
            }
        };
        if widened {
            warn!(
                symbol = %candidate.symbol,
                %initial_sl,
                max_risk = %self.risk.max_risk_per_trade_usd,
                "initial SL widened beyond the loss cap by the stops level"
            );
        }

        let request = OrderRequest {
            symbol: candidate.symbol.clone(),
            direction: candidate.direction,
            volume,
            sl_price: initial_sl,
            tp_price: None,
            comment: format!("ratchet q{}", candidate.quality_score),
        };
        let outcome = self.broker.place_order(request).await?;

        let (ticket, filled_volume, fill_price) = match outcome {
            PlaceOutcome::Filled {
                ticket,
                volume,
                price,
            } => (ticket, volume, price),
            PlaceOutcome::Partial {
                ticket,
                volume: filled,
                price,
            } => {
                warn!(
                    symbol = %candidate.symbol,
                    requested = %volume,
                    filled = %filled,
                    "partial fill accepted; remainder discarded"
                );
                (ticket, filled, price)
            }
            PlaceOutcome::Rejected { reason } => {
                warn!(symbol = %candidate.symbol, %reason, "entry order rejected");
                return Ok(EntryResult::Rejected {
                    reason: reason.to_string(),
                });
            }
        };

        self.registry.insert(Position {
            ticket,
            symbol: candidate.symbol.clone(),
            direction: candidate.direction,
            entry_price: fill_price,
            volume: filled_volume,
            current_price: quote.closing_price(candidate.direction),
            current_sl: Some(initial_sl),
            opened_at: self.clock.wall(),
            version: 0,
        });
        self.applicator.init_state_after_fill(ticket, initial_sl);
        self.metrics.inc_entry();
        info!(
            ticket,
            symbol = %candidate.symbol,
            direction = ?candidate.direction,
            volume = %filled_volume,
            price = %fill_price,
            %initial_sl,
            "position opened"
        );

        Ok(EntryResult::Entered {
            ticket,
            volume: filled_volume,
            price: fill_price,
            initial_sl,
        })
    }
}
