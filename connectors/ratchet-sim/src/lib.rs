//! Deterministic simulation broker.
//!
//! Behaviorally interchangeable with a live connector for the core: it
//! enforces the stops-level distance, supports scripted rejections and
//! partial fills, and triggers attached stops when a pushed quote crosses
//! them. Tests drive it by pushing quote sequences.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use ratchet_broker::{
    quote_age_ok, Broker, BrokerError, BrokerInfo, BrokerResult, CloseOutcome, ModifyOutcome,
    OrderRequest, PlaceOutcome, RejectReason,
};
use ratchet_core::{
    profit_usd, Direction, Position, Price, Quote, Symbol, SymbolInfo, Ticket, TradeMode, Usd,
};
use rust_decimal::Decimal;
use tracing::debug;

/// A position the simulator closed, with why and at what price.
#[derive(Clone, Debug)]
pub struct ClosedPosition {
    pub ticket: Ticket,
    pub symbol: Symbol,
    pub close_price: Price,
    pub profit: Usd,
    pub reason: String,
}

/// Scripted misbehavior for fault-injection tests.
#[derive(Debug, Default)]
pub struct Behavior {
    /// Reject this many upcoming `modify_sl` calls.
    pub reject_modifies: u32,
    /// Reason used for scripted modify rejections.
    pub modify_reject_reason: Option<RejectReason>,
    /// Fill only this fraction of requested order volume.
    pub partial_fill_ratio: Option<Decimal>,
    /// Reject this many upcoming `close_position` calls.
    pub reject_closes: u32,
    /// Reject every order placement.
    pub reject_orders: bool,
}

/// In-memory broker with scripted quotes.
pub struct SimBroker {
    symbols: Mutex<HashMap<Symbol, SymbolInfo>>,
    quotes: Mutex<HashMap<Symbol, Quote>>,
    positions: Mutex<HashMap<Ticket, Position>>,
    closed: Mutex<Vec<ClosedPosition>>,
    behavior: Mutex<Behavior>,
    next_ticket: AtomicU64,
}

impl SimBroker {
    #[must_use]
    pub fn new(symbols: Vec<SymbolInfo>) -> Self {
        let map = symbols
            .into_iter()
            .map(|info| (info.symbol.clone(), info))
            .collect();
        Self {
            symbols: Mutex::new(map),
            quotes: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            closed: Mutex::new(Vec::new()),
            behavior: Mutex::new(Behavior::default()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Update the quote for a symbol and trigger any stops it crosses.
    pub fn push_quote(&self, symbol: &str, bid: Price, ask: Price) {
        let quote = Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            timestamp: Utc::now(),
        };
        self.quotes.lock().insert(symbol.to_string(), quote);

        let contract_value = self
            .symbols
            .lock()
            .get(symbol)
            .map(|info| info.contract_value)
            .unwrap_or(Decimal::ONE);

        let mut positions = self.positions.lock();
        let mut triggered: Vec<Ticket> = Vec::new();
        for position in positions.values_mut() {
            if position.symbol != symbol {
                continue;
            }
            let closing = match position.direction {
                Direction::Long => bid,
                Direction::Short => ask,
            };
            position.current_price = closing;
            position.version += 1;
            if let Some(sl) = position.current_sl {
                let crossed = match position.direction {
                    Direction::Long => closing <= sl,
                    Direction::Short => closing >= sl,
                };
                if crossed {
                    triggered.push(position.ticket);
                }
            }
        }
        for ticket in triggered {
            if let Some(position) = positions.remove(&ticket) {
                let sl = position.current_sl.unwrap_or(position.current_price);
                let profit = profit_usd(
                    position.direction,
                    position.entry_price,
                    sl,
                    position.volume,
                    contract_value,
                );
                debug!(ticket, %sl, %profit, "sim stop triggered");
                self.closed.lock().push(ClosedPosition {
                    ticket,
                    symbol: position.symbol,
                    close_price: sl,
                    profit,
                    reason: "sl".into(),
                });
            }
        }
    }

    /// Place a position directly, bypassing the order path. Test helper.
    pub fn inject_position(&self, position: Position) {
        self.next_ticket
            .fetch_max(position.ticket + 1, Ordering::SeqCst);
        self.positions.lock().insert(position.ticket, position);
    }

    /// Script upcoming misbehavior.
    pub fn set_behavior(&self, update: impl FnOnce(&mut Behavior)) {
        update(&mut self.behavior.lock());
    }

    /// Positions the simulator has closed so far.
    #[must_use]
    pub fn closed(&self) -> Vec<ClosedPosition> {
        self.closed.lock().clone()
    }

    /// Direct view of an open position's SL. Test helper.
    #[must_use]
    pub fn position_sl(&self, ticket: Ticket) -> Option<Price> {
        self.positions.lock().get(&ticket).and_then(|p| p.current_sl)
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.positions.lock().len()
    }

    fn stops_distance(&self, info: &SymbolInfo, quote: &Quote) -> Price {
        info.stops_level + (quote.ask - quote.bid)
    }

    fn sl_respects_stops(&self, direction: Direction, sl: Price, quote: &Quote, info: &SymbolInfo) -> bool {
        let distance = self.stops_distance(info, quote);
        match direction {
            Direction::Long => sl <= quote.bid - distance,
            Direction::Short => sl >= quote.ask + distance,
        }
    }
}

#[async_trait]
impl Broker for SimBroker {
    fn info(&self) -> BrokerInfo {
        BrokerInfo {
            name: "sim".into(),
            simulated: true,
        }
    }

    async fn symbols(&self) -> BrokerResult<Vec<SymbolInfo>> {
        Ok(self.symbols.lock().values().cloned().collect())
    }

    async fn quote(&self, symbol: &str) -> BrokerResult<Quote> {
        let quote = self
            .quotes
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownSymbol(symbol.to_string()))?;
        quote_age_ok(&quote, Utc::now())?;
        Ok(quote)
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        Ok(self.positions.lock().values().cloned().collect())
    }

    async fn place_order(&self, request: OrderRequest) -> BrokerResult<PlaceOutcome> {
        if self.behavior.lock().reject_orders {
            return Ok(PlaceOutcome::Rejected {
                reason: RejectReason::Other("scripted rejection".into()),
            });
        }
        let info = self
            .symbols
            .lock()
            .get(&request.symbol)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownSymbol(request.symbol.clone()))?;
        if info.trade_mode != TradeMode::Full {
            return Ok(PlaceOutcome::Rejected {
                reason: RejectReason::TradeDisabled,
            });
        }
        if request.volume < info.min_lot {
            return Ok(PlaceOutcome::Rejected {
                reason: RejectReason::InvalidVolume,
            });
        }
        let quote = self.quote(&request.symbol).await?;
        if !self.sl_respects_stops(request.direction, request.sl_price, &quote, &info) {
            return Ok(PlaceOutcome::Rejected {
                reason: RejectReason::StopsLevel,
            });
        }

        let ratio = self.behavior.lock().partial_fill_ratio;
        let (filled, partial) = match ratio {
            Some(ratio) if ratio < Decimal::ONE => {
                let stepped = ((request.volume * ratio) / info.lot_step).floor() * info.lot_step;
                (stepped.max(info.min_lot), true)
            }
            _ => (request.volume, false),
        };

        let price = quote.opening_price(request.direction);
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let position = Position {
            ticket,
            symbol: request.symbol.clone(),
            direction: request.direction,
            entry_price: price,
            volume: filled,
            current_price: quote.closing_price(request.direction),
            current_sl: Some(request.sl_price),
            opened_at: Utc::now(),
            version: 0,
        };
        self.positions.lock().insert(ticket, position);
        debug!(ticket, symbol = %request.symbol, volume = %filled, partial, "sim order filled");

        Ok(if partial {
            PlaceOutcome::Partial {
                ticket,
                volume: filled,
                price,
            }
        } else {
            PlaceOutcome::Filled {
                ticket,
                volume: filled,
                price,
            }
        })
    }

    async fn modify_sl(&self, ticket: Ticket, sl_price: Price) -> BrokerResult<ModifyOutcome> {
        {
            let mut behavior = self.behavior.lock();
            if behavior.reject_modifies > 0 {
                behavior.reject_modifies -= 1;
                let reason = behavior
                    .modify_reject_reason
                    .clone()
                    .unwrap_or(RejectReason::Other("scripted rejection".into()));
                return Ok(ModifyOutcome::Rejected { reason });
            }
        }

        let (symbol, direction) = {
            let positions = self.positions.lock();
            let Some(position) = positions.get(&ticket) else {
                return Ok(ModifyOutcome::Rejected {
                    reason: RejectReason::PositionClosed,
                });
            };
            (position.symbol.clone(), position.direction)
        };
        let info = self
            .symbols
            .lock()
            .get(&symbol)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownSymbol(symbol.clone()))?;
        let quote = self
            .quotes
            .lock()
            .get(&symbol)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownSymbol(symbol.clone()))?;
        if !self.sl_respects_stops(direction, sl_price, &quote, &info) {
            return Ok(ModifyOutcome::Rejected {
                reason: RejectReason::StopsLevel,
            });
        }
        let mut positions = self.positions.lock();
        let Some(position) = positions.get_mut(&ticket) else {
            return Ok(ModifyOutcome::Rejected {
                reason: RejectReason::PositionClosed,
            });
        };
        position.current_sl = Some(sl_price);
        position.version += 1;
        Ok(ModifyOutcome::Ok)
    }

    async fn close_position(&self, ticket: Ticket, comment: &str) -> BrokerResult<CloseOutcome> {
        {
            let mut behavior = self.behavior.lock();
            if behavior.reject_closes > 0 {
                behavior.reject_closes -= 1;
                return Ok(CloseOutcome::Rejected {
                    reason: RejectReason::Other("scripted rejection".into()),
                });
            }
        }
        let Some(position) = self.positions.lock().remove(&ticket) else {
            return Ok(CloseOutcome::Rejected {
                reason: RejectReason::PositionClosed,
            });
        };
        let contract_value = self
            .symbols
            .lock()
            .get(&position.symbol)
            .map(|info| info.contract_value)
            .unwrap_or(Decimal::ONE);
        let profit = profit_usd(
            position.direction,
            position.entry_price,
            position.current_price,
            position.volume,
            contract_value,
        );
        self.closed.lock().push(ClosedPosition {
            ticket,
            symbol: position.symbol,
            close_price: position.current_price,
            profit,
            reason: comment.to_string(),
        });
        Ok(CloseOutcome::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn eurusd() -> SymbolInfo {
        SymbolInfo {
            symbol: "EURUSD".into(),
            min_lot: d("0.01"),
            lot_step: d("0.01"),
            contract_value: d("100000"),
            point: d("0.0001"),
            stops_level: d("0.0002"),
            trade_mode: TradeMode::Full,
            swap_free: true,
        }
    }

    fn order(sl: &str) -> OrderRequest {
        OrderRequest {
            symbol: "EURUSD".into(),
            direction: Direction::Long,
            volume: d("0.01"),
            sl_price: d(sl),
            tp_price: None,
            comment: "test".into(),
        }
    }

    #[tokio::test]
    async fn orders_fill_at_the_opening_side() {
        let sim = SimBroker::new(vec![eurusd()]);
        sim.push_quote("EURUSD", d("1.1000"), d("1.1002"));
        let outcome = sim.place_order(order("1.0950")).await.unwrap();
        match outcome {
            PlaceOutcome::Filled { price, volume, .. } => {
                assert_eq!(price, d("1.1002"));
                assert_eq!(volume, d("0.01"));
            }
            other => panic!("expected full fill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_ratio_fills_the_reported_portion() {
        let sim = SimBroker::new(vec![eurusd()]);
        sim.push_quote("EURUSD", d("1.1000"), d("1.1002"));
        sim.set_behavior(|b| b.partial_fill_ratio = Some(d("0.5")));
        let outcome = sim
            .place_order(OrderRequest {
                volume: d("0.04"),
                ..order("1.0950")
            })
            .await
            .unwrap();
        match outcome {
            PlaceOutcome::Partial { volume, .. } => assert_eq!(volume, d("0.02")),
            other => panic!("expected partial fill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sl_too_close_to_price_is_rejected() {
        let sim = SimBroker::new(vec![eurusd()]);
        sim.push_quote("EURUSD", d("1.1000"), d("1.1002"));
        let ticket = match sim.place_order(order("1.0950")).await.unwrap() {
            PlaceOutcome::Filled { ticket, .. } => ticket,
            other => panic!("unexpected {other:?}"),
        };
        let outcome = sim.modify_sl(ticket, d("1.0999")).await.unwrap();
        assert_eq!(
            outcome,
            ModifyOutcome::Rejected {
                reason: RejectReason::StopsLevel
            }
        );
    }

    #[tokio::test]
    async fn quote_crossing_the_stop_closes_the_position() {
        let sim = SimBroker::new(vec![eurusd()]);
        sim.push_quote("EURUSD", d("1.1000"), d("1.1002"));
        let ticket = match sim.place_order(order("1.0950")).await.unwrap() {
            PlaceOutcome::Filled { ticket, .. } => ticket,
            other => panic!("unexpected {other:?}"),
        };
        sim.push_quote("EURUSD", d("1.0949"), d("1.0951"));
        assert_eq!(sim.open_count(), 0);
        let closed = sim.closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].ticket, ticket);
        assert_eq!(closed[0].reason, "sl");
        assert_eq!(closed[0].close_price, d("1.0950"));
    }

    #[tokio::test]
    async fn scripted_modify_rejections_run_out() {
        let sim = SimBroker::new(vec![eurusd()]);
        sim.push_quote("EURUSD", d("1.1000"), d("1.1002"));
        let ticket = match sim.place_order(order("1.0950")).await.unwrap() {
            PlaceOutcome::Filled { ticket, .. } => ticket,
            other => panic!("unexpected {other:?}"),
        };
        sim.set_behavior(|b| b.reject_modifies = 1);
        assert!(matches!(
            sim.modify_sl(ticket, d("1.0960")).await.unwrap(),
            ModifyOutcome::Rejected { .. }
        ));
        assert_eq!(sim.modify_sl(ticket, d("1.0960")).await.unwrap(), ModifyOutcome::Ok);
        assert_eq!(sim.position_sl(ticket), Some(d("1.0960")));
    }
}
