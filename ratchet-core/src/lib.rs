//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod clock;

pub use clock::{Clock, ManualClock};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for lot/volume precision.
pub type Volume = Decimal;
/// Alias for profit amounts expressed in the account currency.
pub type Usd = Decimal;
/// Alias used for human-readable market symbols (e.g., `EURUSD`).
pub type Symbol = String;
/// Broker-assigned identifier for an open position.
pub type Ticket = u64;

/// The direction of a position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Direction {
    /// Profits when the price rises.
    Long,
    /// Profits when the price falls.
    Short,
}

impl Direction {
    /// Returns the opposite direction.
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Sign multiplier applied to price moves when computing profit.
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Whether the broker currently accepts orders for a symbol.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeMode {
    /// Orders in both directions are accepted.
    Full,
    /// Only position-reducing orders are accepted.
    CloseOnly,
    /// Trading is disabled for this symbol.
    Disabled,
}

/// Immutable metadata describing a tradable symbol as reported by the broker.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SymbolInfo {
    pub symbol: Symbol,
    /// Smallest order volume the broker accepts.
    pub min_lot: Volume,
    /// Volume granularity.
    pub lot_step: Volume,
    /// Account-currency value of a one-point move for one lot.
    ///
    /// Cross-quoted conversions are the connector's responsibility; the core
    /// only ever multiplies by this value.
    pub contract_value: Price,
    /// Smallest representable price increment.
    pub point: Price,
    /// Minimum distance between the current price and any SL/TP, in price units.
    pub stops_level: Price,
    pub trade_mode: TradeMode,
    /// Whether the symbol carries no overnight swap charges.
    pub swap_free: bool,
}

impl SymbolInfo {
    /// Spread of a quote expressed in points of this symbol.
    #[must_use]
    pub fn spread_points(&self, quote: &Quote) -> Decimal {
        if self.point.is_zero() {
            return Decimal::ZERO;
        }
        (quote.ask - quote.bid) / self.point
    }
}

/// A two-sided quote snapshot.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid: Price,
    pub ask: Price,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// The price at which a position of the given direction would close.
    #[must_use]
    pub fn closing_price(&self, direction: Direction) -> Price {
        match direction {
            Direction::Long => self.bid,
            Direction::Short => self.ask,
        }
    }

    /// The price at which a new position of the given direction would open.
    #[must_use]
    pub fn opening_price(&self, direction: Direction) -> Price {
        match direction {
            Direction::Long => self.ask,
            Direction::Short => self.bid,
        }
    }

    /// Absolute bid/ask spread in price units.
    #[must_use]
    pub fn spread(&self) -> Price {
        self.ask - self.bid
    }
}

/// An open position as mirrored by the registry.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub ticket: Ticket,
    pub symbol: Symbol,
    pub direction: Direction,
    pub entry_price: Price,
    pub volume: Volume,
    /// Last known quote for the side used to compute closing profit.
    pub current_price: Price,
    /// Broker-reported stop-loss, if one is attached.
    pub current_sl: Option<Price>,
    pub opened_at: DateTime<Utc>,
    /// Incremented on any observed change.
    pub version: u64,
}

impl Position {
    /// Unrealized profit in account currency at the given closing price.
    #[must_use]
    pub fn profit_at(&self, price: Price, contract_value: Price) -> Usd {
        profit_usd(
            self.direction,
            self.entry_price,
            price,
            self.volume,
            contract_value,
        )
    }

    /// Unrealized profit at the last known price.
    #[must_use]
    pub fn profit(&self, contract_value: Price) -> Usd {
        self.profit_at(self.current_price, contract_value)
    }
}

/// Profit in account currency for a move from `entry` to `price`.
#[must_use]
pub fn profit_usd(
    direction: Direction,
    entry: Price,
    price: Price,
    volume: Volume,
    contract_value: Price,
) -> Usd {
    (price - entry) * contract_value * volume * direction.sign()
}

/// The SL price at which the position would realize `target_usd` profit.
///
/// Negative targets yield an SL on the losing side of the entry; positive
/// targets lock profit. Returns `None` when the position parameters cannot
/// support the conversion.
#[must_use]
pub fn sl_price_for_profit(
    direction: Direction,
    entry: Price,
    target_usd: Usd,
    volume: Volume,
    contract_value: Price,
) -> Option<Price> {
    let denom = volume * contract_value;
    if denom <= Decimal::ZERO {
        return None;
    }
    let diff = target_usd / denom;
    Some(match direction {
        Direction::Long => entry + diff,
        Direction::Short => entry - diff,
    })
}

/// Profit that would be realized if the position closed at `sl`.
#[must_use]
pub fn locked_profit_usd(
    direction: Direction,
    entry: Price,
    sl: Price,
    volume: Volume,
    contract_value: Price,
) -> Usd {
    profit_usd(direction, entry, sl, volume, contract_value)
}

/// Whether SL price `a` protects at least as much as `b` for the direction.
#[must_use]
pub fn at_least_as_protective(direction: Direction, a: Price, b: Price) -> bool {
    match direction {
        Direction::Long => a >= b,
        Direction::Short => a <= b,
    }
}

/// Whether SL price `a` protects strictly more than `b` for the direction.
#[must_use]
pub fn more_protective(direction: Direction, a: Price, b: Price) -> bool {
    match direction {
        Direction::Long => a > b,
        Direction::Short => a < b,
    }
}

/// Round an SL price to the symbol's point grid.
#[must_use]
pub fn normalize_price(price: Price, point: Price) -> Price {
    if point.is_zero() {
        return price;
    }
    (price / point).round() * point
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn long_profit_rises_with_price() {
        let profit = profit_usd(Direction::Long, d("1.1000"), d("1.1010"), d("0.01"), d("100000"));
        assert_eq!(profit, d("1.00"));
    }

    #[test]
    fn short_profit_is_negated() {
        let profit = profit_usd(Direction::Short, d("1.1000"), d("1.1010"), d("0.01"), d("100000"));
        assert_eq!(profit, d("-1.00"));
    }

    #[test]
    fn sl_for_profit_round_trips() {
        let entry = d("1.1000");
        let sl = sl_price_for_profit(Direction::Long, entry, d("-2.00"), d("0.01"), d("100000"))
            .unwrap();
        assert_eq!(sl, d("1.0980"));
        let locked = locked_profit_usd(Direction::Long, entry, sl, d("0.01"), d("100000"));
        assert_eq!(locked, d("-2.00"));
    }

    #[test]
    fn sl_for_profit_short_side() {
        let entry = d("1.1000");
        let sl = sl_price_for_profit(Direction::Short, entry, d("0.10"), d("0.01"), d("100000"))
            .unwrap();
        assert_eq!(sl, d("1.0999"));
    }

    #[test]
    fn sl_for_profit_rejects_zero_volume() {
        assert!(
            sl_price_for_profit(Direction::Long, d("1.1"), d("1"), Decimal::ZERO, d("100000"))
                .is_none()
        );
    }

    #[test]
    fn protective_ordering_depends_on_direction() {
        assert!(at_least_as_protective(Direction::Long, d("1.2"), d("1.1")));
        assert!(!at_least_as_protective(Direction::Long, d("1.1"), d("1.2")));
        assert!(at_least_as_protective(Direction::Short, d("1.1"), d("1.2")));
        assert!(at_least_as_protective(Direction::Long, d("1.1"), d("1.1")));
    }

    #[test]
    fn normalize_snaps_to_point_grid() {
        assert_eq!(normalize_price(d("1.10003"), d("0.0001")), d("1.1000"));
        assert_eq!(normalize_price(d("1.10007"), d("0.0001")), d("1.1001"));
    }
}
