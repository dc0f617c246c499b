//! Broker-agnostic traits used by the rest of the framework.
//!
//! The core never talks to a venue directly; it consumes this capability
//! set through two behaviorally interchangeable implementations (live and
//! simulation).

use async_trait::async_trait;
use chrono::Duration;
use ratchet_core::{Direction, Position, Price, Quote, Symbol, SymbolInfo, Ticket, Volume};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod limiter;

pub use governor::Quota;
pub use limiter::RpcLimiter;

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Quotes older than this are rejected as stale.
pub const MAX_QUOTE_AGE_SECS: i64 = 5;

/// Common error type returned by broker implementations.
///
/// These are transport-level or environmental failures. Business rejections
/// (a refused SL, an unfillable order) travel in the outcome enums instead.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Network failures, timeouts, lost connections.
    #[error("transport error: {0}")]
    Transport(String),
    /// The venue does not know the requested symbol.
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(Symbol),
    /// The last quote for the symbol is older than [`MAX_QUOTE_AGE_SECS`].
    #[error("stale quote for '{symbol}': {age_ms} ms old")]
    StaleQuote { symbol: Symbol, age_ms: i64 },
    /// The connection is permanently gone; triggers the kill switch.
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

/// Metadata describing a connector.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerInfo {
    pub name: String,
    pub simulated: bool,
}

/// Request to open a market position with a mandatory protective stop.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub direction: Direction,
    pub volume: Volume,
    /// Protective stop; the system never places an order without one.
    pub sl_price: Price,
    pub tp_price: Option<Price>,
    pub comment: String,
}

/// Result of placing an order.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaceOutcome {
    /// Fully filled at the reported volume and price.
    Filled {
        ticket: Ticket,
        volume: Volume,
        price: Price,
    },
    /// Partially filled; the remainder is discarded by the caller.
    Partial {
        ticket: Ticket,
        volume: Volume,
        price: Price,
    },
    /// The venue refused the order.
    Rejected { reason: RejectReason },
}

/// Result of a stop-loss modification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModifyOutcome {
    Ok,
    Rejected { reason: RejectReason },
}

/// Result of a position closure request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    Ok,
    Rejected { reason: RejectReason },
}

/// Business reasons a venue refuses a request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RejectReason {
    /// The SL/TP violates the minimum stops distance.
    StopsLevel,
    /// The position no longer exists.
    PositionClosed,
    /// Trading is disabled for the symbol.
    TradeDisabled,
    /// Not enough margin or volume out of bounds.
    InvalidVolume,
    Other(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopsLevel => write!(f, "stops level violated"),
            Self::PositionClosed => write!(f, "position closed"),
            Self::TradeDisabled => write!(f, "trade disabled"),
            Self::InvalidVolume => write!(f, "invalid volume"),
            Self::Other(reason) => write!(f, "{reason}"),
        }
    }
}

/// Capability set the core requires from any venue connector.
///
/// Implementations are blocking-per-call but expected to return quickly; the
/// core owns all scheduling and retry policy. No implementation may be
/// assumed thread-affine.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Metadata about the connector for logs and telemetry.
    fn info(&self) -> BrokerInfo;

    /// All tradable symbols with their constraints.
    async fn symbols(&self) -> BrokerResult<Vec<SymbolInfo>>;

    /// Latest two-sided quote; fails with [`BrokerError::StaleQuote`] when
    /// the venue's snapshot is older than [`MAX_QUOTE_AGE_SECS`].
    async fn quote(&self, symbol: &str) -> BrokerResult<Quote>;

    /// All currently open positions.
    async fn positions(&self) -> BrokerResult<Vec<Position>>;

    /// Place a market order carrying a protective stop.
    async fn place_order(&self, request: OrderRequest) -> BrokerResult<PlaceOutcome>;

    /// Move the stop-loss of an open position.
    async fn modify_sl(&self, ticket: Ticket, sl_price: Price) -> BrokerResult<ModifyOutcome>;

    /// Close an open position at market.
    async fn close_position(&self, ticket: Ticket, comment: &str) -> BrokerResult<CloseOutcome>;
}

/// Check a quote timestamp against the staleness budget.
pub fn quote_age_ok(quote: &Quote, now: chrono::DateTime<chrono::Utc>) -> Result<(), BrokerError> {
    let age = now - quote.timestamp;
    if age > Duration::seconds(MAX_QUOTE_AGE_SECS) {
        return Err(BrokerError::StaleQuote {
            symbol: quote.symbol.clone(),
            age_ms: age.num_milliseconds(),
        });
    }
    Ok(())
}
