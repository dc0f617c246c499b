//! Entry gate pipeline.
//!
//! Gates run in a fixed order during market scans; the first failure
//! short-circuits with a structured rejection reason. Order: tradability
//! (trade mode + spread), market-close proximity, bar volume, news window,
//! quality score, portfolio cap.

use chrono::{DateTime, Duration, Utc};
use ratchet_config::GateConfig;
use ratchet_core::{Direction, Quote, Symbol, SymbolInfo, TradeMode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod hours;
mod news;

pub use hours::{AlwaysOpen, MarketHours, WeeklyClose};
pub use news::{NewsCalendar, NewsEvent, NewsImpact, StaticNewsCalendar};

/// A candidate produced by the external signal generator.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignalCandidate {
    pub symbol: Symbol,
    pub direction: Direction,
    pub quality_score: u32,
    /// Volume of the most recent bar, as supplied by the signal source.
    pub bar_volume: Decimal,
}

/// Structured rejection emitted by the first failing gate.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Rejection {
    #[error("TRADE_MODE: {symbol} is not fully tradable ({mode:?})")]
    TradeMode { symbol: Symbol, mode: TradeMode },
    #[error("RISK_CHECK_SPREAD: {symbol} spread {spread_points} points exceeds ceiling {ceiling_points}")]
    Spread {
        symbol: Symbol,
        spread_points: Decimal,
        ceiling_points: Decimal,
    },
    #[error("MARKET_CLOSE: {symbol} closes in {minutes_to_close} min (buffer {buffer_minutes} min)")]
    MarketClose {
        symbol: Symbol,
        minutes_to_close: i64,
        buffer_minutes: i64,
    },
    #[error("VOLUME: {symbol} bar volume {volume} below minimum {minimum}")]
    Volume {
        symbol: Symbol,
        volume: Decimal,
        minimum: Decimal,
    },
    #[error("NEWS_WINDOW: {symbol} has a high-impact event within {window_minutes} min")]
    News {
        symbol: Symbol,
        window_minutes: i64,
    },
    #[error("QUALITY_SCORE: {score} below minimum {minimum}")]
    Quality { score: u32, minimum: u32 },
    #[error("PORTFOLIO_CAP: {open} open trades at the cap of {cap}")]
    PortfolioCap { open: usize, cap: u32 },
    #[error("COMPLIANCE: {symbol} is not swap-free")]
    SwapFree { symbol: Symbol },
}

impl Rejection {
    /// Short gate identifier for metrics labels.
    #[must_use]
    pub fn gate(&self) -> &'static str {
        match self {
            Self::TradeMode { .. } => "trade_mode",
            Self::Spread { .. } => "spread",
            Self::MarketClose { .. } => "market_close",
            Self::Volume { .. } => "volume",
            Self::News { .. } => "news",
            Self::Quality { .. } => "quality",
            Self::PortfolioCap { .. } => "portfolio_cap",
            Self::SwapFree { .. } => "swap_free",
        }
    }
}

/// Broad symbol class used to pick a spread ceiling.
fn spread_ceiling(config: &GateConfig, symbol: &str) -> Decimal {
    const MAJORS: [&str; 7] = [
        "EURUSD", "GBPUSD", "USDJPY", "USDCHF", "AUDUSD", "USDCAD", "NZDUSD",
    ];
    if MAJORS.contains(&symbol) {
        config.spread.majors_points
    } else if symbol.contains("BTC") || symbol.contains("ETH") || symbol.ends_with("USDT") {
        config.spread.crypto_points
    } else {
        config.spread.default_points
    }
}

/// The fixed-order entry gate pipeline.
pub struct FilterPipeline {
    config: GateConfig,
    hours: Box<dyn MarketHours>,
    news: Box<dyn NewsCalendar>,
    max_open_trades: Option<u32>,
    require_swap_free: bool,
}

impl FilterPipeline {
    #[must_use]
    pub fn new(
        config: GateConfig,
        hours: Box<dyn MarketHours>,
        news: Box<dyn NewsCalendar>,
        max_open_trades: Option<u32>,
        require_swap_free: bool,
    ) -> Self {
        Self {
            config,
            hours,
            news,
            max_open_trades,
            require_swap_free,
        }
    }

    /// Evaluate every gate for a candidate. First failure wins.
    pub fn evaluate(
        &self,
        candidate: &SignalCandidate,
        info: &SymbolInfo,
        quote: &Quote,
        open_positions: usize,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        // 1. Tradability: trade mode, swap-free compliance, spread ceiling.
        if info.trade_mode != TradeMode::Full {
            return Err(Rejection::TradeMode {
                symbol: candidate.symbol.clone(),
                mode: info.trade_mode,
            });
        }
        if self.require_swap_free && !info.swap_free {
            return Err(Rejection::SwapFree {
                symbol: candidate.symbol.clone(),
            });
        }
        let spread_points = info.spread_points(quote);
        let ceiling = spread_ceiling(&self.config, &candidate.symbol);
        if spread_points > ceiling {
            return Err(Rejection::Spread {
                symbol: candidate.symbol.clone(),
                spread_points,
                ceiling_points: ceiling,
            });
        }

        // 2. Market-close proximity.
        if let Some(to_close) = self.hours.time_to_close(&candidate.symbol, now) {
            let buffer = Duration::minutes(self.config.market_close_buffer_minutes);
            if to_close <= buffer {
                return Err(Rejection::MarketClose {
                    symbol: candidate.symbol.clone(),
                    minutes_to_close: to_close.num_minutes(),
                    buffer_minutes: self.config.market_close_buffer_minutes,
                });
            }
        }

        // 3. Bar volume.
        if candidate.bar_volume < self.config.min_bar_volume {
            return Err(Rejection::Volume {
                symbol: candidate.symbol.clone(),
                volume: candidate.bar_volume,
                minimum: self.config.min_bar_volume,
            });
        }

        // 4. News window.
        let window = Duration::minutes(self.config.news_block_window_minutes);
        if self.news.has_high_impact_event(&candidate.symbol, now, window) {
            return Err(Rejection::News {
                symbol: candidate.symbol.clone(),
                window_minutes: self.config.news_block_window_minutes,
            });
        }

        // 5. Quality score.
        if candidate.quality_score < self.config.min_quality_score {
            return Err(Rejection::Quality {
                score: candidate.quality_score,
                minimum: self.config.min_quality_score,
            });
        }

        // 6. Portfolio cap.
        if let Some(cap) = self.max_open_trades {
            if open_positions >= cap as usize {
                return Err(Rejection::PortfolioCap {
                    open: open_positions,
                    cap,
                });
            }
        }

        debug!(symbol = %candidate.symbol, score = candidate.quality_score, "candidate passed all gates");
        Ok(())
    }
}
