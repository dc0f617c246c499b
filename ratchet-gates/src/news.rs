//! News calendar abstraction.
//!
//! The concrete feed (API polling, file import) lives outside the core; the
//! pipeline only asks whether a high-impact event falls inside the blocking
//! window for a symbol's currencies.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Reported impact of a calendar event.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsImpact {
    Low,
    Medium,
    High,
}

/// A scheduled economic event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewsEvent {
    /// Currency code the event concerns (e.g. `USD`).
    pub currency: String,
    pub title: String,
    pub impact: NewsImpact,
    pub at: DateTime<Utc>,
}

/// Source of upcoming calendar events.
pub trait NewsCalendar: Send + Sync {
    /// Whether a high-impact event for one of the symbol's currencies falls
    /// within `window` of `now`, in either direction.
    fn has_high_impact_event(&self, symbol: &str, now: DateTime<Utc>, window: Duration) -> bool;
}

/// Currencies a symbol exposes, derived from its conventional 6-letter name.
#[must_use]
pub fn symbol_currencies(symbol: &str) -> Vec<String> {
    if symbol.len() >= 6 && symbol.chars().take(6).all(|c| c.is_ascii_alphabetic()) {
        vec![symbol[..3].to_uppercase(), symbol[3..6].to_uppercase()]
    } else {
        vec![symbol.to_uppercase()]
    }
}

/// Fixed in-memory calendar; also the test double.
#[derive(Default)]
pub struct StaticNewsCalendar {
    events: Vec<NewsEvent>,
}

impl StaticNewsCalendar {
    #[must_use]
    pub fn new(events: Vec<NewsEvent>) -> Self {
        Self { events }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

impl NewsCalendar for StaticNewsCalendar {
    fn has_high_impact_event(&self, symbol: &str, now: DateTime<Utc>, window: Duration) -> bool {
        let currencies = symbol_currencies(symbol);
        self.events.iter().any(|event| {
            event.impact == NewsImpact::High
                && currencies.iter().any(|c| *c == event.currency)
                && (event.at - now).abs() <= window
        })
    }
}
