//! Fatal-stop latch and the daily-loss stand-down.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use ratchet_core::Usd;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

/// Latched fatal stop. Activation halts the scan loop; the SL worker keeps
/// running until every position is accounted for or the drain deadline
/// passes.
#[derive(Default)]
pub struct KillSwitch {
    engaged: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl KillSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.engaged.swap(true, Ordering::SeqCst) {
            error!(%reason, "KILL SWITCH ACTIVATED");
            *self.reason.lock() = Some(reason);
        }
    }

    #[must_use]
    pub fn engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// Pauses entries after the realized daily PnL breaches a floor. SL
/// management is unaffected.
pub struct DailyLossTracker {
    floor: Usd,
    standdown_minutes: i64,
    state: Mutex<TrackerState>,
}

struct TrackerState {
    day: NaiveDate,
    realized: Usd,
    standdown_until: Option<DateTime<Utc>>,
}

impl DailyLossTracker {
    #[must_use]
    pub fn new(floor: Usd, standdown_minutes: i64, now: DateTime<Utc>) -> Self {
        Self {
            floor,
            standdown_minutes,
            state: Mutex::new(TrackerState {
                day: now.date_naive(),
                realized: Decimal::ZERO,
                standdown_until: None,
            }),
        }
    }

    /// Fold a realized closure into the day's PnL.
    pub fn record_closure(&self, profit: Usd, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        if state.day != now.date_naive() {
            state.day = now.date_naive();
            state.realized = Decimal::ZERO;
            state.standdown_until = None;
        }
        state.realized += profit;
        if state.realized <= self.floor && state.standdown_until.is_none() {
            let until = now + chrono::Duration::minutes(self.standdown_minutes);
            state.standdown_until = Some(until);
            warn!(
                realized = %state.realized,
                floor = %self.floor,
                until = %until,
                "daily loss floor breached; entries standing down"
            );
        }
    }

    /// Whether new entries are currently paused.
    #[must_use]
    pub fn entries_paused(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.day != now.date_naive() {
            state.day = now.date_naive();
            state.realized = Decimal::ZERO;
            state.standdown_until = None;
            return false;
        }
        match state.standdown_until {
            Some(until) if now < until => true,
            Some(_) => {
                state.standdown_until = None;
                false
            }
            None => false,
        }
    }

    #[must_use]
    pub fn realized_today(&self, now: DateTime<Utc>) -> Usd {
        let state = self.state.lock();
        if state.day == now.date_naive() {
            state.realized
        } else {
            Decimal::ZERO
        }
    }
}
