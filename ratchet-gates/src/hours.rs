//! Per-symbol market hours.
//!
//! The pipeline only needs the time remaining until the next close, if the
//! market closes at all.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};

/// Source of per-symbol close times.
pub trait MarketHours: Send + Sync {
    /// Time remaining until the symbol's market closes, or `None` for
    /// markets that never close (crypto).
    fn time_to_close(&self, symbol: &str, now: DateTime<Utc>) -> Option<Duration>;
}

/// Market with no close. Suitable for 24/7 venues.
pub struct AlwaysOpen;

impl MarketHours for AlwaysOpen {
    fn time_to_close(&self, _symbol: &str, _now: DateTime<Utc>) -> Option<Duration> {
        None
    }
}

/// Market that closes once a week, e.g. FX closing Friday 21:00 UTC.
pub struct WeeklyClose {
    weekday: Weekday,
    time: NaiveTime,
}

impl WeeklyClose {
    #[must_use]
    pub fn new(weekday: Weekday, time: NaiveTime) -> Self {
        Self { weekday, time }
    }

    /// Conventional FX week: closes Friday 21:00 UTC.
    #[must_use]
    pub fn fx() -> Self {
        Self::new(Weekday::Fri, NaiveTime::from_hms_opt(21, 0, 0).expect("valid time"))
    }

    /// Test helper: a market closing `delta` after `now`.
    #[must_use]
    pub fn closing_in(delta: Duration, now: DateTime<Utc>) -> Self {
        let close = now + delta;
        Self::new(close.weekday(), close.time())
    }
}

impl MarketHours for WeeklyClose {
    fn time_to_close(&self, _symbol: &str, now: DateTime<Utc>) -> Option<Duration> {
        let days_ahead = (7 + self.weekday.num_days_from_monday() as i64
            - now.weekday().num_days_from_monday() as i64)
            % 7;
        let candidate = (now + Duration::days(days_ahead))
            .date_naive()
            .and_time(self.time)
            .and_utc();
        let close = if candidate <= now {
            candidate + Duration::days(7)
        } else {
            candidate
        };
        Some(close - now)
    }
}
