//! Per-ticket SL state owned by the application engine.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use ratchet_core::{Price, Ticket, Usd};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Why an SL value was applied.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlReason {
    StrictLoss,
    SweetSpot,
    Trailing,
    Emergency,
}

impl SlReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrictLoss => "STRICT_LOSS",
            Self::SweetSpot => "SWEET_SPOT",
            Self::Trailing => "TRAILING",
            Self::Emergency => "EMERGENCY",
        }
    }
}

/// Mutable SL tracking for one ticket.
///
/// Mutated only by the application engine while holding the ticket lock;
/// the emergency path writes through the same store after its lone RPC.
#[derive(Clone, Debug, Default)]
pub struct SlState {
    /// High-water mark of profit since open; never decreases.
    pub peak_profit_usd: Usd,
    pub last_applied_sl: Option<Price>,
    pub last_applied_reason: Option<SlReason>,
    /// Profit at the moment of the last successful apply; feeds big-jump
    /// detection.
    pub last_applied_profit_usd: Usd,
    /// Monotonic timestamp of the last RPC attempt, successful or not.
    pub last_attempt: Option<Duration>,
    pub consecutive_failures: u32,
    pub circuit_open_until: Option<Duration>,
    /// First time profit was observed inside the sweet spot; cleared on the
    /// first successful sweet-spot apply after recording the activation time.
    pub sweet_spot_entered: Option<Duration>,
    pub verification_pending: bool,
    pub verification_failures: u32,
    pub first_verification_failure: Option<Duration>,
    /// Set after a long horizon of verification failures; requires operator
    /// reset.
    pub disabled: bool,
}

impl SlState {
    /// Whether the position already carries a profit-protecting stop.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        matches!(
            self.last_applied_reason,
            Some(SlReason::SweetSpot) | Some(SlReason::Trailing)
        )
    }
}

/// Read-only copy handed to the computation engine and the closure engines.
pub type SlStateView = SlState;

/// Store of per-ticket SL states.
#[derive(Default)]
pub struct StateStore {
    inner: Mutex<HashMap<Ticket, SlState>>,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the state for a ticket, creating the default lazily.
    #[must_use]
    pub fn view(&self, ticket: Ticket) -> SlStateView {
        self.inner.lock().entry(ticket).or_default().clone()
    }

    /// Snapshot without creating an entry.
    #[must_use]
    pub fn peek(&self, ticket: Ticket) -> Option<SlStateView> {
        self.inner.lock().get(&ticket).cloned()
    }

    /// Ensure a default entry exists (used when backfilling positions).
    pub fn ensure_default(&self, ticket: Ticket) {
        self.inner.lock().entry(ticket).or_default();
    }

    pub fn remove(&self, ticket: Ticket) -> Option<SlState> {
        self.inner.lock().remove(&ticket)
    }

    /// Count of tickets whose circuit is currently open.
    #[must_use]
    pub fn open_circuits(&self, now: Duration) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|state| state.circuit_open_until.is_some_and(|until| now < until))
            .count()
    }

    /// Raise the profit high-water mark; never lowers it.
    pub fn raise_peak(&self, ticket: Ticket, peak: Usd) {
        let mut map = self.inner.lock();
        let state = map.entry(ticket).or_default();
        if peak > state.peak_profit_usd {
            state.peak_profit_usd = peak;
        }
    }

    /// Record the first observation of profit inside the sweet spot.
    pub fn note_sweet_spot_entry(&self, ticket: Ticket, now: Duration) {
        let mut map = self.inner.lock();
        let state = map.entry(ticket).or_default();
        if state.sweet_spot_entered.is_none() && !state.is_protected() {
            state.sweet_spot_entered = Some(now);
        }
    }

    /// Anchor the per-ticket min-interval throttle. Set once per RPC series,
    /// irrespective of retries.
    pub fn mark_attempt(&self, ticket: Ticket, now: Duration) {
        let mut map = self.inner.lock();
        map.entry(ticket).or_default().last_attempt = Some(now);
    }

    /// One rejected/failed RPC attempt; opens the circuit at the threshold.
    /// Returns the updated consecutive-failure count.
    pub fn record_failure(
        &self,
        ticket: Ticket,
        now: Duration,
        threshold: u32,
        cooloff: Duration,
    ) -> u32 {
        let mut map = self.inner.lock();
        let state = map.entry(ticket).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= threshold {
            state.circuit_open_until = Some(now + cooloff);
        }
        state.consecutive_failures
    }

    /// Record a successful apply and return the sweet-spot activation time,
    /// if this apply completed a pending sweet-spot entry.
    pub fn record_success(
        &self,
        ticket: Ticket,
        applied_sl: Price,
        reason: SlReason,
        profit: Usd,
        now: Duration,
    ) -> Option<Duration> {
        let mut map = self.inner.lock();
        let state = map.entry(ticket).or_default();
        state.last_applied_sl = Some(applied_sl);
        state.last_applied_reason = Some(reason);
        state.last_applied_profit_usd = profit;
        state.consecutive_failures = 0;
        state.circuit_open_until = None;
        state.verification_pending = true;
        if reason == SlReason::SweetSpot {
            if let Some(entered) = state.sweet_spot_entered.take() {
                return Some(now.saturating_sub(entered));
            }
        }
        None
    }

    /// Verification observed the applied value at the broker.
    pub fn verification_ok(&self, ticket: Ticket) {
        let mut map = self.inner.lock();
        if let Some(state) = map.get_mut(&ticket) {
            state.verification_pending = false;
            state.verification_failures = 0;
            state.first_verification_failure = None;
        }
    }

    /// Position vanished before verification could observe it.
    pub fn verification_abandoned(&self, ticket: Ticket) {
        let mut map = self.inner.lock();
        if let Some(state) = map.get_mut(&ticket) {
            state.verification_pending = false;
        }
    }

    /// Record a verification mismatch. Opens the circuit at the failure
    /// threshold and disables the ticket past the long horizon. Returns
    /// `true` when the ticket transitioned to disabled.
    pub fn verification_failed(
        &self,
        ticket: Ticket,
        now: Duration,
        threshold: u32,
        cooloff: Duration,
        disable_horizon: Duration,
    ) -> bool {
        let mut map = self.inner.lock();
        let state = map.entry(ticket).or_default();
        state.verification_failures += 1;
        let first = *state.first_verification_failure.get_or_insert(now);
        if state.verification_failures >= threshold {
            state.circuit_open_until = Some(now + cooloff);
        }
        if now.saturating_sub(first) >= disable_horizon && !state.disabled {
            state.disabled = true;
            return true;
        }
        false
    }

    /// Operator reset for a disabled ticket.
    pub fn reset_disabled(&self, ticket: Ticket) {
        let mut map = self.inner.lock();
        if let Some(state) = map.get_mut(&ticket) {
            state.disabled = false;
            state.verification_failures = 0;
            state.first_verification_failure = None;
            state.circuit_open_until = None;
            state.consecutive_failures = 0;
        }
    }
}

/// Equality tolerance for comparing SL prices on a point grid.
#[must_use]
pub fn within_tolerance(a: Price, b: Price, tolerance: Price) -> bool {
    (a - b).abs() <= tolerance.max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn peak_never_decreases() {
        let store = StateStore::new();
        store.raise_peak(1, Decimal::new(50, 2));
        store.raise_peak(1, Decimal::new(30, 2));
        assert_eq!(store.view(1).peak_profit_usd, Decimal::new(50, 2));
    }

    #[test]
    fn circuit_opens_at_threshold() {
        let store = StateStore::new();
        let now = Duration::from_secs(10);
        let cooloff = Duration::from_secs(10);
        assert_eq!(store.record_failure(1, now, 3, cooloff), 1);
        assert_eq!(store.record_failure(1, now, 3, cooloff), 2);
        assert_eq!(store.record_failure(1, now, 3, cooloff), 3);
        let state = store.view(1);
        assert_eq!(state.circuit_open_until, Some(Duration::from_secs(20)));
        assert_eq!(store.open_circuits(now), 1);
        assert_eq!(store.open_circuits(Duration::from_secs(21)), 0);
    }

    #[test]
    fn success_resets_failures_and_reports_activation() {
        let store = StateStore::new();
        store.note_sweet_spot_entry(1, Duration::from_millis(100));
        store.record_failure(1, Duration::from_millis(120), 3, Duration::from_secs(10));
        let activation = store.record_success(
            1,
            Decimal::new(11000, 4),
            SlReason::SweetSpot,
            Decimal::new(5, 2),
            Duration::from_millis(150),
        );
        assert_eq!(activation, Some(Duration::from_millis(50)));
        let state = store.view(1);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.is_protected());
        assert!(state.verification_pending);
        // Activation is only reported once.
        let again = store.record_success(
            1,
            Decimal::new(11001, 4),
            SlReason::SweetSpot,
            Decimal::new(6, 2),
            Duration::from_millis(200),
        );
        assert!(again.is_none());
    }

    #[test]
    fn long_verification_failure_horizon_disables_ticket() {
        let store = StateStore::new();
        let horizon = Duration::from_secs(600);
        let cooloff = Duration::from_secs(10);
        assert!(!store.verification_failed(1, Duration::from_secs(0), 3, cooloff, horizon));
        assert!(store.verification_failed(1, Duration::from_secs(601), 3, cooloff, horizon));
        assert!(store.view(1).disabled);
        store.reset_disabled(1);
        assert!(!store.view(1).disabled);
    }
}
