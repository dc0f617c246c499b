//! Time source abstraction.
//!
//! Interval arithmetic (throttles, lock hold times, circuit cool-offs) uses
//! the monotonic reading; wall-clock readings are only used for journals and
//! calendar comparisons. The manual variant lets tests step time
//! deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Shared monotonic + wall time source.
#[derive(Clone)]
pub struct Clock {
    inner: ClockInner,
}

#[derive(Clone)]
enum ClockInner {
    System { epoch: Instant },
    Manual(Arc<ManualState>),
}

struct ManualState {
    mono: Mutex<Duration>,
    wall: Mutex<DateTime<Utc>>,
}

impl Clock {
    /// Real clock backed by `Instant` and `Utc::now`.
    #[must_use]
    pub fn system() -> Self {
        Self {
            inner: ClockInner::System {
                epoch: Instant::now(),
            },
        }
    }

    /// Manually stepped clock for deterministic tests.
    #[must_use]
    pub fn manual(wall_start: DateTime<Utc>) -> (Self, ManualClock) {
        let state = Arc::new(ManualState {
            mono: Mutex::new(Duration::ZERO),
            wall: Mutex::new(wall_start),
        });
        (
            Self {
                inner: ClockInner::Manual(state.clone()),
            },
            ManualClock { state },
        )
    }

    /// Monotonic reading since an arbitrary epoch.
    #[must_use]
    pub fn monotonic(&self) -> Duration {
        match &self.inner {
            ClockInner::System { epoch } => epoch.elapsed(),
            ClockInner::Manual(state) => *state.mono.lock(),
        }
    }

    /// Wall-clock reading.
    #[must_use]
    pub fn wall(&self) -> DateTime<Utc> {
        match &self.inner {
            ClockInner::System { .. } => Utc::now(),
            ClockInner::Manual(state) => *state.wall.lock(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

/// Handle used by tests to advance a manual [`Clock`].
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<ManualState>,
}

impl ManualClock {
    /// Advance both the monotonic and wall readings.
    pub fn advance(&self, by: Duration) {
        *self.state.mono.lock() += by;
        let mut wall = self.state.wall.lock();
        *wall += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}
