//! Per-ticket lock table with timeouts and watchdog force release.
//!
//! The locks are epoch-based: a force release bumps the entry's epoch, so a
//! stale holder dropping its guard afterwards is a no-op rather than a
//! double release. Locks are created lazily and never reused across tickets;
//! reclamation happens at reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ratchet_core::{Clock, Ticket};
use thiserror::Error;
use tokio::sync::Notify;

/// Why the lock was taken; profit-locking acquisitions get a longer timeout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockKind {
    Normal,
    ProfitLocking,
}

/// Returned when the acquisition timeout elapses.
#[derive(Debug, Error)]
#[error("timed out acquiring lock for ticket {ticket}")]
pub struct LockTimeout {
    pub ticket: Ticket,
}

/// Diagnostic payload emitted when the watchdog force-releases a lock.
#[derive(Clone, Debug)]
pub struct StaleRelease {
    pub ticket: Ticket,
    pub holder: String,
    pub kind: LockKind,
    pub held_for: Duration,
}

#[derive(Clone, Debug)]
struct Holder {
    label: String,
    kind: LockKind,
    acquired: Duration,
}

#[derive(Debug)]
struct LockState {
    holder: Option<Holder>,
    epoch: u64,
}

struct TicketLock {
    state: Mutex<LockState>,
    notify: Notify,
}

impl TicketLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                holder: None,
                epoch: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn try_take(&self, kind: LockKind, now: Duration) -> Option<u64> {
        let mut state = self.state.lock();
        if state.holder.is_some() {
            return None;
        }
        state.holder = Some(Holder {
            label: holder_label(),
            kind,
            acquired: now,
        });
        Some(state.epoch)
    }

    fn release(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.holder = None;
            state.epoch += 1;
            drop(state);
            self.notify.notify_one();
        }
    }

    fn force_release(&self, ticket: Ticket, max_hold: Duration, now: Duration) -> Option<StaleRelease> {
        let mut state = self.state.lock();
        let holder = state.holder.as_ref()?;
        let held_for = now.saturating_sub(holder.acquired);
        if held_for < max_hold {
            return None;
        }
        let release = StaleRelease {
            ticket,
            holder: holder.label.clone(),
            kind: holder.kind,
            held_for,
        };
        state.holder = None;
        state.epoch += 1;
        drop(state);
        self.notify.notify_waiters();
        Some(release)
    }
}

fn holder_label() -> String {
    let thread = std::thread::current();
    thread
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", thread.id()))
}

/// RAII guard over a ticket lock. Dropping releases unless the watchdog
/// already bumped the epoch.
pub struct LockGuard {
    lock: Arc<TicketLock>,
    epoch: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release(self.epoch);
    }
}

/// Lazily populated table of per-ticket locks.
pub struct LockTable {
    entries: Mutex<HashMap<Ticket, Arc<TicketLock>>>,
    clock: Clock,
}

impl LockTable {
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn entry(&self, ticket: Ticket) -> Arc<TicketLock> {
        let mut entries = self.entries.lock();
        entries
            .entry(ticket)
            .or_insert_with(|| Arc::new(TicketLock::new()))
            .clone()
    }

    /// Acquire the ticket lock, waiting at most `timeout`.
    pub async fn acquire(
        &self,
        ticket: Ticket,
        kind: LockKind,
        timeout: Duration,
    ) -> Result<LockGuard, LockTimeout> {
        let lock = self.entry(ticket);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(epoch) = lock.try_take(kind, self.clock.monotonic()) {
                return Ok(LockGuard { lock, epoch });
            }
            let notified = lock.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(LockTimeout { ticket });
            }
        }
    }

    /// Force-release every lock held longer than `max_hold`.
    #[must_use]
    pub fn force_release_stale(&self, max_hold: Duration) -> Vec<StaleRelease> {
        let now = self.clock.monotonic();
        let entries: Vec<(Ticket, Arc<TicketLock>)> = {
            let map = self.entries.lock();
            map.iter().map(|(t, l)| (*t, l.clone())).collect()
        };
        entries
            .into_iter()
            .filter_map(|(ticket, lock)| lock.force_release(ticket, max_hold, now))
            .collect()
    }

    /// Drop the lock entry for a ticket that is gone from both views.
    pub fn reclaim(&self, ticket: Ticket) {
        self.entries.lock().remove(&ticket);
    }

    #[must_use]
    pub fn tracked_tickets(&self) -> Vec<Ticket> {
        self.entries.lock().keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LockTable {
        LockTable::new(Clock::system())
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let table = table();
        let guard = table
            .acquire(1, LockKind::Normal, Duration::from_millis(50))
            .await
            .unwrap();
        let contended = table
            .acquire(1, LockKind::Normal, Duration::from_millis(30))
            .await;
        assert!(contended.is_err());
        drop(guard);
        let reacquired = table
            .acquire(1, LockKind::Normal, Duration::from_millis(50))
            .await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn distinct_tickets_do_not_contend() {
        let table = table();
        let _a = table
            .acquire(1, LockKind::Normal, Duration::from_millis(50))
            .await
            .unwrap();
        let b = table
            .acquire(2, LockKind::ProfitLocking, Duration::from_millis(50))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn watchdog_force_releases_and_stale_drop_is_noop() {
        let (clock, handle) = Clock::manual(chrono::Utc::now());
        let table = LockTable::new(clock);
        let guard = table
            .acquire(7, LockKind::Normal, Duration::from_millis(50))
            .await
            .unwrap();

        handle.advance(Duration::from_millis(600));
        let released = table.force_release_stale(Duration::from_millis(500));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].ticket, 7);
        assert!(released[0].held_for >= Duration::from_millis(500));

        // New owner takes the lock while the stale guard still exists.
        let fresh = table
            .acquire(7, LockKind::Normal, Duration::from_millis(50))
            .await
            .unwrap();
        drop(guard); // stale epoch, must not unlock the new owner
        let contended = table
            .acquire(7, LockKind::Normal, Duration::from_millis(30))
            .await;
        assert!(contended.is_err());
        drop(fresh);
    }

    #[tokio::test]
    async fn waiter_wakes_when_holder_releases() {
        let table = Arc::new(table());
        let guard = table
            .acquire(3, LockKind::Normal, Duration::from_millis(500))
            .await
            .unwrap();
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .acquire(3, LockKind::Normal, Duration::from_millis(500))
                    .await
                    .is_ok()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_drops_entry() {
        let table = table();
        let guard = table
            .acquire(9, LockKind::Normal, Duration::from_millis(10))
            .await
            .unwrap();
        drop(guard);
        assert_eq!(table.len(), 1);
        table.reclaim(9);
        assert!(table.is_empty());
    }
}
