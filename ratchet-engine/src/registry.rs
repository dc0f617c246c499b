//! In-memory mirror of open positions, keyed by ticket.
//!
//! Writers: the scan loop (add on fill), the position monitor (reconcile),
//! and the application engine (quote observations). Readers always copy
//! snapshots so the registry mutex is never held across broker I/O.

use std::collections::HashMap;

use parking_lot::RwLock;
use ratchet_core::{Position, Price, Symbol, SymbolInfo, Ticket};

/// Outcome of a reconciliation pass against the broker's position list.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Broker-side positions the core was not tracking (e.g. after restart).
    pub backfilled: Vec<Position>,
    /// Tracked tickets that are no longer open at the broker.
    pub closed: Vec<Position>,
}

/// Authoritative in-memory view of open positions.
#[derive(Default)]
pub struct PositionRegistry {
    inner: RwLock<HashMap<Ticket, Position>>,
}

impl PositionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of tracked tickets only; positions are re-fetched per ticket.
    #[must_use]
    pub fn tickets(&self) -> Vec<Ticket> {
        self.inner.read().keys().copied().collect()
    }

    #[must_use]
    pub fn get(&self, ticket: Ticket) -> Option<Position> {
        self.inner.read().get(&ticket).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Track a freshly filled position.
    pub fn insert(&self, position: Position) {
        self.inner.write().insert(position.ticket, position);
    }

    /// Record a fresh quote (and optionally the broker SL) for a ticket.
    pub fn observe_quote(&self, ticket: Ticket, price: Price, sl: Option<Price>) {
        let mut map = self.inner.write();
        if let Some(position) = map.get_mut(&ticket) {
            let sl_changed = sl.is_some() && sl != position.current_sl;
            if position.current_price != price || sl_changed {
                position.current_price = price;
                if sl.is_some() {
                    position.current_sl = sl;
                }
                position.version += 1;
            }
        }
    }

    /// Record the broker-confirmed SL for a ticket.
    pub fn observe_sl(&self, ticket: Ticket, sl: Price) {
        let mut map = self.inner.write();
        if let Some(position) = map.get_mut(&ticket) {
            if position.current_sl != Some(sl) {
                position.current_sl = Some(sl);
                position.version += 1;
            }
        }
    }

    pub fn remove(&self, ticket: Ticket) -> Option<Position> {
        self.inner.write().remove(&ticket)
    }

    /// Merge the broker's authoritative list into the local view.
    ///
    /// Unknown broker positions are backfilled, vanished tickets removed,
    /// and surviving entries refreshed (version bumped on change).
    pub fn sync_with_broker(&self, broker_positions: Vec<Position>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut map = self.inner.write();

        let mut seen: HashMap<Ticket, Position> = HashMap::new();
        for position in broker_positions {
            seen.insert(position.ticket, position);
        }

        let stale: Vec<Ticket> = map
            .keys()
            .filter(|ticket| !seen.contains_key(ticket))
            .copied()
            .collect();
        for ticket in stale {
            if let Some(position) = map.remove(&ticket) {
                report.closed.push(position);
            }
        }

        for (ticket, incoming) in seen {
            match map.get_mut(&ticket) {
                Some(existing) => {
                    let changed = existing.current_price != incoming.current_price
                        || existing.current_sl != incoming.current_sl
                        || existing.volume != incoming.volume;
                    if changed {
                        existing.current_price = incoming.current_price;
                        existing.current_sl = incoming.current_sl;
                        existing.volume = incoming.volume;
                        existing.version += 1;
                    }
                }
                None => {
                    report.backfilled.push(incoming.clone());
                    map.insert(ticket, incoming);
                }
            }
        }

        report
    }
}

/// Shared lookup of broker symbol metadata.
#[derive(Default)]
pub struct SymbolTable {
    inner: RwLock<HashMap<Symbol, SymbolInfo>>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&self, symbols: Vec<SymbolInfo>) {
        let mut map = self.inner.write();
        map.clear();
        for info in symbols {
            map.insert(info.symbol.clone(), info);
        }
    }

    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<SymbolInfo> {
        self.inner.read().get(symbol).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<SymbolInfo> {
        self.inner.read().values().cloned().collect()
    }
}
