//! Pluggable signal production.
//!
//! Strategy research is out of scope: the engine consumes an opaque
//! producer of `(direction, quality_score)` candidates.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use ratchet_core::SymbolInfo;
use ratchet_gates::SignalCandidate;

/// External generator of entry candidates, polled once per scan cycle.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn scan(&self, symbols: &[SymbolInfo]) -> Vec<SignalCandidate>;
}

/// Scripted source: each scan pops the next batch. Used in simulation runs
/// and tests.
#[derive(Default)]
pub struct StaticSignalSource {
    batches: Mutex<VecDeque<Vec<SignalCandidate>>>,
}

impl StaticSignalSource {
    #[must_use]
    pub fn new(batches: Vec<Vec<SignalCandidate>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
        }
    }

    pub fn push_batch(&self, batch: Vec<SignalCandidate>) {
        self.batches.lock().push_back(batch);
    }
}

#[async_trait]
impl SignalSource for StaticSignalSource {
    async fn scan(&self, _symbols: &[SymbolInfo]) -> Vec<SignalCandidate> {
        self.batches.lock().pop_front().unwrap_or_default()
    }
}
