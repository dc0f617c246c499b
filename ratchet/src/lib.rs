#![allow(ambiguous_glob_reexports)]

//! Aggregate crate that re-exports the main components for downstream users.

pub use ratchet_broker as broker;
pub use ratchet_cli;
pub use ratchet_config as config;
pub use ratchet_core as core;
pub use ratchet_engine as engine;
pub use ratchet_gates as gates;
pub use ratchet_journal as journal;
pub use ratchet_sim as sim;
pub use ratchet_trade as trade;

/// Convenience entrypoint to run the CLI directly from the facade crate.
pub async fn run_cli() -> anyhow::Result<()> {
    ratchet_cli::run_app().await
}

/// Convenience prelude to pull commonly used items into scope.
pub mod prelude {
    pub use ratchet_broker::*;
    pub use ratchet_config::*;
    pub use ratchet_core::*;
    pub use ratchet_engine::*;
    pub use ratchet_gates::*;
    pub use ratchet_journal::*;
    pub use ratchet_sim::*;
    pub use ratchet_trade::*;
}
