//! Command-line entrypoint for the ratchet runtime.

mod app;
pub mod runtime;
pub mod telemetry;

pub use app::run_app;
pub use runtime::Runtime;
