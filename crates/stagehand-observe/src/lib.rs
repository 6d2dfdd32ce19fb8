//! Observability setup for Stagehand.
//!
//! Library crates only emit `tracing` events; a host process calls
//! [`tracing_setup::init_tracing`] once at startup to install a subscriber.

pub mod fields;
pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
