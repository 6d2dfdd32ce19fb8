//! Event bus for job progress notification.
//!
//! Provides an `EventBus` that distributes `JobEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
