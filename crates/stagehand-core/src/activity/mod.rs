//! Tracking of fire-and-return-later external operations.
//!
//! The [`ActivitySource`] port is the remote system's status API; the
//! [`ActivityTracker`] multiplexes every outstanding correlation id onto one
//! bulk poll per cycle and resolves each id exactly once.

pub mod source;
pub mod tracker;

pub use source::{ActivitySource, BoxActivitySource};
pub use tracker::{ActivityTracker, PollCycle, TrackerError};
