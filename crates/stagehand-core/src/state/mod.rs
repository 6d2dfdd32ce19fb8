//! The shared state contract the engine persists through.
//!
//! Any multi-process-visible store that offers atomic per-record
//! read/modify/write can implement [`StateContract`].

pub mod box_contract;
pub mod contract;

pub use box_contract::BoxStateContract;
pub use contract::StateContract;
