//! SQLite storage layer.
//!
//! A state contract backed by SQLite with WAL mode and split read/write
//! connection pools, shareable by several worker processes on one host.

pub mod pool;
pub mod state;

pub use pool::{DatabasePool, default_data_dir, default_database_url};
pub use state::SqliteStateContract;
