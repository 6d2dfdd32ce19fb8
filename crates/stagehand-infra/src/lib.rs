//! Infrastructure layer for Stagehand.
//!
//! Implementations of the `StateContract` port defined in `stagehand-core`
//! (in-memory for single-process use, SQLite for shared durable state) and
//! the engine configuration loader.

pub mod config;
pub mod event;
pub mod memory;
pub mod sqlite;

pub use event::StoredEvent;
pub use memory::InMemoryStateContract;
pub use sqlite::{DatabasePool, SqliteStateContract};
