//! Phase business-logic port.
//!
//! Workflow-specific code implements [`PhaseExecutor`] and registers a factory
//! per phase id in a [`PhaseRegistry`]; the brain looks implementations up by
//! id and calls them with a [`PhaseContext`].

pub mod context;
pub mod executor;
pub mod registry;

pub use context::PhaseContext;
pub use executor::{BoxPhaseExecutor, FieldKind, FieldSpec, PhaseExecutor};
pub use registry::PhaseRegistry;
