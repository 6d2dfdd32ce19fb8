//! Orchestration core for Stagehand.
//!
//! This crate defines the "ports" (the state contract and the remote activity
//! source) that the infrastructure layer implements, plus the engine built on
//! them: the phase dependency graph, the activity tracker, the phase executor
//! registry, and the workflow brain. It depends only on `stagehand-types` --
//! never on `stagehand-infra` or any database/IO crate.

pub mod activity;
pub mod brain;
pub mod event;
pub mod graph;
pub mod phase;
pub mod state;

#[cfg(test)]
mod testing;
