//! Shared domain types for Stagehand.
//!
//! This crate contains the domain types used across the orchestrator: phase
//! definitions and skip predicates, jobs, units, tracked activities, progress
//! events, engine configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod activity;
pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod phase;
pub mod unit;

/// Free-form field bag used for phase inputs, outputs, options, and unit state.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;
