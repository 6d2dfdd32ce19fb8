//! Span and field names used by the Stagehand engine.
//!
//! These are the keys log pipelines and trace backends filter on. All are
//! string slices usable as `tracing` field names and span names.

// --- Span names ---

/// Span around `WorkflowBrain::validate`.
pub const SPAN_VALIDATE: &str = "validate";

/// Span around `WorkflowBrain::execute`.
pub const SPAN_EXECUTE: &str = "execute";

// --- Identity fields ---

pub const JOB_ID: &str = "job_id";
pub const UNIT_ID: &str = "unit_id";
pub const PHASE_ID: &str = "phase_id";

/// Remote operation id tracked by the activity tracker.
pub const CORRELATION_ID: &str = "correlation_id";

// --- Status fields ---

/// Previous job status on a transition.
pub const FROM_STATUS: &str = "from";

/// New job status on a transition.
pub const TO_STATUS: &str = "to";

/// Phase execution time in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

pub const ERROR: &str = "error";
