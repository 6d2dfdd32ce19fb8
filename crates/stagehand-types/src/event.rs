//! Progress events emitted while a job runs.
//!
//! `JobEvent` is published through the state contract (for other processes)
//! and the in-process event bus. All variants are Clone + Send + Sync for use
//! with tokio broadcast channels.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobStatus;

/// Events emitted during job validation and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    JobStatusChanged {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    PhaseStarted {
        job_id: Uuid,
        unit_id: Option<String>,
        phase_id: String,
    },

    PhaseCompleted {
        job_id: Uuid,
        unit_id: Option<String>,
        phase_id: String,
        duration_ms: u64,
    },

    PhaseFailed {
        job_id: Uuid,
        unit_id: Option<String>,
        phase_id: String,
        error: String,
        critical: bool,
    },

    PhaseSkipped {
        job_id: Uuid,
        unit_id: Option<String>,
        phase_id: String,
    },

    /// A global phase can never run because a dependency failed.
    PhaseBlocked { job_id: Uuid, phase_id: String },

    UnitFailed {
        job_id: Uuid,
        unit_id: String,
        phase_id: String,
    },

    UnitCompleted { job_id: Uuid, unit_id: String },

    /// Periodic diagnostic snapshot. Observability only.
    Heartbeat {
        job_id: Uuid,
        snapshot: HeartbeatSnapshot,
    },

    JobFinished { job_id: Uuid, status: JobStatus },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::JobStatusChanged { job_id, .. }
            | Self::PhaseStarted { job_id, .. }
            | Self::PhaseCompleted { job_id, .. }
            | Self::PhaseFailed { job_id, .. }
            | Self::PhaseSkipped { job_id, .. }
            | Self::PhaseBlocked { job_id, .. }
            | Self::UnitFailed { job_id, .. }
            | Self::UnitCompleted { job_id, .. }
            | Self::Heartbeat { job_id, .. }
            | Self::JobFinished { job_id, .. } => *job_id,
        }
    }

    /// Stable event type name, matching the serialized `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobStatusChanged { .. } => "job_status_changed",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::PhaseFailed { .. } => "phase_failed",
            Self::PhaseSkipped { .. } => "phase_skipped",
            Self::PhaseBlocked { .. } => "phase_blocked",
            Self::UnitFailed { .. } => "unit_failed",
            Self::UnitCompleted { .. } => "unit_completed",
            Self::Heartbeat { .. } => "heartbeat",
            Self::JobFinished { .. } => "job_finished",
        }
    }
}

/// Counts describing a running job at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub units_by_status: BTreeMap<String, usize>,
    pub phases_completed: BTreeMap<String, usize>,
    pub phases_failed: BTreeMap<String, usize>,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub slots_held: usize,
    pub max_slots: usize,
    pub pending_activities: usize,
}
