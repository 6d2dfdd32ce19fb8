//! Jobs: one workflow run over a set of units.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::{PhaseDefinition, PhaseStatus, WorkflowDefinition};
use crate::unit::{Unit, UnitStatus};
use crate::FieldMap;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Validating,
    AwaitingConfirmation,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Validating | Failed | Cancelled)
                | (Validating, AwaitingConfirmation | Failed | Cancelled)
                | (AwaitingConfirmation, Running | Cancelled)
                | (Running, Completed | Partial | Failed | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "validating" => Ok(Self::Validating),
            "awaiting_confirmation" => Ok(Self::AwaitingConfirmation),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Which remote account, venue, and tenant a job targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobScope {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl JobScope {
    pub fn account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            venue_id: None,
            tenant_id: None,
        }
    }
}

/// A failure recorded against a job, a unit, or a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn new(unit_id: Option<String>, phase_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            unit_id,
            phase_id,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// One workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub workflow: String,
    pub scope: JobScope,
    #[serde(default)]
    pub status: JobStatus,
    /// Free-form configuration consulted by phases and skip conditions.
    #[serde(default)]
    pub options: FieldMap,
    pub root_phase: String,
    /// The phase graph, fixed at creation.
    pub phase_definitions: Vec<PhaseDefinition>,
    #[serde(default)]
    pub units: BTreeMap<String, Unit>,
    #[serde(default)]
    pub global_phase_status: BTreeMap<String, PhaseStatus>,
    #[serde(default)]
    pub global_phase_results: BTreeMap<String, FieldMap>,
    #[serde(default)]
    pub errors: Vec<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_summary: Option<serde_json::Value>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A new pending job for the given workflow. The graph is not validated here.
    pub fn new(workflow: &WorkflowDefinition, scope: JobScope, options: FieldMap) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow: workflow.name.clone(),
            scope,
            status: JobStatus::Pending,
            options,
            root_phase: workflow.root_phase.clone(),
            phase_definitions: workflow.phases.clone(),
            units: BTreeMap::new(),
            global_phase_status: BTreeMap::new(),
            global_phase_results: BTreeMap::new(),
            errors: Vec::new(),
            validation_summary: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Units ordered by unit number, then id.
    pub fn ordered_units(&self) -> Vec<&Unit> {
        let mut units: Vec<&Unit> = self.units.values().collect();
        units.sort_by(|a, b| {
            a.unit_number
                .cmp(&b.unit_number)
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });
        units
    }

    pub fn global_status(&self, phase_id: &str) -> PhaseStatus {
        self.global_phase_status
            .get(phase_id)
            .copied()
            .unwrap_or_default()
    }

    /// Global phases dependents may treat as done (completed or skipped).
    pub fn satisfied_globals(&self) -> HashSet<String> {
        self.global_phase_status
            .iter()
            .filter(|(_, status)| status.is_satisfied())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count_units(&self, status: UnitStatus) -> usize {
        self.units.values().filter(|u| u.status == status).count()
    }

    /// Move to `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobStatus> {
        if !self.status.can_transition_to(next) {
            return Err(self.status);
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}
