//! Units: independently progressing entities within a job.
//!
//! Every state change to a unit goes through [`Unit::apply`], so the in-memory
//! and persistent state contracts enforce the same rules: at most one current
//! phase, disjoint append-only completed/failed sets, and a monotonically
//! growing `resolved` bag.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::phase::{UnitPhaseUpdate, is_metadata_field};
use crate::FieldMap;

/// Lifecycle of a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One independently progressing entity within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: String,
    /// Human-facing ordinal; also the order used when aggregating across units.
    pub unit_number: u32,
    #[serde(default)]
    pub status: UnitStatus,
    /// The phase presently executing for this unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub completed_phases: BTreeSet<String>,
    #[serde(default)]
    pub failed_phases: BTreeSet<String>,
    /// Subset of `completed_phases` that were skipped rather than run.
    #[serde(default)]
    pub skipped_phases: BTreeSet<String>,
    /// Failure reason per failed phase.
    #[serde(default)]
    pub phase_errors: BTreeMap<String, String>,
    /// Values discovered at runtime by completed phases.
    #[serde(default)]
    pub resolved: FieldMap,
    /// Values precomputed by the validation phase.
    #[serde(default)]
    pub plan: FieldMap,
    /// Static per-unit configuration fixed at validation time.
    #[serde(default)]
    pub input_config: FieldMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Unit {
    pub fn new(unit_id: impl Into<String>, unit_number: u32) -> Self {
        Self {
            unit_id: unit_id.into(),
            unit_number,
            status: UnitStatus::Pending,
            current_phase: None,
            completed_phases: BTreeSet::new(),
            failed_phases: BTreeSet::new(),
            skipped_phases: BTreeSet::new(),
            phase_errors: BTreeMap::new(),
            resolved: FieldMap::new(),
            plan: FieldMap::new(),
            input_config: FieldMap::new(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the phase already reached a terminal state for this unit.
    pub fn is_attempted(&self, phase_id: &str) -> bool {
        self.completed_phases.contains(phase_id) || self.failed_phases.contains(phase_id)
    }

    /// Apply one phase transition.
    ///
    /// Re-applying a terminal transition that already holds is a no-op, so a
    /// scheduler retrying after a transient store failure does not conflict
    /// with its own earlier write.
    pub fn apply(&mut self, phase_id: &str, update: &UnitPhaseUpdate) -> Result<(), StateError> {
        let now = Utc::now();
        match update {
            UnitPhaseUpdate::Started => {
                if self.status == UnitStatus::Failed {
                    return Err(StateError::Conflict(format!(
                        "unit '{}' has failed; cannot start '{phase_id}'",
                        self.unit_id
                    )));
                }
                if self.is_attempted(phase_id) {
                    return Err(StateError::Conflict(format!(
                        "phase '{phase_id}' already attempted for unit '{}'",
                        self.unit_id
                    )));
                }
                if let Some(current) = &self.current_phase {
                    return Err(StateError::Conflict(format!(
                        "unit '{}' is already running '{current}'",
                        self.unit_id
                    )));
                }
                self.current_phase = Some(phase_id.to_string());
                if self.status == UnitStatus::Pending {
                    self.status = UnitStatus::Running;
                    self.started_at = Some(now);
                }
            }
            UnitPhaseUpdate::Completed | UnitPhaseUpdate::Skipped => {
                if self.failed_phases.contains(phase_id) {
                    return Err(StateError::Conflict(format!(
                        "phase '{phase_id}' already failed for unit '{}'",
                        self.unit_id
                    )));
                }
                self.completed_phases.insert(phase_id.to_string());
                if matches!(update, UnitPhaseUpdate::Skipped) {
                    self.skipped_phases.insert(phase_id.to_string());
                }
                self.clear_current(phase_id);
                if self.status == UnitStatus::Pending {
                    self.status = UnitStatus::Running;
                    self.started_at = Some(now);
                }
            }
            UnitPhaseUpdate::Failed { error, critical } => {
                if self.completed_phases.contains(phase_id) {
                    return Err(StateError::Conflict(format!(
                        "phase '{phase_id}' already completed for unit '{}'",
                        self.unit_id
                    )));
                }
                if self.failed_phases.insert(phase_id.to_string()) {
                    self.phase_errors.insert(phase_id.to_string(), error.clone());
                }
                self.clear_current(phase_id);
                if *critical && self.status != UnitStatus::Failed {
                    self.status = UnitStatus::Failed;
                    self.completed_at = Some(now);
                }
            }
            UnitPhaseUpdate::Interrupted => self.clear_current(phase_id),
        }
        Ok(())
    }

    fn clear_current(&mut self, phase_id: &str) {
        if self.current_phase.as_deref() == Some(phase_id) {
            self.current_phase = None;
        }
    }

    /// Merge phase outputs into `resolved`, skipping execution metadata.
    pub fn merge_resolved(&mut self, outputs: &FieldMap) {
        for (key, value) in outputs {
            if !is_metadata_field(key) {
                self.resolved.insert(key.clone(), value.clone());
            }
        }
    }

    /// Move a non-terminal unit to a terminal status.
    pub fn finish(&mut self, status: UnitStatus) {
        if !self.status.is_terminal() {
            self.status = status;
            self.completed_at = Some(Utc::now());
        }
    }
}

/// Unit description produced by the validation phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSeed {
    pub unit_id: String,
    pub unit_number: u32,
    #[serde(default)]
    pub plan: FieldMap,
    #[serde(default)]
    pub input_config: FieldMap,
}

impl From<UnitSeed> for Unit {
    fn from(seed: UnitSeed) -> Self {
        let mut unit = Unit::new(seed.unit_id, seed.unit_number);
        unit.plan = seed.plan;
        unit.input_config = seed.input_config;
        unit
    }
}
