//! Post-run summary of a job.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stagehand_types::job::{Job, JobStatus};
use stagehand_types::phase::PhaseStatus;
use stagehand_types::unit::UnitStatus;
use uuid::Uuid;

/// A phase that failed, with the reason recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub phase_id: String,
    pub reason: String,
}

/// Unit counts, global phase outcomes, and every recorded failure reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub workflow: String,
    pub status: JobStatus,
    pub units_total: usize,
    pub units_completed: usize,
    pub units_failed: usize,
    /// Units not in a terminal status (only non-zero for cancelled jobs).
    pub units_unfinished: usize,
    pub global_phases: BTreeMap<String, PhaseStatus>,
    /// Failed phases per unit, including non-critical ones.
    pub unit_failures: BTreeMap<String, Vec<PhaseFailure>>,
    pub global_failures: Vec<PhaseFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_summary: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

impl JobReport {
    pub fn from_job(job: &Job) -> Self {
        let units_completed = job.count_units(UnitStatus::Completed);
        let units_failed = job.count_units(UnitStatus::Failed);

        let unit_failures = job
            .ordered_units()
            .into_iter()
            .filter(|u| !u.phase_errors.is_empty())
            .map(|u| {
                let failures = u
                    .phase_errors
                    .iter()
                    .map(|(phase_id, reason)| PhaseFailure {
                        phase_id: phase_id.clone(),
                        reason: reason.clone(),
                    })
                    .collect();
                (u.unit_id.clone(), failures)
            })
            .collect();

        let global_failures = job
            .errors
            .iter()
            .filter(|e| e.unit_id.is_none())
            .map(|e| PhaseFailure {
                phase_id: e.phase_id.clone().unwrap_or_default(),
                reason: e.message.clone(),
            })
            .collect();

        Self {
            job_id: job.id,
            workflow: job.workflow.clone(),
            status: job.status,
            units_total: job.units.len(),
            units_completed,
            units_failed,
            units_unfinished: job.units.len() - units_completed - units_failed,
            global_phases: job.global_phase_status.clone(),
            unit_failures,
            global_failures,
            validation_summary: job.validation_summary.clone(),
            duration_secs: job
                .completed_at
                .map(|done| (done - job.created_at).num_seconds()),
        }
    }

    /// One-line summary, e.g. `partial: 2/3 units completed, 1 failed`.
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{}: {}/{} units completed, {} failed",
            self.status, self.units_completed, self.units_total, self.units_failed
        );
        if self.units_unfinished > 0 {
            line.push_str(&format!(", {} unfinished", self.units_unfinished));
        }
        if !self.global_failures.is_empty() {
            line.push_str(&format!(", {} global phase failures", self.global_failures.len()));
        }
        line
    }
}
