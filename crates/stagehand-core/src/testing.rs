//! In-crate test doubles: a mutex-backed state contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use stagehand_types::activity::ActivityRef;
use stagehand_types::error::StateError;
use stagehand_types::job::{Job, JobError, JobStatus};
use stagehand_types::phase::{PhaseStatus, UnitPhaseUpdate};
use stagehand_types::unit::{Unit, UnitStatus};
use stagehand_types::FieldMap;
use uuid::Uuid;

use crate::state::StateContract;

#[derive(Default)]
pub struct MemoryState {
    pub jobs: Mutex<HashMap<Uuid, Job>>,
    pub activities: Mutex<HashMap<String, ActivityRef>>,
    pub completed_activities: Mutex<Vec<String>>,
    pub events: Mutex<Vec<(Uuid, String, serde_json::Value)>>,
    /// Number of upcoming `get_job` calls that fail.
    pub fail_get_job: AtomicUsize,
    /// When non-zero, the n-th upcoming `get_job` call sets the stored
    /// job's cancel flag right after taking its snapshot.
    pub cancel_on_get_job: AtomicUsize,
}

impl MemoryState {
    pub fn job(&self, job_id: &Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    pub fn event_types(&self, job_id: &Uuid) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == job_id)
            .map(|(_, t, _)| t.clone())
            .collect()
    }

    fn with_job<T>(
        &self,
        job_id: &Uuid,
        f: impl FnOnce(&mut Job) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::NotFound(format!("job {job_id}")))?;
        let out = f(job)?;
        job.updated_at = chrono::Utc::now();
        Ok(out)
    }

    fn with_unit<T>(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        f: impl FnOnce(&mut Unit) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        self.with_job(job_id, |job| {
            let unit = job
                .units
                .get_mut(unit_id)
                .ok_or_else(|| StateError::NotFound(format!("unit {unit_id}")))?;
            f(unit)
        })
    }
}

impl StateContract for MemoryState {
    async fn save_job(&self, job: &Job) -> Result<(), StateError> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &Uuid) -> Result<Option<Job>, StateError> {
        if self
            .fail_get_job
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StateError::Connection);
        }
        let snapshot = self.job(job_id);
        let countdown = self
            .cancel_on_get_job
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if countdown == Ok(1) {
            if let Some(job) = self.jobs.lock().unwrap().get_mut(job_id) {
                job.cancel_requested = true;
            }
        }
        Ok(snapshot)
    }

    async fn update_job_status(&self, job_id: &Uuid, status: JobStatus) -> Result<Job, StateError> {
        self.with_job(job_id, |job| {
            job.transition(status).map_err(|from| {
                StateError::Conflict(format!("cannot move job from {from} to {status}"))
            })?;
            Ok(job.clone())
        })
    }

    async fn append_job_error(&self, job_id: &Uuid, error: &JobError) -> Result<(), StateError> {
        self.with_job(job_id, |job| {
            job.errors.push(error.clone());
            Ok(())
        })
    }

    async fn set_validation_summary(
        &self,
        job_id: &Uuid,
        summary: Option<&serde_json::Value>,
    ) -> Result<(), StateError> {
        self.with_job(job_id, |job| {
            job.validation_summary = summary.cloned();
            Ok(())
        })
    }

    async fn save_unit(&self, job_id: &Uuid, unit: &Unit) -> Result<(), StateError> {
        self.with_job(job_id, |job| {
            job.units.insert(unit.unit_id.clone(), unit.clone());
            Ok(())
        })
    }

    async fn get_unit(&self, job_id: &Uuid, unit_id: &str) -> Result<Option<Unit>, StateError> {
        Ok(self.job(job_id).and_then(|j| j.units.get(unit_id).cloned()))
    }

    async fn save_all_units(&self, job_id: &Uuid, units: &[Unit]) -> Result<(), StateError> {
        self.with_job(job_id, |job| {
            for unit in units {
                job.units.insert(unit.unit_id.clone(), unit.clone());
            }
            Ok(())
        })
    }

    async fn update_unit_phase_status(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        phase_id: &str,
        update: &UnitPhaseUpdate,
    ) -> Result<Unit, StateError> {
        self.with_unit(job_id, unit_id, |unit| {
            unit.apply(phase_id, update)?;
            Ok(unit.clone())
        })
    }

    async fn merge_unit_resolved(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StateError> {
        self.with_unit(job_id, unit_id, |unit| {
            unit.merge_resolved(fields);
            Ok(())
        })
    }

    async fn set_unit_status(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        status: UnitStatus,
    ) -> Result<(), StateError> {
        self.with_unit(job_id, unit_id, |unit| {
            unit.finish(status);
            Ok(())
        })
    }

    async fn update_global_phase_status(
        &self,
        job_id: &Uuid,
        phase_id: &str,
        status: PhaseStatus,
        result: Option<&FieldMap>,
    ) -> Result<(), StateError> {
        self.with_job(job_id, |job| {
            job.global_phase_status.insert(phase_id.to_string(), status);
            if let Some(result) = result {
                job.global_phase_results
                    .insert(phase_id.to_string(), result.clone());
            }
            Ok(())
        })
    }

    async fn register_activity(&self, activity: &ActivityRef) -> Result<(), StateError> {
        self.activities
            .lock()
            .unwrap()
            .insert(activity.correlation_id.clone(), activity.clone());
        Ok(())
    }

    async fn complete_activity(&self, correlation_id: &str, _job_id: &Uuid) -> Result<(), StateError> {
        self.activities.lock().unwrap().remove(correlation_id);
        self.completed_activities
            .lock()
            .unwrap()
            .push(correlation_id.to_string());
        Ok(())
    }

    async fn get_pending_activities(&self) -> Result<HashMap<String, ActivityRef>, StateError> {
        Ok(self.activities.lock().unwrap().clone())
    }

    async fn is_cancelled(&self, job_id: &Uuid) -> Result<bool, StateError> {
        Ok(self.job(job_id).is_some_and(|j| j.cancel_requested))
    }

    async fn request_cancel(&self, job_id: &Uuid) -> Result<(), StateError> {
        self.with_job(job_id, |job| {
            job.cancel_requested = true;
            Ok(())
        })
    }

    async fn publish_event(
        &self,
        job_id: &Uuid,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<(), StateError> {
        self.events
            .lock()
            .unwrap()
            .push((*job_id, event_type.to_string(), data.clone()));
        Ok(())
    }
}
