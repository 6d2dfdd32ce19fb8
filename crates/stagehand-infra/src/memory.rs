//! In-process state contract.
//!
//! Jobs live in a `DashMap`; each helper takes the entry's write lock for its
//! whole read/modify/write, which makes it atomic with respect to every other
//! caller in the process. Nothing survives a restart, so this suits tests and
//! single-process runs only.

use std::collections::HashMap;

use chrono::Utc;
use dashmap::DashMap;
use stagehand_core::state::StateContract;
use stagehand_types::activity::ActivityRef;
use stagehand_types::error::StateError;
use stagehand_types::job::{Job, JobError, JobStatus};
use stagehand_types::phase::{PhaseStatus, UnitPhaseUpdate};
use stagehand_types::unit::{Unit, UnitStatus};
use stagehand_types::FieldMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::event::StoredEvent;

/// `DashMap`-backed [`StateContract`].
pub struct InMemoryStateContract {
    jobs: DashMap<Uuid, Job>,
    activities: DashMap<String, ActivityRef>,
    events: DashMap<Uuid, Vec<StoredEvent>>,
    feed: broadcast::Sender<StoredEvent>,
}

impl InMemoryStateContract {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(1024);
        Self {
            jobs: DashMap::new(),
            activities: DashMap::new(),
            events: DashMap::new(),
            feed,
        }
    }

    /// Live feed of every published event.
    pub fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.feed.subscribe()
    }

    /// Events published for `job_id`, oldest first.
    pub fn events_for(&self, job_id: &Uuid) -> Vec<StoredEvent> {
        self.events
            .get(job_id)
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Ids of jobs currently in `status`, e.g. RUNNING jobs to resume.
    pub fn list_job_ids(&self, status: JobStatus) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    fn modify_job<T>(
        &self,
        job_id: &Uuid,
        f: impl FnOnce(&mut Job) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::NotFound(format!("job {job_id}")))?;
        let out = f(&mut job)?;
        job.updated_at = Utc::now();
        Ok(out)
    }

    fn modify_unit<T>(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        f: impl FnOnce(&mut Unit) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        self.modify_job(job_id, |job| {
            let unit = job
                .units
                .get_mut(unit_id)
                .ok_or_else(|| StateError::NotFound(format!("unit {unit_id} in job {job_id}")))?;
            f(unit)
        })
    }
}

impl Default for InMemoryStateContract {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStateContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStateContract")
            .field("jobs", &self.jobs.len())
            .field("pending_activities", &self.activities.len())
            .finish()
    }
}

impl StateContract for InMemoryStateContract {
    async fn save_job(&self, job: &Job) -> Result<(), StateError> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &Uuid) -> Result<Option<Job>, StateError> {
        Ok(self.jobs.get(job_id).map(|job| job.clone()))
    }

    async fn update_job_status(&self, job_id: &Uuid, status: JobStatus) -> Result<Job, StateError> {
        self.modify_job(job_id, |job| {
            job.transition(status).map_err(|from| {
                StateError::Conflict(format!("cannot move job {job_id} from {from} to {status}"))
            })?;
            Ok(job.clone())
        })
    }

    async fn append_job_error(&self, job_id: &Uuid, error: &JobError) -> Result<(), StateError> {
        self.modify_job(job_id, |job| {
            job.errors.push(error.clone());
            Ok(())
        })
    }

    async fn set_validation_summary(
        &self,
        job_id: &Uuid,
        summary: Option<&serde_json::Value>,
    ) -> Result<(), StateError> {
        self.modify_job(job_id, |job| {
            job.validation_summary = summary.cloned();
            Ok(())
        })
    }

    async fn save_unit(&self, job_id: &Uuid, unit: &Unit) -> Result<(), StateError> {
        self.modify_job(job_id, |job| {
            job.units.insert(unit.unit_id.clone(), unit.clone());
            Ok(())
        })
    }

    async fn get_unit(&self, job_id: &Uuid, unit_id: &str) -> Result<Option<Unit>, StateError> {
        Ok(self
            .jobs
            .get(job_id)
            .and_then(|job| job.units.get(unit_id).cloned()))
    }

    async fn save_all_units(&self, job_id: &Uuid, units: &[Unit]) -> Result<(), StateError> {
        self.modify_job(job_id, |job| {
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
        self.modify_unit(job_id, unit_id, |unit| {
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
        self.modify_unit(job_id, unit_id, |unit| {
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
        self.modify_unit(job_id, unit_id, |unit| {
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
        self.modify_job(job_id, |job| {
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
            .insert(activity.correlation_id.clone(), activity.clone());
        Ok(())
    }

    async fn complete_activity(&self, correlation_id: &str, _job_id: &Uuid) -> Result<(), StateError> {
        self.activities.remove(correlation_id);
        Ok(())
    }

    async fn get_pending_activities(&self) -> Result<HashMap<String, ActivityRef>, StateError> {
        Ok(self
            .activities
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn is_cancelled(&self, job_id: &Uuid) -> Result<bool, StateError> {
        Ok(self
            .jobs
            .get(job_id)
            .is_some_and(|job| job.cancel_requested))
    }

    async fn request_cancel(&self, job_id: &Uuid) -> Result<(), StateError> {
        self.modify_job(job_id, |job| {
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
        let event = StoredEvent::new(*job_id, event_type, data.clone());
        self.events.entry(*job_id).or_default().push(event.clone());
        let _ = self.feed.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagehand_types::job::JobScope;
    use stagehand_types::phase::{PhaseDefinition, WorkflowDefinition};
    use std::sync::Arc;

    fn sample_job() -> Job {
        let workflow = WorkflowDefinition {
            name: "site-rollout".to_string(),
            root_phase: "validate".to_string(),
            phases: vec![
                PhaseDefinition::global("validate"),
                PhaseDefinition::per_unit("create-network").depends_on(["validate"]),
            ],
        };
        let mut job = Job::new(&workflow, JobScope::account("acct-1"), FieldMap::new());
        job.units.insert("site-1".to_string(), Unit::new("site-1", 1));
        job.units.insert("site-2".to_string(), Unit::new("site-2", 2));
        job
    }

    #[tokio::test]
    async fn save_and_get_job_roundtrip() {
        let store = InMemoryStateContract::new();
        let job = sample_job();
        store.save_job(&job).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(store.get_job(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn job_status_follows_lifecycle() {
        let store = InMemoryStateContract::new();
        let job = sample_job();
        store.save_job(&job).await.unwrap();

        let updated = store
            .update_job_status(&job.id, JobStatus::Validating)
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Validating);

        let err = store
            .update_job_status(&job.id, JobStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
        assert_eq!(store.list_job_ids(JobStatus::Validating), vec![job.id]);
    }

    #[tokio::test]
    async fn concurrent_starts_dispatch_a_phase_once() {
        let store = Arc::new(InMemoryStateContract::new());
        let job = sample_job();
        store.save_job(&job).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let job_id = job.id;
            handles.push(tokio::spawn(async move {
                store
                    .update_unit_phase_status(&job_id, "site-1", "create-network", &UnitPhaseUpdate::Started)
                    .await
                    .is_ok()
            }));
        }
        let mut started = 0;
        for handle in handles {
            if handle.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn unit_helpers_modify_one_unit() {
        let store = InMemoryStateContract::new();
        let job = sample_job();
        store.save_job(&job).await.unwrap();

        store
            .merge_unit_resolved(&job.id, "site-1", json!({ "network_id": "N_1", "_trace": 1 }).as_object().unwrap())
            .await
            .unwrap();
        store
            .set_unit_status(&job.id, "site-2", UnitStatus::Failed)
            .await
            .unwrap();

        let site1 = store.get_unit(&job.id, "site-1").await.unwrap().unwrap();
        assert_eq!(site1.resolved["network_id"], "N_1");
        assert!(!site1.resolved.contains_key("_trace"));
        let site2 = store.get_unit(&job.id, "site-2").await.unwrap().unwrap();
        assert_eq!(site2.status, UnitStatus::Failed);

        let err = store
            .set_unit_status(&job.id, "site-9", UnitStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[tokio::test]
    async fn activities_and_cancellation_flag() {
        let store = InMemoryStateContract::new();
        let job = sample_job();
        store.save_job(&job).await.unwrap();

        let activity = ActivityRef::new("op-1", job.id, Some("site-1".to_string()), "create-network");
        store.register_activity(&activity).await.unwrap();
        assert_eq!(store.get_pending_activities().await.unwrap().len(), 1);
        store.complete_activity("op-1", &job.id).await.unwrap();
        store.complete_activity("op-unknown", &job.id).await.unwrap();
        assert!(store.get_pending_activities().await.unwrap().is_empty());

        assert!(!store.is_cancelled(&job.id).await.unwrap());
        store.request_cancel(&job.id).await.unwrap();
        assert!(store.is_cancelled(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn validation_summary_write_keeps_cancel_flag() {
        let store = InMemoryStateContract::new();
        let job = sample_job();
        store.save_job(&job).await.unwrap();
        store.request_cancel(&job.id).await.unwrap();

        let summary = json!({ "sites": 2, "warnings": [] });
        store.set_validation_summary(&job.id, Some(&summary)).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.validation_summary, Some(summary));
        assert!(loaded.cancel_requested);

        store.set_validation_summary(&job.id, None).await.unwrap();
        assert!(store.get_job(&job.id).await.unwrap().unwrap().validation_summary.is_none());
        let err = store
            .set_validation_summary(&Uuid::now_v7(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[tokio::test]
    async fn published_events_are_logged_and_broadcast() {
        let store = InMemoryStateContract::new();
        let job_id = Uuid::now_v7();
        let mut rx = store.subscribe();

        store
            .publish_event(&job_id, "phase_started", &json!({ "phase_id": "attach" }))
            .await
            .unwrap();

        let events = store.events_for(&job_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "phase_started");
        assert_eq!(rx.recv().await.unwrap().data["phase_id"], "attach");
    }
}
