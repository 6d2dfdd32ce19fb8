//! BoxStateContract -- object-safe dynamic dispatch wrapper for StateContract.
//!
//! Follows the blanket-impl pattern used for every RPITIT port:
//! 1. Define an object-safe `StateContractDyn` trait with boxed futures
//! 2. Blanket-impl `StateContractDyn` for all `T: StateContract`
//! 3. `BoxStateContract` wraps `Arc<dyn StateContractDyn>` and delegates
//!
//! The handle is shared by the brain, the tracker, and every phase context, so
//! it is reference counted and cheap to clone.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stagehand_types::activity::ActivityRef;
use stagehand_types::error::StateError;
use stagehand_types::job::{Job, JobError, JobStatus};
use stagehand_types::phase::{PhaseStatus, UnitPhaseUpdate};
use stagehand_types::unit::{Unit, UnitStatus};
use stagehand_types::FieldMap;
use uuid::Uuid;

use super::contract::StateContract;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StateError>> + Send + 'a>>;

/// Object-safe version of [`StateContract`] with boxed futures.
pub trait StateContractDyn: Send + Sync {
    fn save_job_boxed<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, ()>;
    fn get_job_boxed<'a>(&'a self, job_id: &'a Uuid) -> BoxFuture<'a, Option<Job>>;
    fn update_job_status_boxed<'a>(&'a self, job_id: &'a Uuid, status: JobStatus) -> BoxFuture<'a, Job>;
    fn append_job_error_boxed<'a>(&'a self, job_id: &'a Uuid, error: &'a JobError) -> BoxFuture<'a, ()>;
    fn set_validation_summary_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        summary: Option<&'a serde_json::Value>,
    ) -> BoxFuture<'a, ()>;
    fn save_unit_boxed<'a>(&'a self, job_id: &'a Uuid, unit: &'a Unit) -> BoxFuture<'a, ()>;
    fn get_unit_boxed<'a>(&'a self, job_id: &'a Uuid, unit_id: &'a str) -> BoxFuture<'a, Option<Unit>>;
    fn save_all_units_boxed<'a>(&'a self, job_id: &'a Uuid, units: &'a [Unit]) -> BoxFuture<'a, ()>;
    fn update_unit_phase_status_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        unit_id: &'a str,
        phase_id: &'a str,
        update: &'a UnitPhaseUpdate,
    ) -> BoxFuture<'a, Unit>;
    fn merge_unit_resolved_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        unit_id: &'a str,
        fields: &'a FieldMap,
    ) -> BoxFuture<'a, ()>;
    fn set_unit_status_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        unit_id: &'a str,
        status: UnitStatus,
    ) -> BoxFuture<'a, ()>;
    fn update_global_phase_status_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        phase_id: &'a str,
        status: PhaseStatus,
        result: Option<&'a FieldMap>,
    ) -> BoxFuture<'a, ()>;
    fn register_activity_boxed<'a>(&'a self, activity: &'a ActivityRef) -> BoxFuture<'a, ()>;
    fn complete_activity_boxed<'a>(&'a self, correlation_id: &'a str, job_id: &'a Uuid) -> BoxFuture<'a, ()>;
    fn get_pending_activities_boxed(&self) -> BoxFuture<'_, HashMap<String, ActivityRef>>;
    fn is_cancelled_boxed<'a>(&'a self, job_id: &'a Uuid) -> BoxFuture<'a, bool>;
    fn request_cancel_boxed<'a>(&'a self, job_id: &'a Uuid) -> BoxFuture<'a, ()>;
    fn publish_event_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        event_type: &'a str,
        data: &'a serde_json::Value,
    ) -> BoxFuture<'a, ()>;
}

/// Blanket implementation: any `StateContract` automatically implements `StateContractDyn`.
impl<T: StateContract> StateContractDyn for T {
    fn save_job_boxed<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, ()> {
        Box::pin(self.save_job(job))
    }

    fn get_job_boxed<'a>(&'a self, job_id: &'a Uuid) -> BoxFuture<'a, Option<Job>> {
        Box::pin(self.get_job(job_id))
    }

    fn update_job_status_boxed<'a>(&'a self, job_id: &'a Uuid, status: JobStatus) -> BoxFuture<'a, Job> {
        Box::pin(self.update_job_status(job_id, status))
    }

    fn append_job_error_boxed<'a>(&'a self, job_id: &'a Uuid, error: &'a JobError) -> BoxFuture<'a, ()> {
        Box::pin(self.append_job_error(job_id, error))
    }

    fn set_validation_summary_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        summary: Option<&'a serde_json::Value>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.set_validation_summary(job_id, summary))
    }

    fn save_unit_boxed<'a>(&'a self, job_id: &'a Uuid, unit: &'a Unit) -> BoxFuture<'a, ()> {
        Box::pin(self.save_unit(job_id, unit))
    }

    fn get_unit_boxed<'a>(&'a self, job_id: &'a Uuid, unit_id: &'a str) -> BoxFuture<'a, Option<Unit>> {
        Box::pin(self.get_unit(job_id, unit_id))
    }

    fn save_all_units_boxed<'a>(&'a self, job_id: &'a Uuid, units: &'a [Unit]) -> BoxFuture<'a, ()> {
        Box::pin(self.save_all_units(job_id, units))
    }

    fn update_unit_phase_status_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        unit_id: &'a str,
        phase_id: &'a str,
        update: &'a UnitPhaseUpdate,
    ) -> BoxFuture<'a, Unit> {
        Box::pin(self.update_unit_phase_status(job_id, unit_id, phase_id, update))
    }

    fn merge_unit_resolved_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        unit_id: &'a str,
        fields: &'a FieldMap,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.merge_unit_resolved(job_id, unit_id, fields))
    }

    fn set_unit_status_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        unit_id: &'a str,
        status: UnitStatus,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.set_unit_status(job_id, unit_id, status))
    }

    fn update_global_phase_status_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        phase_id: &'a str,
        status: PhaseStatus,
        result: Option<&'a FieldMap>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.update_global_phase_status(job_id, phase_id, status, result))
    }

    fn register_activity_boxed<'a>(&'a self, activity: &'a ActivityRef) -> BoxFuture<'a, ()> {
        Box::pin(self.register_activity(activity))
    }

    fn complete_activity_boxed<'a>(&'a self, correlation_id: &'a str, job_id: &'a Uuid) -> BoxFuture<'a, ()> {
        Box::pin(self.complete_activity(correlation_id, job_id))
    }

    fn get_pending_activities_boxed(&self) -> BoxFuture<'_, HashMap<String, ActivityRef>> {
        Box::pin(self.get_pending_activities())
    }

    fn is_cancelled_boxed<'a>(&'a self, job_id: &'a Uuid) -> BoxFuture<'a, bool> {
        Box::pin(self.is_cancelled(job_id))
    }

    fn request_cancel_boxed<'a>(&'a self, job_id: &'a Uuid) -> BoxFuture<'a, ()> {
        Box::pin(self.request_cancel(job_id))
    }

    fn publish_event_boxed<'a>(
        &'a self,
        job_id: &'a Uuid,
        event_type: &'a str,
        data: &'a serde_json::Value,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.publish_event(job_id, event_type, data))
    }
}

/// Type-erased, shareable state contract.
///
/// Since `StateContract` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxStateContract` provides equivalent methods that delegate to
/// the inner `StateContractDyn` trait object.
#[derive(Clone)]
pub struct BoxStateContract {
    inner: Arc<dyn StateContractDyn>,
}

impl BoxStateContract {
    /// Wrap a concrete `StateContract` in a type-erased handle.
    pub fn new<T: StateContract + 'static>(contract: T) -> Self {
        Self {
            inner: Arc::new(contract),
        }
    }

    /// Wrap an already shared `StateContract`.
    pub fn from_arc<T: StateContract + 'static>(contract: Arc<T>) -> Self {
        Self { inner: contract }
    }

    pub async fn save_job(&self, job: &Job) -> Result<(), StateError> {
        self.inner.save_job_boxed(job).await
    }

    pub async fn get_job(&self, job_id: &Uuid) -> Result<Option<Job>, StateError> {
        self.inner.get_job_boxed(job_id).await
    }

    pub async fn update_job_status(&self, job_id: &Uuid, status: JobStatus) -> Result<Job, StateError> {
        self.inner.update_job_status_boxed(job_id, status).await
    }

    pub async fn append_job_error(&self, job_id: &Uuid, error: &JobError) -> Result<(), StateError> {
        self.inner.append_job_error_boxed(job_id, error).await
    }

    pub async fn set_validation_summary(
        &self,
        job_id: &Uuid,
        summary: Option<&serde_json::Value>,
    ) -> Result<(), StateError> {
        self.inner.set_validation_summary_boxed(job_id, summary).await
    }

    pub async fn save_unit(&self, job_id: &Uuid, unit: &Unit) -> Result<(), StateError> {
        self.inner.save_unit_boxed(job_id, unit).await
    }

    pub async fn get_unit(&self, job_id: &Uuid, unit_id: &str) -> Result<Option<Unit>, StateError> {
        self.inner.get_unit_boxed(job_id, unit_id).await
    }

    pub async fn save_all_units(&self, job_id: &Uuid, units: &[Unit]) -> Result<(), StateError> {
        self.inner.save_all_units_boxed(job_id, units).await
    }

    pub async fn update_unit_phase_status(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        phase_id: &str,
        update: &UnitPhaseUpdate,
    ) -> Result<Unit, StateError> {
        self.inner
            .update_unit_phase_status_boxed(job_id, unit_id, phase_id, update)
            .await
    }

    pub async fn merge_unit_resolved(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StateError> {
        self.inner.merge_unit_resolved_boxed(job_id, unit_id, fields).await
    }

    pub async fn set_unit_status(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        status: UnitStatus,
    ) -> Result<(), StateError> {
        self.inner.set_unit_status_boxed(job_id, unit_id, status).await
    }

    pub async fn update_global_phase_status(
        &self,
        job_id: &Uuid,
        phase_id: &str,
        status: PhaseStatus,
        result: Option<&FieldMap>,
    ) -> Result<(), StateError> {
        self.inner
            .update_global_phase_status_boxed(job_id, phase_id, status, result)
            .await
    }

    pub async fn register_activity(&self, activity: &ActivityRef) -> Result<(), StateError> {
        self.inner.register_activity_boxed(activity).await
    }

    pub async fn complete_activity(&self, correlation_id: &str, job_id: &Uuid) -> Result<(), StateError> {
        self.inner.complete_activity_boxed(correlation_id, job_id).await
    }

    pub async fn get_pending_activities(&self) -> Result<HashMap<String, ActivityRef>, StateError> {
        self.inner.get_pending_activities_boxed().await
    }

    pub async fn is_cancelled(&self, job_id: &Uuid) -> Result<bool, StateError> {
        self.inner.is_cancelled_boxed(job_id).await
    }

    pub async fn request_cancel(&self, job_id: &Uuid) -> Result<(), StateError> {
        self.inner.request_cancel_boxed(job_id).await
    }

    pub async fn publish_event(
        &self,
        job_id: &Uuid,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<(), StateError> {
        self.inner.publish_event_boxed(job_id, event_type, data).await
    }
}

impl std::fmt::Debug for BoxStateContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStateContract").finish_non_exhaustive()
    }
}
