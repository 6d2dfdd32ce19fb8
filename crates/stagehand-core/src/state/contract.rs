//! State contract trait definition.
//!
//! Defines the storage interface for jobs, units, and pending activities, plus
//! cross-process signalling (cancellation flag, progress events). The
//! infrastructure layer (stagehand-infra) implements this trait in memory and
//! on SQLite.

use std::collections::HashMap;

use stagehand_types::activity::ActivityRef;
use stagehand_types::error::StateError;
use stagehand_types::job::{Job, JobError, JobStatus};
use stagehand_types::phase::{PhaseStatus, UnitPhaseUpdate};
use stagehand_types::unit::{Unit, UnitStatus};
use stagehand_types::FieldMap;
use uuid::Uuid;

/// Storage interface consumed by the tracker and the brain.
///
/// Covers three entity families:
/// - **Jobs:** whole-record read/write plus atomic status and error helpers.
/// - **Units:** whole-record read/write plus atomic phase transitions.
/// - **Activities:** pending external operations, for restart recovery.
///
/// Every helper that modifies part of a record must perform the read, the
/// modification, and the write atomically with respect to other callers,
/// including other processes sharing the store.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StateContract: Send + Sync {
    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Write the whole job record, including its units.
    fn save_job(&self, job: &Job) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    fn get_job(
        &self,
        job_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Job>, StateError>> + Send;

    /// Atomically move the job to `status`, validating the lifecycle.
    ///
    /// Returns the updated job, or `StateError::Conflict` if the transition is
    /// not allowed from the stored status.
    fn update_job_status(
        &self,
        job_id: &Uuid,
        status: JobStatus,
    ) -> impl std::future::Future<Output = Result<Job, StateError>> + Send;

    fn append_job_error(
        &self,
        job_id: &Uuid,
        error: &JobError,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Atomically replace the job's validation summary.
    fn set_validation_summary(
        &self,
        job_id: &Uuid,
        summary: Option<&serde_json::Value>,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    // -----------------------------------------------------------------------
    // Units
    // -----------------------------------------------------------------------

    fn save_unit(
        &self,
        job_id: &Uuid,
        unit: &Unit,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    fn get_unit(
        &self,
        job_id: &Uuid,
        unit_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Unit>, StateError>> + Send;

    fn save_all_units(
        &self,
        job_id: &Uuid,
        units: &[Unit],
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Atomically apply a phase transition to one unit via [`Unit::apply`].
    fn update_unit_phase_status(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        phase_id: &str,
        update: &UnitPhaseUpdate,
    ) -> impl std::future::Future<Output = Result<Unit, StateError>> + Send;

    /// Atomically merge output fields into a unit's `resolved` bag.
    fn merge_unit_resolved(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        fields: &FieldMap,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Atomically move a non-terminal unit to a terminal status.
    fn set_unit_status(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        status: UnitStatus,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    // -----------------------------------------------------------------------
    // Global phases
    // -----------------------------------------------------------------------

    /// Atomically set a global phase's status, storing `result` when given.
    fn update_global_phase_status(
        &self,
        job_id: &Uuid,
        phase_id: &str,
        status: PhaseStatus,
        result: Option<&FieldMap>,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    // -----------------------------------------------------------------------
    // Activities
    // -----------------------------------------------------------------------

    fn register_activity(
        &self,
        activity: &ActivityRef,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Mark an activity as no longer pending. Unknown ids are not an error.
    fn complete_activity(
        &self,
        correlation_id: &str,
        job_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    fn get_pending_activities(
        &self,
    ) -> impl std::future::Future<Output = Result<HashMap<String, ActivityRef>, StateError>> + Send;

    // -----------------------------------------------------------------------
    // Signalling
    // -----------------------------------------------------------------------

    fn is_cancelled(
        &self,
        job_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, StateError>> + Send;

    /// Set the job's cancellation flag. The flag is sticky.
    fn request_cancel(
        &self,
        job_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Fire-and-forget progress notification. Callers ignore failures.
    fn publish_event(
        &self,
        job_id: &Uuid,
        event_type: &str,
        data: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;
}
