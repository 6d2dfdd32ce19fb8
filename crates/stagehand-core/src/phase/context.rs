//! Execution context handed to every phase invocation.

use std::sync::Arc;
use std::time::Duration;

use stagehand_types::activity::ActivityResult;
use stagehand_types::error::PhaseError;
use stagehand_types::job::JobScope;
use stagehand_types::FieldMap;
use uuid::Uuid;

use crate::activity::{ActivityTracker, TrackerError};
use crate::state::BoxStateContract;

/// What a phase knows about where it runs, plus handles to the tracker and
/// the state contract.
#[derive(Clone)]
pub struct PhaseContext {
    pub job_id: Uuid,
    /// `None` for global phases.
    pub unit_id: Option<String>,
    pub unit_number: Option<u32>,
    pub phase_id: String,
    pub scope: JobScope,
    pub options: Arc<FieldMap>,
    pub tracker: Arc<ActivityTracker>,
    pub state: BoxStateContract,
}

impl PhaseContext {
    /// Register an outstanding external operation against this phase.
    pub async fn register_activity(&self, correlation_id: impl Into<String>) -> Result<(), PhaseError> {
        self.tracker
            .register(correlation_id, self.job_id, self.unit_id.as_deref(), &self.phase_id)
            .await
            .map_err(tracker_error)
    }

    /// Wait for an activity's terminal result, using the tracker's default
    /// wait timeout when `timeout` is `None`.
    ///
    /// A failed or timed-out activity is returned as `Ok` with
    /// `success == false`; the phase decides what that means.
    pub async fn await_activity(
        &self,
        correlation_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ActivityResult, PhaseError> {
        let timeout = timeout.unwrap_or_else(|| self.tracker.config().default_wait_timeout());
        self.tracker
            .wait(correlation_id, timeout)
            .await
            .map_err(tracker_error)
    }

    /// Register and wait in one step, turning an unsuccessful outcome into
    /// `PhaseError::Activity`. Returns the remote resource id, if any.
    pub async fn run_activity(
        &self,
        correlation_id: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, PhaseError> {
        let correlation_id = correlation_id.into();
        self.register_activity(correlation_id.clone()).await?;
        let result = self.await_activity(&correlation_id, timeout).await?;
        if result.success {
            Ok(result.resource_id)
        } else {
            Err(PhaseError::Activity(
                result.reason.unwrap_or_else(|| format!("activity {correlation_id} failed")),
            ))
        }
    }

    pub fn option(&self, name: &str) -> Option<&serde_json::Value> {
        self.options.get(name)
    }
}

impl std::fmt::Debug for PhaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseContext")
            .field("job_id", &self.job_id)
            .field("unit_id", &self.unit_id)
            .field("phase_id", &self.phase_id)
            .finish_non_exhaustive()
    }
}

fn tracker_error(err: TrackerError) -> PhaseError {
    match err {
        TrackerError::State(e) => PhaseError::State(e),
        other => PhaseError::Activity(other.to_string()),
    }
}
