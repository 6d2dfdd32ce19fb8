//! The workflow brain: job lifecycle, validation, and the execution loop.
//!
//! # Execution loop
//!
//! Each tick:
//!
//! 1. Apply results of finished phase executions through the state contract.
//! 2. Re-read the job (other tasks or processes may have advanced it).
//! 3. Check the cancellation flag. Once observed, nothing new is launched.
//! 4. Settle: units with no reachable work left are marked COMPLETED, global
//!    phases that can never run are marked BLOCKED.
//! 5. Stop if nothing is in flight and nothing reachable remains.
//! 6. Launch ready global phases, then at most one ready phase per unit,
//!    under the phase-concurrency ceiling and the activation slot ceiling.
//! 7. Emit a heartbeat when due.
//! 8. Wait up to one tick interval for an in-flight execution to finish.
//!
//! State contract failures abandon the tick; the next tick retries. Finished
//! results that could not be applied are kept and retried first.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use stagehand_types::config::EngineConfig;
use stagehand_types::error::{GraphError, PhaseError, StateError};
use stagehand_types::event::{HeartbeatSnapshot, JobEvent};
use stagehand_types::job::{Job, JobError, JobScope, JobStatus};
use stagehand_types::phase::{
    is_metadata_field, ActivationSlot, PhaseDefinition, PhaseResult, PhaseStatus, UnitPhaseUpdate,
    WorkflowDefinition,
};
use stagehand_types::unit::{Unit, UnitSeed, UnitStatus};
use stagehand_types::FieldMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::report::JobReport;
use super::slots::{ActivationSlots, SlotGuard};
use super::wiring;
use crate::activity::ActivityTracker;
use crate::event::EventBus;
use crate::graph::{DependencyGraph, Reachability};
use crate::phase::{BoxPhaseExecutor, PhaseContext, PhaseRegistry};
use crate::state::BoxStateContract;

/// Root phase output holding the unit seeds.
pub const UNITS_OUTPUT: &str = "units";

/// Root phase output stored as the job's validation summary.
pub const SUMMARY_OUTPUT: &str = "validation_summary";

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid phase graph: {0}")]
    Graph(#[from] GraphError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("cannot move job from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("no implementation registered for phase '{0}'")]
    UnknownPhase(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// WorkflowBrain
// ---------------------------------------------------------------------------

/// Schedules jobs for one worker process.
///
/// The phase-concurrency semaphore and the activation slots are shared by
/// every job this brain executes.
pub struct WorkflowBrain {
    state: BoxStateContract,
    tracker: Arc<ActivityTracker>,
    registry: PhaseRegistry,
    config: EngineConfig,
    events: EventBus,
    phase_permits: Arc<Semaphore>,
    slots: Arc<ActivationSlots>,
    /// Cancellation tokens of jobs executing in this process.
    active: DashMap<Uuid, CancellationToken>,
}

impl WorkflowBrain {
    pub fn new(
        state: BoxStateContract,
        tracker: Arc<ActivityTracker>,
        registry: PhaseRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            phase_permits: Arc::new(Semaphore::new(config.max_concurrent_phases.max(1))),
            slots: Arc::new(ActivationSlots::new(config.max_activation_slots)),
            state,
            tracker,
            registry,
            config,
            events: EventBus::default(),
            active: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    /// Units currently holding an activation slot, across all jobs.
    pub fn slots_held(&self) -> usize {
        self.slots.held()
    }

    async fn emit(&self, event: JobEvent) {
        self.events.emit(&self.state, event).await;
    }

    async fn load(&self, job_id: Uuid) -> Result<Job, EngineError> {
        self.state
            .get_job(&job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    async fn set_status(&self, job: &Job, to: JobStatus) -> Result<Job, EngineError> {
        let from = job.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        let updated = self
            .state
            .update_job_status(&job.id, to)
            .await
            .map_err(|e| match e {
                StateError::Conflict(_) => EngineError::InvalidTransition { from, to },
                other => EngineError::State(other),
            })?;
        tracing::info!(job_id = %job.id, %from, %to, "job status changed");
        self.emit(JobEvent::JobStatusChanged {
            job_id: job.id,
            from,
            to,
        })
        .await;
        if to.is_terminal() {
            self.emit(JobEvent::JobFinished {
                job_id: job.id,
                status: to,
            })
            .await;
        }
        Ok(updated)
    }

    fn context(&self, job: &Job, unit: Option<&Unit>, phase_id: &str, options: Arc<FieldMap>) -> PhaseContext {
        PhaseContext {
            job_id: job.id,
            unit_id: unit.map(|u| u.unit_id.clone()),
            unit_number: unit.map(|u| u.unit_number),
            phase_id: phase_id.to_string(),
            scope: job.scope.clone(),
            options,
            tracker: Arc::clone(&self.tracker),
            state: self.state.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Validate the workflow graph and persist a new PENDING job.
    pub async fn create_job(
        &self,
        workflow: &WorkflowDefinition,
        scope: JobScope,
        options: FieldMap,
    ) -> Result<Job, EngineError> {
        let graph = DependencyGraph::new(&workflow.phases)?;
        let root = graph.phase(&workflow.root_phase).ok_or_else(|| {
            EngineError::Validation(format!("root phase '{}' is not declared", workflow.root_phase))
        })?;
        if root.per_unit || !root.depends_on.is_empty() {
            return Err(EngineError::Validation(format!(
                "root phase '{}' must be a global phase with no dependencies",
                root.id
            )));
        }
        if let Some(missing) = self.registry.missing(&workflow.phases).first() {
            return Err(EngineError::UnknownPhase((*missing).to_string()));
        }

        let job = Job::new(workflow, scope, options);
        self.state.save_job(&job).await?;
        tracing::info!(
            job_id = %job.id,
            workflow = %job.workflow,
            phases = graph.phases().len(),
            "job created"
        );
        Ok(job)
    }

    /// Run the root phase to populate the job's units, then wait for
    /// confirmation.
    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    pub async fn validate(&self, job_id: Uuid) -> Result<Job, EngineError> {
        let job = self.load(job_id).await?;
        let job = self.set_status(&job, JobStatus::Validating).await?;

        let outcome = self.run_root_phase(&job).await;

        // Partial writes only: a cancel request landing meanwhile must survive.
        let root = job.root_phase.clone();
        match outcome {
            Ok((seeds, outputs)) => {
                let units: Vec<Unit> = seeds.into_iter().map(Unit::from).collect();
                let results: FieldMap = outputs
                    .iter()
                    .filter(|(key, _)| *key != UNITS_OUTPUT && !is_metadata_field(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                self.state.save_all_units(&job_id, &units).await?;
                self.state
                    .set_validation_summary(&job_id, outputs.get(SUMMARY_OUTPUT))
                    .await?;
                self.state
                    .update_global_phase_status(&job_id, &root, PhaseStatus::Completed, Some(&results))
                    .await?;

                let job = self.load(job_id).await?;
                if job.cancel_requested {
                    tracing::info!("cancelled during validation");
                    return self.set_status(&job, JobStatus::Cancelled).await;
                }
                tracing::info!(units = job.units.len(), "validation complete, awaiting confirmation");
                self.set_status(&job, JobStatus::AwaitingConfirmation).await
            }
            Err(message) => {
                self.state
                    .update_global_phase_status(&job_id, &root, PhaseStatus::Failed, None)
                    .await?;
                self.state
                    .append_job_error(&job_id, &JobError::new(None, Some(root), &message))
                    .await?;
                let job = self.load(job_id).await?;
                if job.cancel_requested {
                    tracing::info!(error = %message, "cancelled during validation");
                    return self.set_status(&job, JobStatus::Cancelled).await;
                }
                tracing::warn!(error = %message, "validation failed");
                self.set_status(&job, JobStatus::Failed).await?;
                Err(EngineError::Validation(message))
            }
        }
    }

    async fn run_root_phase(&self, job: &Job) -> Result<(Vec<UnitSeed>, FieldMap), String> {
        let root = &job.root_phase;
        let timeout = job
            .phase_definitions
            .iter()
            .find(|p| &p.id == root)
            .and_then(|p| p.timeout_secs)
            .map_or_else(|| self.config.phase_timeout(), Duration::from_secs);
        let executor = self.registry.create(root);
        let inputs = match &executor {
            Some(executor) => wiring::assemble_global_inputs(executor.inputs(), job, &FieldMap::new()),
            None => Err(PhaseError::Failed(format!("no implementation registered for phase '{root}'"))),
        };
        let ctx = self.context(job, None, root, Arc::new(job.options.clone()));

        self.emit(JobEvent::PhaseStarted {
            job_id: job.id,
            unit_id: None,
            phase_id: root.clone(),
        })
        .await;
        let result = run_executor(executor, ctx, inputs, timeout).await;
        if !result.success {
            let error = result.error.unwrap_or_else(|| "validation phase failed".to_string());
            self.emit(JobEvent::PhaseFailed {
                job_id: job.id,
                unit_id: None,
                phase_id: root.clone(),
                error: error.clone(),
                critical: true,
            })
            .await;
            return Err(error);
        }
        self.emit(JobEvent::PhaseCompleted {
            job_id: job.id,
            unit_id: None,
            phase_id: root.clone(),
            duration_ms: result.duration_ms,
        })
        .await;

        let seeds = result
            .outputs
            .get(UNITS_OUTPUT)
            .cloned()
            .ok_or_else(|| format!("validation phase produced no '{UNITS_OUTPUT}' output"))?;
        let seeds: Vec<UnitSeed> = serde_json::from_value(seeds)
            .map_err(|e| format!("invalid '{UNITS_OUTPUT}' output: {e}"))?;
        if seeds.is_empty() {
            return Err("validation produced no units".to_string());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = seeds.iter().find(|s| !seen.insert(s.unit_id.as_str())) {
            return Err(format!("duplicate unit id '{}'", dup.unit_id));
        }
        Ok((seeds, result.outputs))
    }

    /// Move a validated job to RUNNING, or to CANCELLED if a cancel request
    /// arrived after validation finished.
    pub async fn confirm(&self, job_id: Uuid) -> Result<Job, EngineError> {
        let job = self.load(job_id).await?;
        if job.cancel_requested && job.status == JobStatus::AwaitingConfirmation {
            tracing::info!(%job_id, "cancel requested before confirmation");
            return self.set_status(&job, JobStatus::Cancelled).await;
        }
        self.set_status(&job, JobStatus::Running).await
    }

    /// Request cancellation.
    ///
    /// Jobs that have not started running are cancelled immediately. A
    /// running job stops launching new work at its next tick and finishes as
    /// CANCELLED once in-flight executions end. Terminal jobs are returned
    /// unchanged.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, EngineError> {
        let job = self.load(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        self.state.request_cancel(&job_id).await?;
        if let Some(token) = self.active.get(&job_id) {
            token.cancel();
        }
        tracing::info!(%job_id, status = %job.status, "cancellation requested");
        match job.status {
            JobStatus::Pending | JobStatus::AwaitingConfirmation => {
                self.set_status(&job, JobStatus::Cancelled).await
            }
            _ => self.load(job_id).await,
        }
    }

    /// Validate, confirm, and execute in one call, for callers that do not
    /// need an interactive confirmation step.
    pub async fn run(&self, job_id: Uuid) -> Result<Job, EngineError> {
        let job = self.validate(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let job = self.confirm(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        self.execute(job_id).await
    }

    pub async fn report(&self, job_id: Uuid) -> Result<JobReport, EngineError> {
        Ok(JobReport::from_job(&self.load(job_id).await?))
    }

    /// Drive a RUNNING job to a terminal status.
    ///
    /// Also resumes a job left RUNNING by a previous process: interrupted
    /// phases are re-dispatched and slot holders rebuilt from unit state.
    /// Every in-flight phase is treated as interrupted, so a resume must only
    /// be started once the worker that owned the job is gone. Running two
    /// `execute` calls on one job at the same time dispatches phases twice.
    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    pub async fn execute(&self, job_id: Uuid) -> Result<Job, EngineError> {
        let job = self.load(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if job.status != JobStatus::Running {
            return Err(EngineError::InvalidTransition {
                from: job.status,
                to: JobStatus::Running,
            });
        }
        let graph = DependencyGraph::new(&job.phase_definitions)?;

        let cancel = CancellationToken::new();
        self.active.insert(job_id, cancel.clone());
        let mut execution = Execution::new(self, &job, graph, cancel);
        let outcome = execution.drive(job).await;
        self.active.remove(&job_id);
        outcome
    }
}

impl std::fmt::Debug for WorkflowBrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowBrain")
            .field("registry", &self.registry)
            .field("slots_held", &self.slots.held())
            .field("active_jobs", &self.active.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

enum Launch {
    Started,
    /// No activation slot free for an acquire-tagged phase.
    NoSlot,
    /// The phase-concurrency ceiling is reached.
    Saturated,
    /// The store refused the dispatch; someone else owns it.
    Conflict,
}

/// State of one `execute` call.
struct Execution<'a> {
    brain: &'a WorkflowBrain,
    job_id: Uuid,
    graph: DependencyGraph,
    options: Arc<FieldMap>,
    /// Phases whose skip condition matched the job options.
    skipped: HashSet<String>,
    tasks: JoinSet<PhaseResult>,
    launched: HashMap<tokio::task::Id, (String, Option<String>)>,
    running_units: HashSet<String>,
    running_globals: HashSet<String>,
    /// Finished results not yet applied to the store.
    backlog: Vec<PhaseResult>,
    cancel: CancellationToken,
    cancelled: bool,
    next_heartbeat: Instant,
}

impl<'a> Execution<'a> {
    fn new(brain: &'a WorkflowBrain, job: &Job, graph: DependencyGraph, cancel: CancellationToken) -> Self {
        Self {
            brain,
            job_id: job.id,
            graph,
            options: Arc::new(job.options.clone()),
            skipped: HashSet::new(),
            tasks: JoinSet::new(),
            launched: HashMap::new(),
            running_units: HashSet::new(),
            running_globals: HashSet::new(),
            backlog: Vec::new(),
            cancel,
            cancelled: false,
            next_heartbeat: Instant::now() + brain.config.heartbeat_interval(),
        }
    }

    async fn drive(&mut self, job: Job) -> Result<Job, EngineError> {
        self.prepare(&job).await?;
        let tick = self.brain.config.tick_interval();
        loop {
            while let Some(joined) = self.tasks.try_join_next_with_id() {
                self.collect(joined);
            }
            match self.tick().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(EngineError::State(e)) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "state contract error, retrying next tick");
                }
                Err(e) => return Err(e),
            }
            self.wait(tick).await;
        }
        self.finish().await
    }

    /// Evaluate skip conditions, clear dispatches left by a previous process,
    /// and rebuild slot holders.
    async fn prepare(&mut self, job: &Job) -> Result<(), EngineError> {
        let state = &self.brain.state;
        self.skipped = job
            .phase_definitions
            .iter()
            .filter(|p| p.skip_if.as_ref().is_some_and(|c| c.matches(&job.options)))
            .map(|p| p.id.clone())
            .collect();
        if !self.skipped.is_empty() {
            tracing::info!(job_id = %job.id, skipped = ?self.skipped, "phases skipped by job options");
        }

        for unit in job.units.values() {
            if let Some(phase_id) = &unit.current_phase {
                tracing::warn!(
                    job_id = %job.id,
                    unit_id = %unit.unit_id,
                    phase_id = %phase_id,
                    "re-dispatching interrupted phase"
                );
                state
                    .update_unit_phase_status(&job.id, &unit.unit_id, phase_id, &UnitPhaseUpdate::Interrupted)
                    .await?;
            }
        }
        for (phase_id, status) in &job.global_phase_status {
            if *status == PhaseStatus::Running {
                tracing::warn!(job_id = %job.id, phase_id = %phase_id, "re-dispatching interrupted global phase");
                state
                    .update_global_phase_status(&job.id, phase_id, PhaseStatus::Pending, None)
                    .await?;
            }
        }

        let tagged = |slot: ActivationSlot| -> Vec<&str> {
            job.phase_definitions
                .iter()
                .filter(|p| p.activation_slot == slot)
                .map(|p| p.id.as_str())
                .collect()
        };
        let (acquire, release) = (tagged(ActivationSlot::Acquire), tagged(ActivationSlot::Release));
        let holders: Vec<String> = job
            .units
            .values()
            .filter(|u| !u.status.is_terminal())
            .filter(|u| acquire.iter().any(|p| u.completed_phases.contains(*p)))
            .filter(|u| !release.iter().any(|p| u.is_attempted(p)))
            .map(|u| slot_key(job.id, &u.unit_id))
            .collect();
        if !holders.is_empty() {
            tracing::info!(job_id = %job.id, holders = holders.len(), "restored activation slot holders");
            self.brain.slots.restore(holders);
        }

        if let Err(e) = self.brain.tracker.recover().await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to recover pending activities");
        }
        tracing::info!(job_id = %job.id, units = job.units.len(), "execution started");
        Ok(())
    }

    fn collect(&mut self, joined: Result<(tokio::task::Id, PhaseResult), tokio::task::JoinError>) {
        match joined {
            Ok((id, result)) => {
                self.launched.remove(&id);
                self.backlog.push(result);
            }
            Err(e) => {
                if let Some((phase_id, unit_id)) = self.launched.remove(&e.id()) {
                    self.backlog.push(PhaseResult::failed(
                        phase_id,
                        unit_id,
                        format!("phase task aborted: {e}"),
                        0,
                    ));
                }
            }
        }
    }

    async fn wait(&mut self, tick: Duration) {
        if self.tasks.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = self.cancel.cancelled(), if !self.cancelled => {}
            }
            return;
        }
        let joined = tokio::select! {
            joined = self.tasks.join_next_with_id() => joined,
            _ = tokio::time::sleep(tick) => None,
            _ = self.cancel.cancelled(), if !self.cancelled => None,
        };
        if let Some(joined) = joined {
            self.collect(joined);
        }
    }

    /// One scheduling pass. Returns `true` when the job is done.
    async fn tick(&mut self) -> Result<bool, EngineError> {
        let mut pending = std::mem::take(&mut self.backlog).into_iter();
        while let Some(result) = pending.next() {
            match self.apply_result(&result).await {
                Ok(()) => {}
                Err(StateError::Conflict(reason)) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        phase_id = %result.phase_id,
                        unit_id = ?result.unit_id,
                        reason = %reason,
                        "dropping phase result the store refused"
                    );
                }
                Err(e) => {
                    self.backlog.push(result);
                    self.backlog.extend(pending);
                    return Err(e.into());
                }
            }
            match &result.unit_id {
                Some(unit_id) => self.running_units.remove(unit_id),
                None => self.running_globals.remove(&result.phase_id),
            };
        }

        let job = self.brain.load(self.job_id).await?;
        if !self.cancelled
            && (self.cancel.is_cancelled() || self.brain.state.is_cancelled(&self.job_id).await?)
        {
            self.cancelled = true;
            tracing::info!(
                job_id = %self.job_id,
                in_flight = self.tasks.len(),
                "cancellation observed, no new work will be launched"
            );
        }

        let units = job.ordered_units();
        let reach = self.graph.reachability(&units, &job.global_phase_status);
        self.settle(&job, &reach).await?;

        if self.tasks.is_empty() {
            let work_left = !reach.pending_globals.is_empty()
                || reach.remaining.values().any(|phases| !phases.is_empty());
            if self.cancelled || !work_left {
                return Ok(true);
            }
        }

        if !self.cancelled {
            self.launch_globals(&job).await?;
            self.launch_units(&job).await?;
        }
        self.heartbeat(&job).await;
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    async fn apply_result(&self, result: &PhaseResult) -> Result<(), StateError> {
        let Some(phase) = self.graph.phase(&result.phase_id) else {
            return Ok(());
        };
        let state = &self.brain.state;
        let job_id = self.job_id;

        let Some(unit_id) = &result.unit_id else {
            return self.apply_global_result(phase, result).await;
        };
        let key = slot_key(job_id, unit_id);

        if result.success {
            state.merge_unit_resolved(&job_id, unit_id, &result.outputs).await?;
            state
                .update_unit_phase_status(&job_id, unit_id, &phase.id, &UnitPhaseUpdate::Completed)
                .await?;
            if phase.activation_slot == ActivationSlot::Release {
                self.brain.slots.release(&key);
            }
            tracing::debug!(
                job_id = %job_id,
                unit_id = %unit_id,
                phase_id = %phase.id,
                duration_ms = result.duration_ms,
                "phase completed"
            );
            self.brain
                .emit(JobEvent::PhaseCompleted {
                    job_id,
                    unit_id: Some(unit_id.clone()),
                    phase_id: phase.id.clone(),
                    duration_ms: result.duration_ms,
                })
                .await;
            return Ok(());
        }

        let error = result.error.clone().unwrap_or_else(|| "phase failed".to_string());
        state
            .update_unit_phase_status(
                &job_id,
                unit_id,
                &phase.id,
                &UnitPhaseUpdate::Failed {
                    error: error.clone(),
                    critical: phase.critical,
                },
            )
            .await?;
        state
            .append_job_error(
                &job_id,
                &JobError::new(Some(unit_id.clone()), Some(phase.id.clone()), &error),
            )
            .await?;
        if phase.critical || phase.activation_slot == ActivationSlot::Release {
            self.brain.slots.release(&key);
        }
        tracing::info!(
            job_id = %job_id,
            unit_id = %unit_id,
            phase_id = %phase.id,
            critical = phase.critical,
            error = %error,
            "phase failed"
        );
        self.brain
            .emit(JobEvent::PhaseFailed {
                job_id,
                unit_id: Some(unit_id.clone()),
                phase_id: phase.id.clone(),
                error,
                critical: phase.critical,
            })
            .await;
        if phase.critical {
            self.brain
                .emit(JobEvent::UnitFailed {
                    job_id,
                    unit_id: unit_id.clone(),
                    phase_id: phase.id.clone(),
                })
                .await;
        }
        Ok(())
    }

    async fn apply_global_result(&self, phase: &PhaseDefinition, result: &PhaseResult) -> Result<(), StateError> {
        let state = &self.brain.state;
        let job_id = self.job_id;

        if result.success {
            let outputs: FieldMap = result
                .outputs
                .iter()
                .filter(|(key, _)| !is_metadata_field(key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            state
                .update_global_phase_status(&job_id, &phase.id, PhaseStatus::Completed, Some(&outputs))
                .await?;
            tracing::info!(job_id = %job_id, phase_id = %phase.id, duration_ms = result.duration_ms, "global phase completed");
            self.brain
                .emit(JobEvent::PhaseCompleted {
                    job_id,
                    unit_id: None,
                    phase_id: phase.id.clone(),
                    duration_ms: result.duration_ms,
                })
                .await;
            return Ok(());
        }

        let error = result.error.clone().unwrap_or_else(|| "phase failed".to_string());
        state
            .update_global_phase_status(&job_id, &phase.id, PhaseStatus::Failed, None)
            .await?;
        state
            .append_job_error(&job_id, &JobError::new(None, Some(phase.id.clone()), &error))
            .await?;
        tracing::info!(job_id = %job_id, phase_id = %phase.id, critical = phase.critical, error = %error, "global phase failed");

        // A critical global phase owns every unit's pipeline.
        if phase.critical {
            if let Some(job) = state.get_job(&job_id).await? {
                for unit in job.units.values().filter(|u| !u.status.is_terminal()) {
                    state.set_unit_status(&job_id, &unit.unit_id, UnitStatus::Failed).await?;
                    self.brain.slots.release(&slot_key(job_id, &unit.unit_id));
                    self.brain
                        .emit(JobEvent::UnitFailed {
                            job_id,
                            unit_id: unit.unit_id.clone(),
                            phase_id: phase.id.clone(),
                        })
                        .await;
                }
            }
        }
        self.brain
            .emit(JobEvent::PhaseFailed {
                job_id,
                unit_id: None,
                phase_id: phase.id.clone(),
                error,
                critical: phase.critical,
            })
            .await;
        Ok(())
    }

    /// Finish units with nothing reachable left and block dead global phases.
    async fn settle(&mut self, job: &Job, reach: &Reachability) -> Result<(), EngineError> {
        let state = &self.brain.state;
        for phase_id in &reach.blocked_globals {
            state
                .update_global_phase_status(&self.job_id, phase_id, PhaseStatus::Blocked, None)
                .await?;
            tracing::warn!(job_id = %self.job_id, phase_id = %phase_id, "global phase blocked by failed dependency");
            self.brain
                .emit(JobEvent::PhaseBlocked {
                    job_id: self.job_id,
                    phase_id: phase_id.clone(),
                })
                .await;
        }

        for unit in job.units.values() {
            let key = slot_key(self.job_id, &unit.unit_id);
            if unit.status == UnitStatus::Failed {
                self.brain.slots.release(&key);
                continue;
            }
            if unit.status.is_terminal()
                || unit.current_phase.is_some()
                || self.running_units.contains(&unit.unit_id)
                || reach.has_remaining(&unit.unit_id)
            {
                continue;
            }
            state
                .set_unit_status(&self.job_id, &unit.unit_id, UnitStatus::Completed)
                .await?;
            self.brain.slots.release(&key);
            tracing::info!(
                job_id = %self.job_id,
                unit_id = %unit.unit_id,
                completed = unit.completed_phases.len(),
                failed = unit.failed_phases.len(),
                "unit finished"
            );
            self.brain
                .emit(JobEvent::UnitCompleted {
                    job_id: self.job_id,
                    unit_id: unit.unit_id.clone(),
                })
                .await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Launching
    // -----------------------------------------------------------------------

    /// Per-unit phases completed by every non-failed unit.
    fn complete_for_all_units(&self, job: &Job) -> HashSet<String> {
        let live: Vec<&Unit> = job
            .units
            .values()
            .filter(|u| u.status != UnitStatus::Failed)
            .collect();
        if live.is_empty() {
            return HashSet::new();
        }
        self.graph
            .per_unit_phases()
            .filter(|p| live.iter().all(|u| u.completed_phases.contains(&p.id)))
            .map(|p| p.id.clone())
            .collect()
    }

    async fn launch_globals(&mut self, job: &Job) -> Result<(), EngineError> {
        let complete_for_all = self.complete_for_all_units(job);
        let ready: Vec<PhaseDefinition> = self
            .graph
            .ready_global(&job.global_phase_status, &complete_for_all)
            .into_iter()
            .filter(|p| !self.running_globals.contains(&p.id))
            .cloned()
            .collect();

        for phase in ready {
            let state = &self.brain.state;
            if self.skipped.contains(&phase.id) {
                state
                    .update_global_phase_status(&self.job_id, &phase.id, PhaseStatus::Skipped, None)
                    .await?;
                tracing::info!(job_id = %self.job_id, phase_id = %phase.id, "global phase skipped");
                self.brain
                    .emit(JobEvent::PhaseSkipped {
                        job_id: self.job_id,
                        unit_id: None,
                        phase_id: phase.id.clone(),
                    })
                    .await;
                continue;
            }
            let Ok(permit) = Arc::clone(&self.brain.phase_permits).try_acquire_owned() else {
                return Ok(());
            };
            state
                .update_global_phase_status(&self.job_id, &phase.id, PhaseStatus::Running, None)
                .await?;

            let executor = self.brain.registry.create(&phase.id);
            let inputs = match &executor {
                Some(executor) => {
                    let aggregated = if self.depends_on_units(&phase) {
                        let fields: Vec<&str> = executor.inputs().iter().map(|f| f.name.as_str()).collect();
                        wiring::aggregate_unit_fields(job.units.values(), &fields)
                    } else {
                        FieldMap::new()
                    };
                    wiring::assemble_global_inputs(executor.inputs(), job, &aggregated)
                }
                None => Err(PhaseError::Failed(format!("no implementation registered for phase '{}'", phase.id))),
            };
            let ctx = self.brain.context(job, None, &phase.id, Arc::clone(&self.options));
            self.spawn(&phase, executor, ctx, inputs, permit, None);
            tracing::info!(job_id = %self.job_id, phase_id = %phase.id, "global phase started");
            self.brain
                .emit(JobEvent::PhaseStarted {
                    job_id: self.job_id,
                    unit_id: None,
                    phase_id: phase.id.clone(),
                })
                .await;
        }
        Ok(())
    }

    fn depends_on_units(&self, phase: &PhaseDefinition) -> bool {
        phase
            .depends_on
            .iter()
            .any(|dep| self.graph.phase(dep).is_some_and(|d| d.per_unit))
    }

    async fn launch_units(&mut self, job: &Job) -> Result<(), EngineError> {
        let globals_done = job.satisfied_globals();
        for unit in job.ordered_units() {
            if self.running_units.contains(&unit.unit_id) {
                continue;
            }
            let mut unit = unit.clone();
            'unit: loop {
                let ready: Vec<PhaseDefinition> = self
                    .graph
                    .ready_for_unit(&unit, &globals_done)
                    .into_iter()
                    .cloned()
                    .collect();
                for phase in ready {
                    if self.skipped.contains(&phase.id) {
                        unit = self
                            .brain
                            .state
                            .update_unit_phase_status(&self.job_id, &unit.unit_id, &phase.id, &UnitPhaseUpdate::Skipped)
                            .await?;
                        if phase.activation_slot == ActivationSlot::Release {
                            self.brain.slots.release(&slot_key(self.job_id, &unit.unit_id));
                        }
                        tracing::info!(
                            job_id = %self.job_id,
                            unit_id = %unit.unit_id,
                            phase_id = %phase.id,
                            "phase skipped"
                        );
                        self.brain
                            .emit(JobEvent::PhaseSkipped {
                                job_id: self.job_id,
                                unit_id: Some(unit.unit_id.clone()),
                                phase_id: phase.id.clone(),
                            })
                            .await;
                        continue 'unit;
                    }
                    match self.launch_unit_phase(job, &unit, &phase).await? {
                        Launch::Saturated => return Ok(()),
                        Launch::NoSlot => continue,
                        Launch::Started | Launch::Conflict => break 'unit,
                    }
                }
                break;
            }
        }
        Ok(())
    }

    async fn launch_unit_phase(&mut self, job: &Job, unit: &Unit, phase: &PhaseDefinition) -> Result<Launch, EngineError> {
        let Ok(permit) = Arc::clone(&self.brain.phase_permits).try_acquire_owned() else {
            return Ok(Launch::Saturated);
        };
        let key = slot_key(self.job_id, &unit.unit_id);
        let held_before = self.brain.slots.is_held_by(&key);
        let guard = match phase.activation_slot {
            ActivationSlot::Acquire => match self.brain.slots.try_acquire(&key) {
                Some(guard) => Some(guard),
                None => {
                    tracing::debug!(
                        job_id = %self.job_id,
                        unit_id = %unit.unit_id,
                        phase_id = %phase.id,
                        "waiting for an activation slot"
                    );
                    return Ok(Launch::NoSlot);
                }
            },
            _ => None,
        };

        let started = self
            .brain
            .state
            .update_unit_phase_status(&self.job_id, &unit.unit_id, &phase.id, &UnitPhaseUpdate::Started)
            .await;
        if let Err(e) = started {
            if let Some(guard) = guard
                && held_before
            {
                guard.keep();
            }
            return match e {
                StateError::Conflict(reason) => {
                    tracing::debug!(
                        job_id = %self.job_id,
                        unit_id = %unit.unit_id,
                        phase_id = %phase.id,
                        reason = %reason,
                        "phase already dispatched, skipping"
                    );
                    Ok(Launch::Conflict)
                }
                other => Err(other.into()),
            };
        }

        let executor = self.brain.registry.create(&phase.id);
        let inputs = match &executor {
            Some(executor) => wiring::assemble_unit_inputs(executor.inputs(), unit, job),
            None => Err(PhaseError::Failed(format!("no implementation registered for phase '{}'", phase.id))),
        };
        let ctx = self.brain.context(job, Some(unit), &phase.id, Arc::clone(&self.options));
        self.spawn(phase, executor, ctx, inputs, permit, guard);
        tracing::debug!(
            job_id = %self.job_id,
            unit_id = %unit.unit_id,
            phase_id = %phase.id,
            "phase started"
        );
        self.brain
            .emit(JobEvent::PhaseStarted {
                job_id: self.job_id,
                unit_id: Some(unit.unit_id.clone()),
                phase_id: phase.id.clone(),
            })
            .await;
        Ok(Launch::Started)
    }

    fn spawn(
        &mut self,
        phase: &PhaseDefinition,
        executor: Option<BoxPhaseExecutor>,
        ctx: PhaseContext,
        inputs: Result<FieldMap, PhaseError>,
        permit: OwnedSemaphorePermit,
        guard: Option<SlotGuard>,
    ) {
        let timeout = phase
            .timeout_secs
            .map_or_else(|| self.brain.config.phase_timeout(), Duration::from_secs);
        let unit_id = ctx.unit_id.clone();
        let handle = self.tasks.spawn(async move {
            let result = run_executor(executor, ctx, inputs, timeout).await;
            // The slot outlives a successful acquire phase; any other outcome
            // gives it back here.
            if let Some(guard) = guard
                && result.success
            {
                guard.keep();
            }
            drop(permit);
            result
        });
        self.launched.insert(handle.id(), (phase.id.clone(), unit_id.clone()));
        match unit_id {
            Some(unit_id) => self.running_units.insert(unit_id),
            None => self.running_globals.insert(phase.id.clone()),
        };
    }

    // -----------------------------------------------------------------------
    // Heartbeat and completion
    // -----------------------------------------------------------------------

    async fn heartbeat(&mut self, job: &Job) {
        let now = Instant::now();
        if now < self.next_heartbeat {
            return;
        }
        self.next_heartbeat = now + self.brain.config.heartbeat_interval();
        let snapshot = self.snapshot(job);
        tracing::info!(
            job_id = %self.job_id,
            units = ?snapshot.units_by_status,
            in_flight = snapshot.in_flight,
            slots_held = snapshot.slots_held,
            pending_activities = snapshot.pending_activities,
            "heartbeat"
        );
        self.brain
            .emit(JobEvent::Heartbeat {
                job_id: self.job_id,
                snapshot,
            })
            .await;
    }

    fn snapshot(&self, job: &Job) -> HeartbeatSnapshot {
        let mut snapshot = HeartbeatSnapshot {
            in_flight: self.tasks.len(),
            max_in_flight: self.brain.config.max_concurrent_phases,
            slots_held: self.brain.slots.held(),
            max_slots: self.brain.slots.capacity(),
            pending_activities: self.brain.tracker.pending_count(),
            ..HeartbeatSnapshot::default()
        };
        for unit in job.units.values() {
            *snapshot.units_by_status.entry(unit.status.to_string()).or_default() += 1;
            for phase_id in &unit.completed_phases {
                *snapshot.phases_completed.entry(phase_id.clone()).or_default() += 1;
            }
            for phase_id in &unit.failed_phases {
                *snapshot.phases_failed.entry(phase_id.clone()).or_default() += 1;
            }
        }
        for (phase_id, status) in &job.global_phase_status {
            match status {
                PhaseStatus::Completed | PhaseStatus::Skipped => {
                    *snapshot.phases_completed.entry(phase_id.clone()).or_default() += 1;
                }
                PhaseStatus::Failed | PhaseStatus::Blocked => {
                    *snapshot.phases_failed.entry(phase_id.clone()).or_default() += 1;
                }
                PhaseStatus::Pending | PhaseStatus::Running => {}
            }
        }
        snapshot
    }

    async fn finish(&mut self) -> Result<Job, EngineError> {
        let job = self.brain.load(self.job_id).await?;
        for unit_id in job.units.keys() {
            self.brain.slots.release(&slot_key(self.job_id, unit_id));
        }
        let status = final_status(&job, self.cancelled);
        let job = self.brain.set_status(&job, status).await?;
        tracing::info!(
            job_id = %self.job_id,
            status = %status,
            completed = job.count_units(UnitStatus::Completed),
            failed = job.count_units(UnitStatus::Failed),
            errors = job.errors.len(),
            "job finished"
        );
        Ok(job)
    }
}

/// Terminal status for a job whose loop has ended.
pub fn final_status(job: &Job, cancelled: bool) -> JobStatus {
    if cancelled {
        return JobStatus::Cancelled;
    }
    let failed = job.count_units(UnitStatus::Failed);
    if failed == 0 {
        JobStatus::Completed
    } else if failed == job.units.len() {
        JobStatus::Failed
    } else {
        JobStatus::Partial
    }
}

fn slot_key(job_id: Uuid, unit_id: &str) -> String {
    format!("{job_id}/{unit_id}")
}

/// Run one phase execution under its hard timeout, turning errors, panics,
/// and timeouts into a failed result.
async fn run_executor(
    executor: Option<BoxPhaseExecutor>,
    ctx: PhaseContext,
    inputs: Result<FieldMap, PhaseError>,
    timeout: Duration,
) -> PhaseResult {
    let started = Instant::now();
    let outcome = match (executor, inputs) {
        (_, Err(e)) => Err(e.to_string()),
        (None, Ok(_)) => Err(format!("no implementation registered for phase '{}'", ctx.phase_id)),
        (Some(executor), Ok(inputs)) => {
            let execution = AssertUnwindSafe(executor.execute(&ctx, inputs)).catch_unwind();
            match tokio::time::timeout(timeout, execution).await {
                Ok(Ok(Ok(outputs))) => Ok(outputs),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(panic)) => Err(format!("phase panicked: {}", panic_message(panic.as_ref()))),
                Err(_) => Err(PhaseError::Timeout(timeout.as_secs()).to_string()),
            }
        }
    };
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match outcome {
        Ok(outputs) => PhaseResult::succeeded(ctx.phase_id, ctx.unit_id, outputs, duration_ms),
        Err(error) => PhaseResult::failed(ctx.phase_id, ctx.unit_id, error, duration_ms),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivitySource, BoxActivitySource};
    use crate::phase::{FieldKind, FieldSpec, PhaseExecutor};
    use crate::testing::MemoryState;
    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};
    use stagehand_types::activity::ActivityStatusReport;
    use stagehand_types::error::SourceError;
    use stagehand_types::phase::SkipCondition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // -- Fakes ------------------------------------------------------------

    /// Reports every queried id as succeeded.
    struct AlwaysSucceeds;

    impl ActivitySource for AlwaysSucceeds {
        async fn query_window(
            &self,
            _since: DateTime<Utc>,
            correlation_ids: &[String],
        ) -> Result<Vec<ActivityStatusReport>, SourceError> {
            Ok(correlation_ids
                .iter()
                .map(|id| ActivityStatusReport {
                    correlation_id: id.clone(),
                    status: "completed".to_string(),
                    resource_id: Some(format!("dev-{id}")),
                    payload: Value::Null,
                })
                .collect())
        }

        async fn query_one(&self, correlation_id: &str) -> Result<ActivityStatusReport, SourceError> {
            Err(SourceError::NotFound(correlation_id.to_string()))
        }
    }

    type Trace = Arc<Mutex<Vec<String>>>;

    /// Root phase producing `count` units with `devices = unit_number`.
    struct SeedUnits {
        count: u32,
    }

    impl PhaseExecutor for SeedUnits {
        fn inputs(&self) -> &[FieldSpec] {
            &[]
        }

        async fn execute(&self, _ctx: &PhaseContext, _inputs: FieldMap) -> Result<FieldMap, PhaseError> {
            let units: Vec<Value> = (1..=self.count)
                .map(|n| json!({ "unit_id": format!("site-{n}"), "unit_number": n, "plan": { "devices": n } }))
                .collect();
            Ok(fields(json!({
                "units": units,
                "validation_summary": { "sites": self.count },
                "org_id": "O_1",
            })))
        }
    }

    /// Configurable per-unit behaviour, recording start/end into a trace.
    #[derive(Clone, Default)]
    struct Scripted {
        phase: String,
        inputs: Vec<FieldSpec>,
        outputs: FieldMap,
        /// Copy input `.0` to output `.1`.
        echo: Vec<(String, String)>,
        delay_secs: u64,
        delays: HashMap<String, u64>,
        fail: HashSet<String>,
        panic: HashSet<String>,
        trace: Trace,
        seen: Arc<Mutex<Vec<FieldMap>>>,
        /// Tracks concurrently running executions.
        gauge: Option<Arc<Gauge>>,
        /// Register and await an activity before finishing.
        activity: bool,
        /// Make the next N `get_job` calls fail.
        break_store: Option<(Arc<MemoryState>, usize)>,
    }

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Scripted {
        fn new(phase: &str, trace: &Trace) -> Self {
            Self {
                phase: phase.to_string(),
                trace: trace.clone(),
                ..Self::default()
            }
        }

        fn delay(mut self, secs: u64) -> Self {
            self.delay_secs = secs;
            self
        }

        fn delay_for(mut self, unit: &str, secs: u64) -> Self {
            self.delays.insert(unit.to_string(), secs);
            self
        }

        fn fails_for(mut self, unit: &str) -> Self {
            self.fail.insert(unit.to_string());
            self
        }

        fn panics_for(mut self, unit: &str) -> Self {
            self.panic.insert(unit.to_string());
            self
        }

        fn input(mut self, spec: FieldSpec) -> Self {
            self.inputs.push(spec);
            self
        }

        fn echo(mut self, from: &str, to: &str) -> Self {
            self.inputs.push(FieldSpec::required(from, FieldKind::Any));
            self.echo.push((from.to_string(), to.to_string()));
            self
        }

        fn output(mut self, key: &str, value: Value) -> Self {
            self.outputs.insert(key.to_string(), value);
            self
        }

        fn gauge(mut self, gauge: &Arc<Gauge>) -> Self {
            self.gauge = Some(gauge.clone());
            self
        }
    }

    impl PhaseExecutor for Scripted {
        fn inputs(&self) -> &[FieldSpec] {
            &self.inputs
        }

        async fn execute(&self, ctx: &PhaseContext, inputs: FieldMap) -> Result<FieldMap, PhaseError> {
            let who = ctx.unit_id.clone().unwrap_or_else(|| "job".to_string());
            self.trace.lock().unwrap().push(format!("start {}@{who}", self.phase));
            self.seen.lock().unwrap().push(inputs.clone());
            if let Some(gauge) = &self.gauge {
                gauge.enter();
            }
            if let Some((state, n)) = &self.break_store {
                state.fail_get_job.store(*n, Ordering::SeqCst);
            }

            let delay = self.delays.get(&who).copied().unwrap_or(self.delay_secs);
            tokio::time::sleep(Duration::from_secs(delay)).await;

            let mut outputs = self.outputs.clone();
            if self.activity {
                let device = ctx.run_activity(format!("claim-{who}"), None).await?;
                outputs.insert("device_id".to_string(), json!(device));
            }
            if let Some(gauge) = &self.gauge {
                gauge.leave();
            }
            self.trace.lock().unwrap().push(format!("end {}@{who}", self.phase));

            if self.panic.contains(&who) {
                panic!("scripted panic in {}", self.phase);
            }
            if self.fail.contains(&who) {
                return Err(PhaseError::Failed(format!("{} failed for {who}", self.phase)));
            }
            for (from, to) in &self.echo {
                if let Some(value) = inputs.get(from) {
                    outputs.insert(to.clone(), value.clone());
                }
            }
            outputs.insert("_trace".to_string(), json!(who));
            Ok(outputs)
        }
    }

    // -- Harness ----------------------------------------------------------

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            heartbeat_interval_secs: 3600,
            ..EngineConfig::default()
        }
    }

    fn brain(registry: PhaseRegistry, config: EngineConfig) -> (Arc<WorkflowBrain>, Arc<MemoryState>) {
        let state = Arc::new(MemoryState::default());
        let contract = BoxStateContract::from_arc(state.clone());
        let tracker = Arc::new(ActivityTracker::new(
            contract.clone(),
            BoxActivitySource::new(AlwaysSucceeds),
            config.tracker.clone(),
        ));
        (
            Arc::new(WorkflowBrain::new(contract, tracker, registry, config)),
            state,
        )
    }

    fn workflow(phases: Vec<PhaseDefinition>) -> WorkflowDefinition {
        let mut all = vec![PhaseDefinition::global("validate")];
        all.extend(phases);
        WorkflowDefinition {
            name: "site-rollout".to_string(),
            root_phase: "validate".to_string(),
            phases: all,
        }
    }

    fn registry(units: u32, phases: Vec<Scripted>) -> PhaseRegistry {
        let mut registry = PhaseRegistry::new().with("validate", move || SeedUnits { count: units });
        for phase in phases {
            let id = phase.phase.clone();
            registry.register(id, move || phase.clone());
        }
        registry
    }

    async fn run_job(brain: &WorkflowBrain, workflow: &WorkflowDefinition, options: Value) -> Job {
        let job = brain
            .create_job(workflow, JobScope::account("acct-1"), fields(options))
            .await
            .unwrap();
        brain.run(job.id).await.unwrap()
    }

    fn position(trace: &Trace, entry: &str) -> usize {
        trace
            .lock()
            .unwrap()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("'{entry}' not in trace"))
    }

    fn count(trace: &Trace, prefix: &str) -> usize {
        trace.lock().unwrap().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn abc_d() -> Vec<PhaseDefinition> {
        vec![
            PhaseDefinition::per_unit("A").depends_on(["validate"]),
            PhaseDefinition::per_unit("B").depends_on(["A"]).critical(),
            PhaseDefinition::per_unit("C").depends_on(["B"]),
            PhaseDefinition::global("D").depends_on(["B"]),
        ]
    }

    // -- Job creation and validation -----------------------------------------

    #[tokio::test]
    async fn create_job_rejects_bad_graphs() {
        let (brain, _) = brain(registry(1, vec![]), config());

        let cyclic = workflow(vec![
            PhaseDefinition::per_unit("a").depends_on(["b"]),
            PhaseDefinition::per_unit("b").depends_on(["a"]),
        ]);
        let err = brain
            .create_job(&cyclic, JobScope::default(), FieldMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::CycleDetected(_))));

        let dangling = workflow(vec![PhaseDefinition::per_unit("a").depends_on(["ghost"])]);
        let err = brain
            .create_job(&dangling, JobScope::default(), FieldMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::UnknownDependency(_))));
    }

    #[tokio::test]
    async fn create_job_requires_implementations_and_global_root() {
        let (brain, _) = brain(registry(1, vec![]), config());
        let err = brain
            .create_job(&workflow(vec![PhaseDefinition::per_unit("A")]), JobScope::default(), FieldMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPhase(ref id) if id == "A"));

        let bad_root = WorkflowDefinition {
            name: "w".to_string(),
            root_phase: "validate".to_string(),
            phases: vec![PhaseDefinition::per_unit("validate")],
        };
        let err = brain
            .create_job(&bad_root, JobScope::default(), FieldMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn validate_populates_units_and_awaits_confirmation() {
        let (brain, state) = brain(registry(3, vec![]), config());
        let job = brain
            .create_job(&workflow(vec![]), JobScope::account("acct-1"), FieldMap::new())
            .await
            .unwrap();

        let job = brain.validate(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::AwaitingConfirmation);
        assert_eq!(job.units.len(), 3);
        assert_eq!(job.units["site-2"].plan["devices"], 2);
        assert_eq!(job.validation_summary, Some(json!({ "sites": 3 })));
        assert_eq!(job.global_status("validate"), PhaseStatus::Completed);
        assert_eq!(job.global_phase_results["validate"]["org_id"], "O_1");
        assert!(!job.global_phase_results["validate"].contains_key("units"));

        let err = brain.execute(job.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert!(state.event_types(&job.id).contains(&"job_status_changed".to_string()));
    }

    #[tokio::test]
    async fn validation_with_no_units_fails_job() {
        let (brain, state) = brain(registry(0, vec![]), config());
        let job = brain
            .create_job(&workflow(vec![]), JobScope::default(), FieldMap::new())
            .await
            .unwrap();

        let err = brain.validate(job.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("no units")));
        let job = state.job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.global_status("validate"), PhaseStatus::Failed);
        assert_eq!(job.errors.len(), 1);
    }

    #[tokio::test]
    async fn cancel_during_validation_survives_outcome_writes() {
        let (brain, state) = brain(registry(2, vec![]), config());
        let job = brain
            .create_job(&workflow(vec![]), JobScope::account("acct-1"), FieldMap::new())
            .await
            .unwrap();
        // Flag lands after the initial load, while the root phase runs.
        state.cancel_on_get_job.store(1, Ordering::SeqCst);

        let job = brain.validate(job.id).await.unwrap();

        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancel_requested);
        assert_eq!(job.units.len(), 2);
        assert_eq!(job.validation_summary, Some(json!({ "sites": 2 })));
        assert_eq!(job.global_status("validate"), PhaseStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_after_validation_read_is_honoured_at_confirmation() {
        let (brain, state) = brain(registry(2, vec![]), config());
        let job = brain
            .create_job(&workflow(vec![]), JobScope::account("acct-1"), FieldMap::new())
            .await
            .unwrap();
        // Flag lands right after validation reloads the persisted outcome.
        state.cancel_on_get_job.store(2, Ordering::SeqCst);

        let job = brain.run(job.id).await.unwrap();

        assert_eq!(job.status, JobStatus::Cancelled);
        let stored = state.job(&job.id).unwrap();
        assert!(stored.cancel_requested);
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.units.values().all(|u| u.completed_phases.is_empty()));
    }

    // -- End-to-end scheduling -------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn global_phase_waits_for_every_unit() {
        let trace = Trace::default();
        let d = Scripted::new("D", &trace).input(FieldSpec::required("device_count", FieldKind::Number));
        let d_inputs = d.seen.clone();
        let phases = vec![
            Scripted::new("A", &trace).delay(1),
            Scripted::new("B", &trace)
                .delay(1)
                .delay_for("site-3", 30)
                .echo("devices", "device_count"),
            Scripted::new("C", &trace).delay(1),
            d,
        ];
        let (brain, _) = brain(registry(3, phases), config());

        let job = run_job(&brain, &workflow(abc_d()), json!({})).await;

        assert_eq!(job.status, JobStatus::Completed);
        let d_start = position(&trace, "start D@job");
        for unit in ["site-1", "site-2", "site-3"] {
            assert!(position(&trace, &format!("end B@{unit}")) < d_start);
        }
        // Unit 1 finished its whole pipeline long before D could start.
        assert!(position(&trace, "end C@site-1") < d_start);
        assert!(position(&trace, "end B@site-3") < d_start);

        // D saw the aggregate of every unit's device count.
        assert_eq!(d_inputs.lock().unwrap()[0]["device_count"], 6);
        assert_eq!(job.global_status("D"), PhaseStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn every_phase_runs_exactly_once_per_unit() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("A", &trace).delay(2),
            Scripted::new("B", &trace).delay(1),
            Scripted::new("C", &trace),
            Scripted::new("D", &trace),
        ];
        let (brain, _) = brain(registry(4, phases), config());

        let job = run_job(&brain, &workflow(abc_d()), json!({})).await;

        assert_eq!(job.status, JobStatus::Completed);
        for phase in ["A", "B", "C"] {
            for n in 1..=4 {
                assert_eq!(count(&trace, &format!("start {phase}@site-{n}")), 1);
            }
        }
        assert_eq!(count(&trace, "start D@"), 1);
        for unit in job.units.values() {
            assert_eq!(unit.status, UnitStatus::Completed);
            assert_eq!(unit.completed_phases.len(), 3);
            assert!(unit.current_phase.is_none());
            // Metadata outputs are not merged.
            assert!(!unit.resolved.contains_key("_trace"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn critical_failure_stops_only_that_unit() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("A", &trace),
            Scripted::new("B", &trace).fails_for("site-2"),
            Scripted::new("C", &trace),
            Scripted::new("D", &trace),
        ];
        let (brain, state) = brain(registry(3, phases), config());

        let job = run_job(&brain, &workflow(abc_d()), json!({})).await;

        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(count(&trace, "start C@site-2"), 0);
        assert_eq!(count(&trace, "start C@site-1"), 1);
        assert_eq!(count(&trace, "start C@site-3"), 1);
        assert_eq!(job.units["site-2"].status, UnitStatus::Failed);
        assert_eq!(job.units["site-2"].phase_errors["B"], "phase failed: B failed for site-2");
        // D only needs B complete for units that have not failed.
        assert_eq!(job.global_status("D"), PhaseStatus::Completed);
        assert!(state.event_types(&job.id).contains(&"unit_failed".to_string()));

        let report = JobReport::from_job(&job);
        assert_eq!(report.units_failed, 1);
        assert_eq!(report.unit_failures["site-2"][0].phase_id, "B");
    }

    #[tokio::test(start_paused = true)]
    async fn non_critical_failure_keeps_independent_phases_eligible() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("A", &trace),
            Scripted::new("B", &trace).fails_for("site-1"),
            Scripted::new("C", &trace),
            Scripted::new("E", &trace),
        ];
        let definitions = vec![
            PhaseDefinition::per_unit("A").depends_on(["validate"]),
            PhaseDefinition::per_unit("B").depends_on(["A"]),
            PhaseDefinition::per_unit("C").depends_on(["B"]),
            PhaseDefinition::per_unit("E").depends_on(["A"]),
        ];
        let (brain, _) = brain(registry(2, phases), config());

        let job = run_job(&brain, &workflow(definitions), json!({})).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(count(&trace, "start E@site-1"), 1);
        assert_eq!(count(&trace, "start C@site-1"), 0);
        let unit = &job.units["site-1"];
        assert_eq!(unit.status, UnitStatus::Completed);
        assert!(unit.failed_phases.contains("B"));
        assert_eq!(job.errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_units_failing_fails_job_and_blocks_globals() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("A", &trace),
            Scripted::new("B", &trace)
                .fails_for("site-1")
                .fails_for("site-2"),
            Scripted::new("C", &trace),
            Scripted::new("D", &trace),
        ];
        let (brain, state) = brain(registry(2, phases), config());

        let job = run_job(&brain, &workflow(abc_d()), json!({})).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.global_status("D"), PhaseStatus::Blocked);
        assert_eq!(count(&trace, "start D@"), 0);
        let events = state.event_types(&job.id);
        assert!(events.contains(&"phase_blocked".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("job_finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn phase_timeout_is_a_failure() {
        let trace = Trace::default();
        let phases = vec![Scripted::new("A", &trace).delay_for("site-1", 120)];
        let definitions = vec![PhaseDefinition::per_unit("A")
            .depends_on(["validate"])
            .critical()
            .timeout_secs(60)];
        let (brain, _) = brain(registry(2, phases), config());

        let job = run_job(&brain, &workflow(definitions), json!({})).await;

        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(job.units["site-1"].phase_errors["A"], "phase timed out after 60s");
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_phases_count_as_completed() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("A", &trace),
            Scripted::new("B", &trace),
            Scripted::new("C", &trace),
            Scripted::new("D", &trace),
        ];
        let mut definitions = abc_d();
        definitions[1] = definitions[1].clone().skip_if(SkipCondition::Truthy {
            option: "dry_run".to_string(),
        });
        definitions[3] = definitions[3].clone().skip_if(SkipCondition::Truthy {
            option: "dry_run".to_string(),
        });
        let (brain, _) = brain(registry(2, phases), config());

        let job = run_job(&brain, &workflow(definitions), json!({ "dry_run": true })).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(count(&trace, "start B@"), 0);
        assert_eq!(count(&trace, "start C@"), 2);
        assert_eq!(job.global_status("D"), PhaseStatus::Skipped);
        let unit = &job.units["site-1"];
        assert!(unit.completed_phases.contains("B"));
        assert!(unit.skipped_phases.contains("B"));
    }

    // -- Concurrency ceilings --------------------------------------------------

    fn slot_pipeline() -> Vec<PhaseDefinition> {
        vec![
            PhaseDefinition::per_unit("claim")
                .depends_on(["validate"])
                .critical()
                .activation_slot(ActivationSlot::Acquire),
            PhaseDefinition::per_unit("work").depends_on(["claim"]),
            PhaseDefinition::per_unit("unclaim")
                .depends_on(["work"])
                .activation_slot(ActivationSlot::Release),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn activation_slots_are_never_oversubscribed() {
        let trace = Trace::default();
        let holding = Arc::new(Gauge::default());
        let phases = vec![
            Scripted::new("claim", &trace),
            Scripted::new("work", &trace).delay(5),
            Scripted::new("unclaim", &trace),
        ];
        let mut config = config();
        config.max_activation_slots = 2;
        let (brain, _) = brain(registry(6, phases), config);

        let mut events = brain.events().subscribe();
        let watcher = tokio::spawn({
            let holding = holding.clone();
            async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        JobEvent::PhaseStarted { phase_id, .. } if phase_id == "claim" => holding.enter(),
                        JobEvent::PhaseCompleted { phase_id, .. } if phase_id == "unclaim" => holding.leave(),
                        JobEvent::JobFinished { .. } => break,
                        _ => {}
                    }
                }
            }
        });

        let job = run_job(&brain, &workflow(slot_pipeline()), json!({})).await;
        watcher.await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(count(&trace, "end unclaim@"), 6);
        assert_eq!(holding.max.load(Ordering::SeqCst), 2);
        assert_eq!(brain.slots_held(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_acquire_phase_releases_its_slot() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("claim", &trace).delay(1).panics_for("site-1"),
            Scripted::new("work", &trace),
            Scripted::new("unclaim", &trace),
        ];
        let mut config = config();
        config.max_activation_slots = 1;
        let (brain, _) = brain(registry(2, phases), config);

        let job = run_job(&brain, &workflow(slot_pipeline()), json!({})).await;

        assert_eq!(job.status, JobStatus::Partial);
        assert!(job.units["site-1"].phase_errors["claim"].starts_with("phase panicked"));
        assert_eq!(job.units["site-2"].status, UnitStatus::Completed);
        assert_eq!(count(&trace, "end unclaim@site-2"), 1);
        assert_eq!(brain.slots_held(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_failure_while_holding_slot_releases_it() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("claim", &trace),
            Scripted::new("work", &trace).fails_for("site-1"),
            Scripted::new("unclaim", &trace),
        ];
        let mut definitions = slot_pipeline();
        definitions[1] = definitions[1].clone().critical();
        let mut config = config();
        config.max_activation_slots = 1;
        let (brain, _) = brain(registry(2, phases), config);

        let job = run_job(&brain, &workflow(definitions), json!({})).await;

        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(count(&trace, "start unclaim@site-1"), 0);
        assert_eq!(count(&trace, "end unclaim@site-2"), 1);
        assert_eq!(brain.slots_held(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_release_phase_frees_the_slot() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("claim", &trace),
            Scripted::new("unclaim", &trace),
            Scripted::new("work", &trace).delay(30),
        ];
        let definitions = vec![
            PhaseDefinition::per_unit("claim")
                .depends_on(["validate"])
                .critical()
                .activation_slot(ActivationSlot::Acquire),
            PhaseDefinition::per_unit("unclaim")
                .depends_on(["claim"])
                .activation_slot(ActivationSlot::Release)
                .skip_if(SkipCondition::Truthy {
                    option: "no_release".to_string(),
                }),
            PhaseDefinition::per_unit("work").depends_on(["unclaim"]),
        ];
        let mut config = config();
        config.max_activation_slots = 1;
        let (brain, _) = brain(registry(2, phases), config);

        let job = run_job(&brain, &workflow(definitions), json!({ "no_release": true })).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(count(&trace, "start unclaim@"), 0);
        // site-2 claims while site-1 is still working.
        assert!(position(&trace, "start claim@site-2") < position(&trace, "end work@site-1"));
        assert_eq!(brain.slots_held(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn phase_concurrency_ceiling_holds() {
        let trace = Trace::default();
        let gauge = Arc::new(Gauge::default());
        let phases = vec![Scripted::new("A", &trace).delay(3).gauge(&gauge)];
        let mut config = config();
        config.max_concurrent_phases = 2;
        let (brain, _) = brain(
            registry(5, phases),
            config,
        );

        let job = run_job(
            &brain,
            &workflow(vec![PhaseDefinition::per_unit("A").depends_on(["validate"])]),
            json!({}),
        )
        .await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(count(&trace, "end A@"), 5);
        assert_eq!(gauge.max.load(Ordering::SeqCst), 2);
    }

    // -- Cancellation, faults, restart ------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn cancellation_lets_in_flight_work_finish_and_launches_nothing_new() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("A", &trace).delay(20),
            Scripted::new("B", &trace),
            Scripted::new("C", &trace),
            Scripted::new("D", &trace),
        ];
        let (brain, _) = brain(registry(2, phases), config());
        let job = brain
            .create_job(&workflow(abc_d()), JobScope::default(), FieldMap::new())
            .await
            .unwrap();
        brain.validate(job.id).await.unwrap();
        brain.confirm(job.id).await.unwrap();

        let running = tokio::spawn({
            let brain = brain.clone();
            async move { brain.execute(job.id).await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        brain.cancel(job.id).await.unwrap();

        let job = running.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(count(&trace, "end A@"), 2);
        assert_eq!(count(&trace, "start B@"), 0);
        assert!(job.units.values().all(|u| u.completed_phases.contains("A")));
    }

    #[tokio::test]
    async fn cancel_before_running_is_immediate() {
        let (brain, _) = brain(registry(1, vec![]), config());
        let job = brain
            .create_job(&workflow(vec![]), JobScope::default(), FieldMap::new())
            .await
            .unwrap();
        brain.validate(job.id).await.unwrap();

        let job = brain.cancel(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancel_requested);
        // Terminal jobs are left alone.
        assert_eq!(brain.cancel(job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_failures_are_retried() {
        let trace = Trace::default();
        let state = Arc::new(MemoryState::default());
        let mut flaky = Scripted::new("A", &trace);
        flaky.break_store = Some((state.clone(), 3));
        let registry = registry(2, vec![flaky, Scripted::new("B", &trace)]);
        let contract = BoxStateContract::from_arc(state.clone());
        let tracker = Arc::new(ActivityTracker::new(
            contract.clone(),
            BoxActivitySource::new(AlwaysSucceeds),
            config().tracker,
        ));
        let brain = WorkflowBrain::new(contract, tracker, registry, config());
        let definitions = vec![
            PhaseDefinition::per_unit("A").depends_on(["validate"]),
            PhaseDefinition::per_unit("B").depends_on(["A"]),
        ];

        let job = run_job(&brain, &workflow(definitions), json!({})).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(count(&trace, "start A@"), 2);
        assert_eq!(count(&trace, "start B@"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_redispatches_interrupted_phase_and_restores_slots() {
        let trace = Trace::default();
        let phases = vec![
            Scripted::new("claim", &trace),
            Scripted::new("work", &trace),
            Scripted::new("unclaim", &trace),
        ];
        let mut config = config();
        config.max_activation_slots = 1;
        let (brain, state) = brain(registry(2, phases), config);
        let job = brain
            .create_job(&workflow(slot_pipeline()), JobScope::default(), FieldMap::new())
            .await
            .unwrap();
        brain.validate(job.id).await.unwrap();
        brain.confirm(job.id).await.unwrap();

        // Simulate a process that died while site-1 was running `work`.
        {
            let mut jobs = state.jobs.lock().unwrap();
            let stored = jobs.get_mut(&job.id).unwrap();
            let unit = stored.units.get_mut("site-1").unwrap();
            unit.apply("claim", &UnitPhaseUpdate::Started).unwrap();
            unit.apply("claim", &UnitPhaseUpdate::Completed).unwrap();
            unit.apply("work", &UnitPhaseUpdate::Started).unwrap();
        }

        let job = brain.execute(job.id).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(count(&trace, "start claim@site-1"), 0);
        assert_eq!(count(&trace, "start work@site-1"), 1);
        // site-2 could only claim after site-1's restored slot was released.
        assert!(position(&trace, "end unclaim@site-1") < position(&trace, "start claim@site-2"));
        assert_eq!(brain.slots_held(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn phases_can_await_tracked_activities() {
        let trace = Trace::default();
        let mut attach = Scripted::new("attach", &trace);
        attach.activity = true;
        let (brain, state) = brain(registry(2, vec![attach]), config());
        let definitions = vec![PhaseDefinition::per_unit("attach").depends_on(["validate"])];

        let job = run_job(&brain, &workflow(definitions), json!({})).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.units["site-1"].resolved["device_id"], "dev-claim-site-1");
        assert_eq!(job.units["site-2"].resolved["device_id"], "dev-claim-site-2");
        assert_eq!(state.completed_activities.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_snapshots_are_published() {
        let trace = Trace::default();
        let phases = vec![Scripted::new("A", &trace).delay(10)];
        let config = EngineConfig {
            heartbeat_interval_secs: 2,
            ..EngineConfig::default()
        };
        let (brain, state) = brain(registry(2, phases), config);

        let job = run_job(
            &brain,
            &workflow(vec![PhaseDefinition::per_unit("A").depends_on(["validate"])]),
            json!({}),
        )
        .await;

        let heartbeats: Vec<Value> = state
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, kind, _)| *id == job.id && kind == "heartbeat")
            .map(|(_, _, data)| data.clone())
            .collect();
        assert!(!heartbeats.is_empty());
        assert_eq!(heartbeats[0]["snapshot"]["in_flight"], 2);
        assert_eq!(heartbeats[0]["snapshot"]["units_by_status"]["running"], 2);
    }

    #[test]
    fn final_status_rules() {
        let wf = workflow(vec![]);
        let mut job = Job::new(&wf, JobScope::default(), FieldMap::new());
        for n in 1..=2 {
            job.units.insert(format!("u{n}"), Unit::new(format!("u{n}"), n));
        }
        assert_eq!(final_status(&job, false), JobStatus::Completed);
        job.units.get_mut("u1").unwrap().status = UnitStatus::Failed;
        assert_eq!(final_status(&job, false), JobStatus::Partial);
        job.units.get_mut("u2").unwrap().status = UnitStatus::Failed;
        assert_eq!(final_status(&job, false), JobStatus::Failed);
        assert_eq!(final_status(&job, true), JobStatus::Cancelled);
    }
}
