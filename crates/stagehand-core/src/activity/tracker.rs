//! Bulk-polling tracker for external asynchronous operations.
//!
//! Phases register the correlation ids returned by fire-and-return-later
//! calls, then await them. A single background loop polls on a fixed interval
//! with one time-windowed bulk query covering every outstanding id, falling
//! back to bounded per-id queries when the bulk call fails.
//!
//! # Resolution guarantees
//!
//! Each registered id resolves exactly once. The decision is taken under the
//! tracker lock by removing the id from the pending map; whichever path gets
//! there first wins and every later attempt is a no-op. The paths are:
//!
//! - bulk poll match
//! - individual fallback query
//! - circuit breaker (too many consecutive fully failed cycles)
//! - age ceiling (no terminal status within `max_activity_age_secs`)
//! - a waiting caller's timeout

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::stream::{self, StreamExt};
use stagehand_types::activity::{ActivityRef, ActivityResult, ActivityStatusReport, ResolutionSource};
use stagehand_types::config::TrackerConfig;
use stagehand_types::error::{SourceError, StateError};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::source::BoxActivitySource;
use crate::state::BoxStateContract;

/// Resolved results kept for callers that wait after resolution.
const RESOLVED_RETENTION: usize = 10_000;

/// Capacity of the resolution broadcast used by `wait_for_any`.
const RESOLUTION_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("unknown activity '{0}'")]
    UnknownActivity(String),

    #[error("activity '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCycle {
    /// Nothing outstanding; the loop stops until the next registration.
    Idle,
    /// The bulk query succeeded.
    Polled { resolved: usize },
    /// The bulk query failed but at least one individual query succeeded.
    Fallback { resolved: usize },
    /// Every query failed; `consecutive` fully failed cycles so far.
    Failed { consecutive: u32 },
    /// The circuit breaker force-failed every outstanding activity.
    Tripped { forced: usize },
}

struct PendingActivity {
    activity: ActivityRef,
    signal: watch::Sender<Option<ActivityResult>>,
}

#[derive(Default)]
struct TrackerInner {
    pending: HashMap<String, PendingActivity>,
    resolved: HashMap<String, ActivityResult>,
    resolved_order: VecDeque<String>,
    window_start: Option<DateTime<Utc>>,
    failed_cycles: u32,
    polling: bool,
}

impl TrackerInner {
    fn remember(&mut self, result: ActivityResult) {
        self.resolved_order.push_back(result.correlation_id.clone());
        self.resolved.insert(result.correlation_id.clone(), result);
        while self.resolved_order.len() > RESOLVED_RETENTION {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }
}

/// Tracks outstanding external operations for one worker process.
pub struct ActivityTracker {
    state: BoxStateContract,
    source: BoxActivitySource,
    config: TrackerConfig,
    inner: Mutex<TrackerInner>,
    resolutions: broadcast::Sender<ActivityResult>,
    shutdown: CancellationToken,
}

impl ActivityTracker {
    pub fn new(state: BoxStateContract, source: BoxActivitySource, config: TrackerConfig) -> Self {
        let (resolutions, _) = broadcast::channel(RESOLUTION_CHANNEL_CAPACITY);
        Self {
            state,
            source,
            config,
            inner: Mutex::new(TrackerInner::default()),
            resolutions,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Record a pending operation for the given job/unit/phase and make sure
    /// the poll loop is running.
    pub async fn register(
        self: &Arc<Self>,
        correlation_id: impl Into<String>,
        job_id: Uuid,
        unit_id: Option<&str>,
        phase_id: &str,
    ) -> Result<(), TrackerError> {
        let activity = ActivityRef::new(correlation_id, job_id, unit_id.map(str::to_string), phase_id);
        self.track(activity).await
    }

    /// Register a fully described activity, persisting it first so other
    /// processes and restarts can see it.
    pub async fn track(self: &Arc<Self>, activity: ActivityRef) -> Result<(), TrackerError> {
        if self.is_known(&activity.correlation_id) {
            return Err(TrackerError::AlreadyRegistered(activity.correlation_id));
        }
        self.state.register_activity(&activity).await?;
        self.insert_pending(activity)
    }

    /// Reload pending activities from the state contract after a restart.
    ///
    /// Returns how many activities were adopted.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, TrackerError> {
        let stored = self.state.get_pending_activities().await?;
        let mut adopted = 0;
        for (_, activity) in stored {
            if self.is_known(&activity.correlation_id) {
                continue;
            }
            if self.insert_pending(activity).is_ok() {
                adopted += 1;
            }
        }
        if adopted > 0 {
            tracing::info!(adopted, "recovered pending activities from state store");
        }
        Ok(adopted)
    }

    fn is_known(&self, correlation_id: &str) -> bool {
        let inner = self.lock();
        inner.pending.contains_key(correlation_id) || inner.resolved.contains_key(correlation_id)
    }

    fn insert_pending(self: &Arc<Self>, activity: ActivityRef) -> Result<(), TrackerError> {
        let correlation_id = activity.correlation_id.clone();
        let start_loop = {
            let mut inner = self.lock();
            if inner.pending.contains_key(&correlation_id) {
                return Err(TrackerError::AlreadyRegistered(correlation_id));
            }

            // The first registration after an idle period anchors the window.
            let anchor = activity.registered_at.min(Utc::now()) - self.window_buffer();
            inner.window_start = Some(match inner.window_start {
                Some(start) if !inner.pending.is_empty() => start.min(anchor),
                _ => anchor,
            });

            tracing::debug!(
                correlation_id = %correlation_id,
                job_id = %activity.job_id,
                phase_id = %activity.phase_id,
                "tracking activity"
            );
            let (signal, _) = watch::channel(None);
            inner.pending.insert(correlation_id, PendingActivity { activity, signal });

            !std::mem::replace(&mut inner.polling, true)
        };

        if start_loop {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_poll_loop().await });
        }
        Ok(())
    }

    fn window_buffer(&self) -> TimeDelta {
        secs_delta(self.config.poll_window_buffer_secs)
    }

    // -----------------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------------

    /// Wait for one activity's terminal result.
    ///
    /// On timeout a failure is synthesized and recorded so the id stops being
    /// polled; if the activity resolved concurrently, that result is returned.
    pub async fn wait(&self, correlation_id: &str, timeout: Duration) -> Result<ActivityResult, TrackerError> {
        let mut rx = {
            let inner = self.lock();
            if let Some(result) = inner.resolved.get(correlation_id) {
                return Ok(result.clone());
            }
            match inner.pending.get(correlation_id) {
                Some(pending) => pending.signal.subscribe(),
                None => return Err(TrackerError::UnknownActivity(correlation_id.to_string())),
            }
        };

        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(Option::is_some).await.map(|r| (*r).clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(result))) => Ok(result),
            Ok(_) => self.resolved_result(correlation_id),
            Err(_) => {
                let reason = format!(
                    "timed out after {}s waiting for activity to complete",
                    timeout.as_secs()
                );
                self.resolve(ActivityResult::failed(
                    correlation_id,
                    reason,
                    ResolutionSource::WaitTimeout,
                ))
                .await;
                self.resolved_result(correlation_id)
            }
        }
    }

    /// Wait for whichever outstanding activity resolves next.
    ///
    /// Returns `None` if nothing resolves within `timeout`.
    pub async fn wait_for_any(&self, timeout: Duration) -> Option<ActivityResult> {
        let mut rx = self.resolutions.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(result)) => return Some(result),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::debug!(skipped, "wait_for_any lagged behind resolutions");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }

    fn resolved_result(&self, correlation_id: &str) -> Result<ActivityResult, TrackerError> {
        self.lock()
            .resolved
            .get(correlation_id)
            .cloned()
            .ok_or_else(|| TrackerError::UnknownActivity(correlation_id.to_string()))
    }

    /// Number of activities not yet resolved.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.lock().pending.contains_key(correlation_id)
    }

    /// Subscribe to every resolution as it happens.
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityResult> {
        self.resolutions.subscribe()
    }

    /// Stop the background poll loop. Pending activities stay pending.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Deliver a terminal result. Returns `false` if the id was already
    /// resolved (or never registered), in which case nothing is signalled.
    async fn resolve(&self, result: ActivityResult) -> bool {
        let activity = {
            let mut inner = self.lock();
            let Some(pending) = inner.pending.remove(&result.correlation_id) else {
                return false;
            };
            pending.signal.send_replace(Some(result.clone()));
            inner.remember(result.clone());
            pending.activity
        };

        let _ = self.resolutions.send(result.clone());

        if result.success {
            tracing::debug!(
                correlation_id = %result.correlation_id,
                resource_id = ?result.resource_id,
                source = ?result.source,
                "activity succeeded"
            );
        } else if result.source.is_timeout() {
            tracing::warn!(
                correlation_id = %result.correlation_id,
                job_id = %activity.job_id,
                phase_id = %activity.phase_id,
                source = ?result.source,
                reason = result.reason.as_deref().unwrap_or_default(),
                "activity timed out"
            );
        } else {
            tracing::info!(
                correlation_id = %result.correlation_id,
                job_id = %activity.job_id,
                phase_id = %activity.phase_id,
                source = ?result.source,
                reason = result.reason.as_deref().unwrap_or_default(),
                "activity failed"
            );
        }

        if let Err(e) = self
            .state
            .complete_activity(&result.correlation_id, &activity.job_id)
            .await
        {
            tracing::warn!(
                correlation_id = %result.correlation_id,
                error = %e,
                "failed to mark activity complete in state store"
            );
        }
        true
    }

    async fn force_fail_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.lock().pending.keys().cloned().collect();
        let mut forced = 0;
        for id in ids {
            let result = ActivityResult::failed(&id, reason, ResolutionSource::CircuitBreaker);
            if self.resolve(result).await {
                forced += 1;
            }
        }
        forced
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    async fn run_poll_loop(self: Arc<Self>) {
        let interval = self.config.poll_interval();
        tracing::debug!(interval_secs = interval.as_secs(), "activity poll loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.lock().polling = false;
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if self.poll_once().await == PollCycle::Idle {
                break;
            }
        }
        tracing::debug!("activity poll loop stopped");
    }

    /// Run one poll cycle: enforce the age ceiling, then query the source.
    pub async fn poll_once(&self) -> PollCycle {
        let now = Utc::now();
        let (snapshot, since) = {
            let mut inner = self.lock();
            if inner.pending.is_empty() {
                inner.window_start = None;
                inner.failed_cycles = 0;
                inner.polling = false;
                return PollCycle::Idle;
            }
            let since = inner.window_start.unwrap_or_else(|| now - self.window_buffer());
            let snapshot: Vec<(String, DateTime<Utc>)> = inner
                .pending
                .iter()
                .map(|(id, p)| (id.clone(), p.activity.registered_at))
                .collect();
            (snapshot, since)
        };

        let max_age = secs_delta(self.config.max_activity_age_secs);
        let mut resolved = 0;
        let mut ids = Vec::with_capacity(snapshot.len());
        for (id, registered_at) in snapshot {
            let age = now - registered_at;
            if age > max_age {
                tracing::warn!(
                    correlation_id = %id,
                    age_secs = age.num_seconds(),
                    max_age_secs = self.config.max_activity_age_secs,
                    "activity exceeded age ceiling without a terminal status, forcing timeout"
                );
                let reason = format!(
                    "timed out: no terminal status reported within {}s",
                    self.config.max_activity_age_secs
                );
                if self
                    .resolve(ActivityResult::failed(&id, reason, ResolutionSource::AgeCeiling))
                    .await
                {
                    resolved += 1;
                }
            } else {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return PollCycle::Polled { resolved };
        }

        match self.source.query_window(since, &ids).await {
            Ok(reports) => {
                self.lock().failed_cycles = 0;
                let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
                for report in reports {
                    if !wanted.contains(report.correlation_id.as_str()) {
                        continue;
                    }
                    if let Some(result) = report.into_result(ResolutionSource::Polled) {
                        if self.resolve(result).await {
                            resolved += 1;
                        }
                    }
                }
                tracing::debug!(outstanding = ids.len(), resolved, "bulk activity poll");
                PollCycle::Polled { resolved }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    outstanding = ids.len(),
                    "bulk activity query failed, falling back to individual queries"
                );
                self.poll_individually(ids, resolved).await
            }
        }
    }

    async fn poll_individually(&self, ids: Vec<String>, mut resolved: usize) -> PollCycle {
        let source = &self.source;
        let outcomes: Vec<(String, Result<ActivityStatusReport, SourceError>)> =
            stream::iter(ids.into_iter().map(|id| async move {
                let outcome = source.query_one(&id).await;
                (id, outcome)
            }))
            .buffer_unordered(self.config.fallback_concurrency.max(1))
            .collect()
            .await;

        let mut any_succeeded = false;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(report) => {
                    any_succeeded = true;
                    let report = ActivityStatusReport {
                        correlation_id: id,
                        ..report
                    };
                    if let Some(result) = report.into_result(ResolutionSource::Fallback) {
                        if self.resolve(result).await {
                            resolved += 1;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(correlation_id = %id, error = %e, "individual activity query failed");
                }
            }
        }

        if any_succeeded {
            self.lock().failed_cycles = 0;
            return PollCycle::Fallback { resolved };
        }

        let consecutive = {
            let mut inner = self.lock();
            inner.failed_cycles += 1;
            inner.failed_cycles
        };
        let threshold = self.config.circuit_breaker_threshold.max(1);
        if consecutive < threshold {
            tracing::warn!(consecutive, threshold, "activity poll cycle failed");
            return PollCycle::Failed { consecutive };
        }

        tracing::warn!(
            consecutive,
            "activity polling failed repeatedly, circuit breaker open: failing all outstanding activities"
        );
        let reason = format!("activity status unavailable: polling failed for {consecutive} consecutive cycles");
        let forced = self.force_fail_all(&reason).await;
        self.lock().failed_cycles = 0;
        PollCycle::Tripped { forced }
    }
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

fn secs_delta(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
