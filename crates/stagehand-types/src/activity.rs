//! Tracked external operations.
//!
//! A mutating call against the remote management system returns a correlation
//! id immediately; the real outcome is discovered later by polling. An
//! [`ActivityRef`] records an outstanding id and who must be notified, and an
//! [`ActivityResult`] is its single terminal outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An outstanding external operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRef {
    pub correlation_id: String,
    pub job_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    pub phase_id: String,
    pub registered_at: DateTime<Utc>,
}

impl ActivityRef {
    pub fn new(
        correlation_id: impl Into<String>,
        job_id: Uuid,
        unit_id: Option<String>,
        phase_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            job_id,
            unit_id,
            phase_id: phase_id.into(),
            registered_at: Utc::now(),
        }
    }
}

/// Which mechanism decided an activity's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Matched by a bulk time-windowed query.
    Polled,
    /// Matched by an individual per-id query after the bulk query failed.
    Fallback,
    /// Forced after too many consecutive fully failed poll cycles.
    CircuitBreaker,
    /// Forced after the activity outlived its absolute age ceiling.
    AgeCeiling,
    /// Forced because the waiting caller gave up.
    WaitTimeout,
}

impl ResolutionSource {
    /// Forced outcomes that carry a timeout message rather than a remote verdict.
    pub fn is_timeout(self) -> bool {
        matches!(self, Self::AgeCeiling | Self::WaitTimeout)
    }
}

/// Terminal outcome of an activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityResult {
    pub correlation_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub source: ResolutionSource,
    pub resolved_at: DateTime<Utc>,
}

impl ActivityResult {
    pub fn succeeded(
        correlation_id: impl Into<String>,
        resource_id: Option<String>,
        source: ResolutionSource,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: true,
            resource_id,
            reason: None,
            source,
            resolved_at: Utc::now(),
        }
    }

    pub fn failed(
        correlation_id: impl Into<String>,
        reason: impl Into<String>,
        source: ResolutionSource,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: false,
            resource_id: None,
            reason: Some(reason.into()),
            source,
            resolved_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote status normalization
// ---------------------------------------------------------------------------

/// The three buckets every remote status string is normalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Succeeded,
    Failed,
    InProgress,
}

impl ActivityState {
    /// Normalize a remote status value. Unknown values count as in progress.
    pub fn normalize(status: &str) -> Self {
        let key = status.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "succeeded" | "success" | "successful" | "completed" | "complete" | "done"
            | "ok" | "finished" => Self::Succeeded,
            "failed" | "failure" | "error" | "errored" | "cancelled" | "canceled"
            | "rejected" | "aborted" | "timed_out" | "timeout" | "expired" => Self::Failed,
            _ => Self::InProgress,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One status record as reported by the remote system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStatusReport {
    pub correlation_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Raw terminal payload, mined for a failure reason.
    #[serde(default)]
    pub payload: Value,
}

impl ActivityStatusReport {
    pub fn state(&self) -> ActivityState {
        ActivityState::normalize(&self.status)
    }

    /// Best-effort failure reason from the payload, falling back to the status.
    pub fn failure_reason(&self) -> String {
        extract_reason(&self.payload)
            .unwrap_or_else(|| format!("activity ended with status '{}'", self.status))
    }

    /// Convert into a terminal result, or `None` while still in progress.
    pub fn into_result(self, source: ResolutionSource) -> Option<ActivityResult> {
        match self.state() {
            ActivityState::Succeeded => Some(ActivityResult::succeeded(
                self.correlation_id,
                self.resource_id,
                source,
            )),
            ActivityState::Failed => {
                let reason = self.failure_reason();
                Some(ActivityResult::failed(self.correlation_id, reason, source))
            }
            ActivityState::InProgress => None,
        }
    }
}

const REASON_KEYS: &[&str] = &["error", "reason", "message", "failure_reason", "detail"];

fn extract_reason(payload: &Value) -> Option<String> {
    let object = payload.as_object()?;
    for key in REASON_KEYS {
        match object.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(nested @ Value::Object(_)) => {
                if let Some(reason) = extract_reason(nested) {
                    return Some(reason);
                }
            }
            _ => {}
        }
    }
    object
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
        .and_then(|first| match first {
            Value::String(s) => Some(s.clone()),
            other => extract_reason(other),
        })
}
