//! Progress events as persisted by the state contract implementations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One `publish_event` call, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub job_id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn new(job_id: Uuid, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            job_id,
            event_type: event_type.into(),
            data,
            created_at: Utc::now(),
        }
    }
}
