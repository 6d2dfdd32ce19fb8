//! SQLite state contract implementation.
//!
//! Jobs are stored as JSON documents (without their units) alongside indexed
//! `status` and `cancel_requested` columns; each unit is its own row so a
//! phase transition rewrites one small document. Every partial update runs
//! as a read-modify-write inside a transaction on the writer pool.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use stagehand_core::state::StateContract;
use stagehand_types::activity::ActivityRef;
use stagehand_types::error::StateError;
use stagehand_types::job::{Job, JobError, JobStatus};
use stagehand_types::phase::{PhaseStatus, UnitPhaseUpdate};
use stagehand_types::unit::{Unit, UnitStatus};
use stagehand_types::FieldMap;
use uuid::Uuid;

use super::pool::DatabasePool;
use crate::event::StoredEvent;

/// SQLite-backed implementation of [`StateContract`].
#[derive(Debug, Clone)]
pub struct SqliteStateContract {
    pool: DatabasePool,
}

impl SqliteStateContract {
    /// Create a new contract backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Ids of jobs currently in `status`, oldest first.
    pub async fn list_job_ids(&self, status: JobStatus) -> Result<Vec<Uuid>, StateError> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE status = ? ORDER BY created_at, id")
            .bind(status.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows.iter()
            .map(|row| parse_uuid(&row.try_get::<String, _>("id").map_err(query_error)?))
            .collect()
    }

    /// Events published for `job_id`, oldest first.
    pub async fn list_events(&self, job_id: &Uuid) -> Result<Vec<StoredEvent>, StateError> {
        let rows = sqlx::query(
            "SELECT job_id, event_type, data, created_at FROM job_events WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows.iter().map(event_from_row).collect()
    }

    /// Read-modify-write of the job document (units untouched).
    async fn modify_job<T>(
        &self,
        job_id: &Uuid,
        f: impl FnOnce(&mut Job) -> Result<T, StateError> + Send,
    ) -> Result<T, StateError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let mut job = read_job_header(&mut tx, job_id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("job {job_id}")))?;
        let out = f(&mut job)?;
        job.updated_at = Utc::now();
        write_job_header(&mut tx, &job).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(out)
    }

    /// Read-modify-write of one unit row.
    async fn modify_unit<T>(
        &self,
        job_id: &Uuid,
        unit_id: &str,
        f: impl FnOnce(&mut Unit) -> Result<T, StateError> + Send,
    ) -> Result<T, StateError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let mut unit = read_unit(&mut tx, job_id, unit_id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("unit {unit_id} in job {job_id}")))?;
        let out = f(&mut unit)?;
        write_unit(&mut tx, job_id, &unit).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> StateError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StateError::Connection
        }
        other => StateError::Query(other.to_string()),
    }
}

fn decode<T: DeserializeOwned>(document: &str, what: &str) -> Result<T, StateError> {
    serde_json::from_str(document)
        .map_err(|e| StateError::Query(format!("invalid {what} document: {e}")))
}

fn encode<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StateError> {
    serde_json::to_string(value).map_err(|e| StateError::Query(format!("serialize {what}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StateError> {
    s.parse::<Uuid>()
        .map_err(|e| StateError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StateError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

async fn read_job_header(conn: &mut SqliteConnection, job_id: &Uuid) -> Result<Option<Job>, StateError> {
    let row = sqlx::query("SELECT document FROM jobs WHERE id = ?")
        .bind(job_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;
    match row {
        Some(row) => {
            let document: String = row.try_get("document").map_err(query_error)?;
            Ok(Some(decode(&document, "job")?))
        }
        None => Ok(None),
    }
}

async fn read_job(conn: &mut SqliteConnection, job_id: &Uuid) -> Result<Option<Job>, StateError> {
    let Some(mut job) = read_job_header(conn, job_id).await? else {
        return Ok(None);
    };
    let rows = sqlx::query("SELECT document FROM units WHERE job_id = ? ORDER BY unit_number, unit_id")
        .bind(job_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(query_error)?;
    for row in rows {
        let document: String = row.try_get("document").map_err(query_error)?;
        let unit: Unit = decode(&document, "unit")?;
        job.units.insert(unit.unit_id.clone(), unit);
    }
    Ok(Some(job))
}

async fn read_unit(
    conn: &mut SqliteConnection,
    job_id: &Uuid,
    unit_id: &str,
) -> Result<Option<Unit>, StateError> {
    let row = sqlx::query("SELECT document FROM units WHERE job_id = ? AND unit_id = ?")
        .bind(job_id.to_string())
        .bind(unit_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;
    match row {
        Some(row) => {
            let document: String = row.try_get("document").map_err(query_error)?;
            Ok(Some(decode(&document, "unit")?))
        }
        None => Ok(None),
    }
}

/// Upsert the job row. The stored document omits units.
async fn write_job_header(conn: &mut SqliteConnection, job: &Job) -> Result<(), StateError> {
    let mut document = serde_json::to_value(job)
        .map_err(|e| StateError::Query(format!("serialize job: {e}")))?;
    if let Some(fields) = document.as_object_mut() {
        fields.remove("units");
    }
    sqlx::query(
        r#"INSERT INTO jobs (id, workflow, status, cancel_requested, document, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             workflow = excluded.workflow,
             status = excluded.status,
             cancel_requested = excluded.cancel_requested,
             document = excluded.document,
             updated_at = excluded.updated_at"#,
    )
    .bind(job.id.to_string())
    .bind(&job.workflow)
    .bind(job.status.as_str())
    .bind(job.cancel_requested)
    .bind(encode(&document, "job")?)
    .bind(format_datetime(&job.created_at))
    .bind(format_datetime(&job.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;
    Ok(())
}

async fn write_unit(conn: &mut SqliteConnection, job_id: &Uuid, unit: &Unit) -> Result<(), StateError> {
    sqlx::query(
        r#"INSERT INTO units (job_id, unit_id, unit_number, status, document, updated_at)
           VALUES (?, ?, ?, ?, ?, ?)
           ON CONFLICT(job_id, unit_id) DO UPDATE SET
             unit_number = excluded.unit_number,
             status = excluded.status,
             document = excluded.document,
             updated_at = excluded.updated_at"#,
    )
    .bind(job_id.to_string())
    .bind(&unit.unit_id)
    .bind(i64::from(unit.unit_number))
    .bind(unit.status.to_string())
    .bind(encode(unit, "unit")?)
    .bind(format_datetime(&Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;
    Ok(())
}

fn activity_from_row(row: &SqliteRow) -> Result<ActivityRef, StateError> {
    let job_id: String = row.try_get("job_id").map_err(query_error)?;
    let registered_at: String = row.try_get("registered_at").map_err(query_error)?;
    Ok(ActivityRef {
        correlation_id: row.try_get("correlation_id").map_err(query_error)?,
        job_id: parse_uuid(&job_id)?,
        unit_id: row.try_get("unit_id").map_err(query_error)?,
        phase_id: row.try_get("phase_id").map_err(query_error)?,
        registered_at: parse_datetime(&registered_at)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<StoredEvent, StateError> {
    let job_id: String = row.try_get("job_id").map_err(query_error)?;
    let data: String = row.try_get("data").map_err(query_error)?;
    let created_at: String = row.try_get("created_at").map_err(query_error)?;
    Ok(StoredEvent {
        job_id: parse_uuid(&job_id)?,
        event_type: row.try_get("event_type").map_err(query_error)?,
        data: decode(&data, "event")?,
        created_at: parse_datetime(&created_at)?,
    })
}

// ---------------------------------------------------------------------------
// StateContract impl
// ---------------------------------------------------------------------------

impl StateContract for SqliteStateContract {
    async fn save_job(&self, job: &Job) -> Result<(), StateError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        write_job_header(&mut tx, job).await?;
        sqlx::query("DELETE FROM units WHERE job_id = ?")
            .bind(job.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        for unit in job.units.values() {
            write_unit(&mut tx, &job.id, unit).await?;
        }
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get_job(&self, job_id: &Uuid) -> Result<Option<Job>, StateError> {
        let mut conn = self.pool.reader.acquire().await.map_err(query_error)?;
        read_job(&mut conn, job_id).await
    }

    async fn update_job_status(&self, job_id: &Uuid, status: JobStatus) -> Result<Job, StateError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let mut job = read_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("job {job_id}")))?;
        job.transition(status).map_err(|from| {
            StateError::Conflict(format!("cannot move job {job_id} from {from} to {status}"))
        })?;
        write_job_header(&mut tx, &job).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(job)
    }

    async fn append_job_error(&self, job_id: &Uuid, error: &JobError) -> Result<(), StateError> {
        self.modify_job(job_id, |job| {
            job.errors.push(error.clone());
            Ok(())
        })
        .await
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
        .await
    }

    async fn save_unit(&self, job_id: &Uuid, unit: &Unit) -> Result<(), StateError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        write_unit(&mut conn, job_id, unit).await
    }

    async fn get_unit(&self, job_id: &Uuid, unit_id: &str) -> Result<Option<Unit>, StateError> {
        let mut conn = self.pool.reader.acquire().await.map_err(query_error)?;
        read_unit(&mut conn, job_id, unit_id).await
    }

    async fn save_all_units(&self, job_id: &Uuid, units: &[Unit]) -> Result<(), StateError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        for unit in units {
            write_unit(&mut tx, job_id, unit).await?;
        }
        tx.commit().await.map_err(query_error)?;
        Ok(())
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
        .await
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
        .await
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
        .await
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
        .await
    }

    async fn register_activity(&self, activity: &ActivityRef) -> Result<(), StateError> {
        sqlx::query(
            r#"INSERT INTO activities (correlation_id, job_id, unit_id, phase_id, registered_at, completed_at)
               VALUES (?, ?, ?, ?, ?, NULL)
               ON CONFLICT(correlation_id) DO UPDATE SET
                 job_id = excluded.job_id,
                 unit_id = excluded.unit_id,
                 phase_id = excluded.phase_id,
                 registered_at = excluded.registered_at,
                 completed_at = NULL"#,
        )
        .bind(&activity.correlation_id)
        .bind(activity.job_id.to_string())
        .bind(&activity.unit_id)
        .bind(&activity.phase_id)
        .bind(format_datetime(&activity.registered_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn complete_activity(&self, correlation_id: &str, _job_id: &Uuid) -> Result<(), StateError> {
        sqlx::query("UPDATE activities SET completed_at = ? WHERE correlation_id = ? AND completed_at IS NULL")
            .bind(format_datetime(&Utc::now()))
            .bind(correlation_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn get_pending_activities(&self) -> Result<HashMap<String, ActivityRef>, StateError> {
        let rows = sqlx::query(
            "SELECT correlation_id, job_id, unit_id, phase_id, registered_at FROM activities WHERE completed_at IS NULL",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows.iter()
            .map(|row| activity_from_row(row).map(|a| (a.correlation_id.clone(), a)))
            .collect()
    }

    async fn is_cancelled(&self, job_id: &Uuid) -> Result<bool, StateError> {
        let flag: Option<bool> = sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        Ok(flag.unwrap_or(false))
    }

    async fn request_cancel(&self, job_id: &Uuid) -> Result<(), StateError> {
        self.modify_job(job_id, |job| {
            job.cancel_requested = true;
            Ok(())
        })
        .await
    }

    async fn publish_event(
        &self,
        job_id: &Uuid,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<(), StateError> {
        sqlx::query("INSERT INTO job_events (job_id, event_type, data, created_at) VALUES (?, ?, ?, ?)")
            .bind(job_id.to_string())
            .bind(event_type)
            .bind(encode(data, "event")?)
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }
}
