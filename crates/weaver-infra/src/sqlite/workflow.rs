//! SQLite workflow state repository implementation.
//!
//! Implements `WorkflowRepository` from `weaver-core` using sqlx with split
//! read/write pools. Contexts, metadata and nested child records are stored
//! as JSON text. Claims are a conditional `UPDATE` on the single writer
//! connection, so at most one concurrent claim matches the `active` row.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;
use weaver_core::repository::workflow::WorkflowRepository;
use weaver_types::error::RepositoryError;
use weaver_types::workflow::{
    SuspensionKind, SuspensionRecord, SuspensionStatus, WorkflowRunRecord, WorkflowRunStatus,
};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Debug, Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn suspension_status(
        &self,
        suspension_id: &Uuid,
    ) -> Result<Option<SuspensionStatus>, RepositoryError> {
        let row = sqlx::query("SELECT status FROM workflow_suspensions WHERE suspension_id = ?")
            .bind(suspension_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|r| {
            let status: String = r
                .try_get("status")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            status.parse::<SuspensionStatus>().map_err(RepositoryError::Query)
        })
        .transpose()
    }

    /// Apply an `active -> to` transition, returning the updated record.
    async fn transition_active(
        &self,
        suspension_id: &Uuid,
        to: SuspensionStatus,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"UPDATE workflow_suspensions
               SET status = ?, version = version + 1, updated_at = ?
               WHERE suspension_id = ? AND status = 'active'
               RETURNING *"#,
        )
        .bind(to.as_str())
        .bind(format_datetime(&Utc::now()))
        .bind(suspension_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|r| {
            SuspensionRow::from_row(&r)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_record()
        })
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    run_id: String,
    workflow_id: String,
    status: String,
    context: String,
    error: Option<String>,
    suspension_id: Option<String>,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            error: row.try_get("error")?,
            suspension_id: row.try_get("suspension_id")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRunRecord, RepositoryError> {
        let status: WorkflowRunStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let context = parse_json(&self.context, "context")?;

        Ok(WorkflowRunRecord {
            workflow_id: self.workflow_id,
            run_id: parse_uuid(&self.run_id)?,
            status,
            context,
            error: self.error,
            suspension_id: self.suspension_id.as_deref().map(parse_uuid).transpose()?,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

struct SuspensionRow {
    suspension_id: String,
    workflow_id: String,
    run_id: String,
    step_id: String,
    kind: String,
    reason: Option<String>,
    metadata: String,
    context: String,
    child: Option<String>,
    status: String,
    version: i64,
    timeout_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SuspensionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            suspension_id: row.try_get("suspension_id")?,
            workflow_id: row.try_get("workflow_id")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            kind: row.try_get("kind")?,
            reason: row.try_get("reason")?,
            metadata: row.try_get("metadata")?,
            context: row.try_get("context")?,
            child: row.try_get("child")?,
            status: row.try_get("status")?,
            version: row.try_get("version")?,
            timeout_at: row.try_get("timeout_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<SuspensionRecord, RepositoryError> {
        let kind: SuspensionKind = serde_json::from_value(serde_json::Value::String(
            self.kind.clone(),
        ))
        .map_err(|_| RepositoryError::Query(format!("invalid suspension kind: {}", self.kind)))?;

        let child = self
            .child
            .as_deref()
            .map(|s| {
                serde_json::from_str::<SuspensionRecord>(s)
                    .map(Box::new)
                    .map_err(|e| RepositoryError::Query(format!("invalid child record: {e}")))
            })
            .transpose()?;

        let version = u32::try_from(self.version)
            .map_err(|_| RepositoryError::Query(format!("invalid version: {}", self.version)))?;

        Ok(SuspensionRecord {
            suspension_id: parse_uuid(&self.suspension_id)?,
            workflow_id: self.workflow_id,
            run_id: parse_uuid(&self.run_id)?,
            step_id: self.step_id,
            kind,
            reason: self.reason,
            metadata: parse_json(&self.metadata, "metadata")?,
            context: parse_json(&self.context, "context")?,
            child,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            version,
            timeout_at: self.timeout_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_json(s: &str, column: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

// ---------------------------------------------------------------------------
// WorkflowRepository implementation
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_run(&self, run: &WorkflowRunRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_runs
                   (run_id, workflow_id, status, context, error, suspension_id,
                    started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                   status = excluded.status,
                   context = excluded.context,
                   error = excluded.error,
                   suspension_id = excluded.suspension_id,
                   updated_at = excluded.updated_at,
                   completed_at = excluded.completed_at"#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow_id)
        .bind(run.status.as_str())
        .bind(to_json(&run.context)?)
        .bind(&run.error)
        .bind(run.suspension_id.map(|id| id.to_string()))
        .bind(format_datetime(&run.started_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        debug!(run_id = %run.run_id, status = run.status.as_str(), "saved workflow run");
        Ok(())
    }

    async fn get_run(
        &self,
        workflow_id: &str,
        run_id: &Uuid,
    ) -> Result<Option<WorkflowRunRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ? AND workflow_id = ?")
            .bind(run_id.to_string())
            .bind(workflow_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(r) => {
                let run_row =
                    RunRow::from_row(&r).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(run_row.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs
               WHERE workflow_id = ?
               ORDER BY started_at DESC, run_id DESC
               LIMIT ?"#,
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|r| {
                RunRow::from_row(r)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_run()
            })
            .collect()
    }

    async fn put_suspension(&self, record: &SuspensionRecord) -> Result<(), RepositoryError> {
        let child = record.child.as_deref().map(to_json).transpose()?;
        sqlx::query(
            r#"INSERT INTO workflow_suspensions
                   (suspension_id, workflow_id, run_id, step_id, kind, reason, metadata,
                    context, child, status, version, timeout_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(suspension_id) DO UPDATE SET
                   step_id = excluded.step_id,
                   kind = excluded.kind,
                   reason = excluded.reason,
                   metadata = excluded.metadata,
                   context = excluded.context,
                   child = excluded.child,
                   status = excluded.status,
                   version = excluded.version,
                   timeout_at = excluded.timeout_at,
                   updated_at = excluded.updated_at"#,
        )
        .bind(record.suspension_id.to_string())
        .bind(&record.workflow_id)
        .bind(record.run_id.to_string())
        .bind(&record.step_id)
        .bind(record.kind.to_string())
        .bind(&record.reason)
        .bind(to_json(&record.metadata)?)
        .bind(to_json(&record.context)?)
        .bind(child)
        .bind(record.status.as_str())
        .bind(i64::from(record.version))
        .bind(record.timeout_at.as_ref().map(format_datetime))
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        debug!(
            suspension_id = %record.suspension_id,
            step_id = %record.step_id,
            "saved suspension record"
        );
        Ok(())
    }

    async fn get_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_suspensions WHERE suspension_id = ?")
            .bind(suspension_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(r) => {
                let suspension_row = SuspensionRow::from_row(&r)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(suspension_row.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_suspensions(&self) -> Result<Vec<SuspensionRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_suspensions
               WHERE status = 'active'
               ORDER BY created_at ASC, suspension_id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|r| {
                SuspensionRow::from_row(r)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_record()
            })
            .collect()
    }

    async fn claim_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<SuspensionRecord, RepositoryError> {
        if let Some(record) = self
            .transition_active(suspension_id, SuspensionStatus::Claimed)
            .await?
        {
            debug!(suspension_id = %suspension_id, version = record.version, "claimed suspension");
            return Ok(record);
        }

        match self.suspension_status(suspension_id).await? {
            Some(SuspensionStatus::Claimed) => Err(RepositoryError::Conflict(format!(
                "suspension {suspension_id} already claimed"
            ))),
            _ => Err(RepositoryError::NotFound),
        }
    }

    async fn release_suspension(&self, suspension_id: &Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_suspensions
               SET status = 'active', version = version + 1, updated_at = ?
               WHERE suspension_id = ? AND status = 'claimed'"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(suspension_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 && self.suspension_status(suspension_id).await?.is_none() {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_suspension(&self, suspension_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_suspensions WHERE suspension_id = ?")
            .bind(suspension_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn abandon_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<SuspensionRecord, RepositoryError> {
        if let Some(record) = self
            .transition_active(suspension_id, SuspensionStatus::Abandoned)
            .await?
        {
            return Ok(record);
        }

        match self.suspension_status(suspension_id).await? {
            Some(SuspensionStatus::Claimed) => Err(RepositoryError::Conflict(format!(
                "suspension {suspension_id} is being resumed"
            ))),
            _ => Err(RepositoryError::NotFound),
        }
    }
}
