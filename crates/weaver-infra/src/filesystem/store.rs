//! JSON-file workflow state repository.
//!
//! Layout under the root directory:
//! ```text
//! runs/<run_id>.json
//! suspensions/active/<suspension_id>.json
//! suspensions/claimed/<suspension_id>.json
//! suspensions/abandoned/<suspension_id>.json
//! ```
//!
//! A suspension's status is the directory it lives in. Claiming renames the
//! file from `active/` to `claimed/`; `rename` is atomic within one
//! filesystem, so of two concurrent claims only one finds the source.
//! Writes go to a temporary file first and are renamed into place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;
use weaver_core::repository::workflow::WorkflowRepository;
use weaver_types::error::RepositoryError;
use weaver_types::workflow::{SuspensionRecord, SuspensionStatus, WorkflowRunRecord};

const STATUSES: [SuspensionStatus; 3] = [
    SuspensionStatus::Active,
    SuspensionStatus::Claimed,
    SuspensionStatus::Abandoned,
];

/// Filesystem-backed implementation of `WorkflowRepository`.
#[derive(Debug, Clone)]
pub struct FileWorkflowRepository {
    root: PathBuf,
}

impl FileWorkflowRepository {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let repo = Self { root: root.into() };
        create_dir(&repo.runs_dir()).await?;
        for status in STATUSES {
            create_dir(&repo.suspension_dir(status)).await?;
        }
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_path(&self, run_id: &Uuid) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    fn suspension_dir(&self, status: SuspensionStatus) -> PathBuf {
        self.root.join("suspensions").join(status.as_str())
    }

    fn suspension_path(&self, status: SuspensionStatus, suspension_id: &Uuid) -> PathBuf {
        self.suspension_dir(status)
            .join(format!("{suspension_id}.json"))
    }

    /// Read a suspension from the directory for `status`.
    async fn read_suspension(
        &self,
        status: SuspensionStatus,
        suspension_id: &Uuid,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        let path = self.suspension_path(status, suspension_id);
        let record: Option<SuspensionRecord> = read_json(&path).await?;
        Ok(record.map(|mut r| {
            r.status = status;
            r
        }))
    }

    async fn locate(
        &self,
        suspension_id: &Uuid,
    ) -> Result<Option<SuspensionStatus>, RepositoryError> {
        for status in STATUSES {
            let exists = tokio::fs::try_exists(self.suspension_path(status, suspension_id))
                .await
                .map_err(io_error)?;
            if exists {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    /// Move a record between status directories and rewrite it.
    ///
    /// Returns `Ok(None)` when no record sits in `from`.
    async fn transition(
        &self,
        suspension_id: &Uuid,
        from: SuspensionStatus,
        to: SuspensionStatus,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        let source = self.suspension_path(from, suspension_id);
        let target = self.suspension_path(to, suspension_id);
        match tokio::fs::rename(&source, &target).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(e)),
        }

        let Some(mut record) = self.read_suspension(to, suspension_id).await? else {
            return Err(RepositoryError::Query(format!(
                "suspension {suspension_id} vanished after move"
            )));
        };
        record.version += 1;
        record.updated_at = Utc::now();
        write_json(&target, &record).await?;
        Ok(Some(record))
    }

    async fn conflict_or_missing(
        &self,
        suspension_id: &Uuid,
        message: &str,
    ) -> RepositoryError {
        match self.locate(suspension_id).await {
            Ok(Some(SuspensionStatus::Claimed)) => {
                RepositoryError::Conflict(format!("suspension {suspension_id} {message}"))
            }
            Ok(_) => RepositoryError::NotFound,
            Err(e) => e,
        }
    }
}

fn io_error(e: std::io::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

async fn create_dir(path: &Path) -> Result<(), RepositoryError> {
    tokio::fs::create_dir_all(path).await.map_err(io_error)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RepositoryError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| RepositoryError::Query(format!("invalid JSON in {}: {e}", path.display())))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RepositoryError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| RepositoryError::Query(e.to_string()))?;
    let tmp = path.with_extension(format!("{}.tmp", Uuid::now_v7().simple()));
    tokio::fs::write(&tmp, json).await.map_err(io_error)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error)
}

async fn remove_if_exists(path: &Path) -> Result<bool, RepositoryError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(e)),
    }
}

/// Parse every `*.json` file in `dir`, skipping unreadable ones with a warning.
async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, RepositoryError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json(&path).await {
            Ok(Some(value)) => out.push(value),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable state file"),
        }
    }
    Ok(out)
}

impl WorkflowRepository for FileWorkflowRepository {
    async fn save_run(&self, run: &WorkflowRunRecord) -> Result<(), RepositoryError> {
        write_json(&self.run_path(&run.run_id), run).await?;
        debug!(run_id = %run.run_id, status = run.status.as_str(), "saved workflow run");
        Ok(())
    }

    async fn get_run(
        &self,
        workflow_id: &str,
        run_id: &Uuid,
    ) -> Result<Option<WorkflowRunRecord>, RepositoryError> {
        let run: Option<WorkflowRunRecord> = read_json(&self.run_path(run_id)).await?;
        Ok(run.filter(|r| r.workflow_id == workflow_id))
    }

    async fn list_runs(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
        let mut runs: Vec<WorkflowRunRecord> = read_all::<WorkflowRunRecord>(&self.runs_dir())
            .await?
            .into_iter()
            .filter(|r| r.workflow_id == workflow_id)
            .collect();
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        if let Some(limit) = limit {
            runs.truncate(limit as usize);
        }
        Ok(runs)
    }

    async fn put_suspension(&self, record: &SuspensionRecord) -> Result<(), RepositoryError> {
        write_json(
            &self.suspension_path(record.status, &record.suspension_id),
            record,
        )
        .await?;
        for status in STATUSES.into_iter().filter(|s| *s != record.status) {
            remove_if_exists(&self.suspension_path(status, &record.suspension_id)).await?;
        }
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
        for status in STATUSES {
            if let Some(record) = self.read_suspension(status, suspension_id).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn list_suspensions(&self) -> Result<Vec<SuspensionRecord>, RepositoryError> {
        let mut records: Vec<SuspensionRecord> =
            read_all::<SuspensionRecord>(&self.suspension_dir(SuspensionStatus::Active))
                .await?
                .into_iter()
                .map(|mut r| {
                    r.status = SuspensionStatus::Active;
                    r
                })
                .collect();
        records.sort_by_key(|r| (r.created_at, r.suspension_id));
        Ok(records)
    }

    async fn claim_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<SuspensionRecord, RepositoryError> {
        match self
            .transition(suspension_id, SuspensionStatus::Active, SuspensionStatus::Claimed)
            .await?
        {
            Some(record) => {
                debug!(suspension_id = %suspension_id, version = record.version, "claimed suspension");
                Ok(record)
            }
            None => Err(self.conflict_or_missing(suspension_id, "already claimed").await),
        }
    }

    async fn release_suspension(&self, suspension_id: &Uuid) -> Result<(), RepositoryError> {
        let released = self
            .transition(suspension_id, SuspensionStatus::Claimed, SuspensionStatus::Active)
            .await?;
        if released.is_none() && self.locate(suspension_id).await?.is_none() {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_suspension(&self, suspension_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut removed = false;
        for status in STATUSES {
            removed |= remove_if_exists(&self.suspension_path(status, suspension_id)).await?;
        }
        Ok(removed)
    }

    async fn abandon_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<SuspensionRecord, RepositoryError> {
        match self
            .transition(suspension_id, SuspensionStatus::Active, SuspensionStatus::Abandoned)
            .await?
        {
            Some(record) => Ok(record),
            None => Err(self.conflict_or_missing(suspension_id, "is being resumed").await),
        }
    }
}
