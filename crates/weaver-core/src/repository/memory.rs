//! In-memory `WorkflowRepository`.
//!
//! State lives in `DashMap`s and is lost when the process exits. Claiming
//! holds the entry's shard lock while checking and updating the status, so
//! concurrent claims on one record serialize.

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;
use weaver_types::error::RepositoryError;
use weaver_types::workflow::{SuspensionRecord, SuspensionStatus, WorkflowRunRecord};

use super::workflow::WorkflowRepository;

#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    runs: DashMap<Uuid, WorkflowRunRecord>,
    suspensions: DashMap<Uuid, SuspensionRecord>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_run(&self, run: &WorkflowRunRecord) -> Result<(), RepositoryError> {
        self.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(
        &self,
        workflow_id: &str,
        run_id: &Uuid,
    ) -> Result<Option<WorkflowRunRecord>, RepositoryError> {
        Ok(self
            .runs
            .get(run_id)
            .filter(|r| r.workflow_id == workflow_id)
            .map(|r| r.value().clone()))
    }

    async fn list_runs(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
        let mut runs: Vec<WorkflowRunRecord> = self
            .runs
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .map(|r| r.value().clone())
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
        self.suspensions.insert(record.suspension_id, record.clone());
        Ok(())
    }

    async fn get_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        Ok(self.suspensions.get(suspension_id).map(|r| r.value().clone()))
    }

    async fn list_suspensions(&self) -> Result<Vec<SuspensionRecord>, RepositoryError> {
        let mut records: Vec<SuspensionRecord> = self
            .suspensions
            .iter()
            .filter(|r| r.status == SuspensionStatus::Active)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| (r.created_at, r.suspension_id));
        Ok(records)
    }

    async fn claim_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<SuspensionRecord, RepositoryError> {
        let mut entry = self
            .suspensions
            .get_mut(suspension_id)
            .ok_or(RepositoryError::NotFound)?;
        match entry.status {
            SuspensionStatus::Active => {
                entry.status = SuspensionStatus::Claimed;
                entry.version += 1;
                entry.updated_at = Utc::now();
                Ok(entry.value().clone())
            }
            SuspensionStatus::Claimed => Err(RepositoryError::Conflict(format!(
                "suspension {suspension_id} already claimed"
            ))),
            SuspensionStatus::Abandoned => Err(RepositoryError::NotFound),
        }
    }

    async fn release_suspension(&self, suspension_id: &Uuid) -> Result<(), RepositoryError> {
        let mut entry = self
            .suspensions
            .get_mut(suspension_id)
            .ok_or(RepositoryError::NotFound)?;
        if entry.status == SuspensionStatus::Claimed {
            entry.status = SuspensionStatus::Active;
            entry.version += 1;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_suspension(&self, suspension_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.suspensions.remove(suspension_id).is_some())
    }

    async fn abandon_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<SuspensionRecord, RepositoryError> {
        let mut entry = self
            .suspensions
            .get_mut(suspension_id)
            .ok_or(RepositoryError::NotFound)?;
        match entry.status {
            SuspensionStatus::Active => {
                entry.status = SuspensionStatus::Abandoned;
                entry.version += 1;
                entry.updated_at = Utc::now();
                Ok(entry.value().clone())
            }
            SuspensionStatus::Claimed => Err(RepositoryError::Conflict(format!(
                "suspension {suspension_id} is being resumed"
            ))),
            SuspensionStatus::Abandoned => Err(RepositoryError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::BoxWorkflowRepository;
    use serde_json::json;
    use std::sync::Arc;
    use weaver_types::workflow::{SuspensionKind, WorkflowRunStatus};

    fn record() -> SuspensionRecord {
        let now = Utc::now();
        SuspensionRecord {
            suspension_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            run_id: Uuid::now_v7(),
            step_id: "approve".to_string(),
            kind: SuspensionKind::Human,
            reason: Some("needs approval".to_string()),
            metadata: json!({}),
            context: json!({}),
            child: None,
            status: SuspensionStatus::Active,
            version: 0,
            timeout_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn run(workflow_id: &str) -> WorkflowRunRecord {
        let now = Utc::now();
        WorkflowRunRecord {
            workflow_id: workflow_id.to_string(),
            run_id: Uuid::now_v7(),
            status: WorkflowRunStatus::Completed,
            context: json!({}),
            error: None,
            suspension_id: None,
            started_at: now,
            updated_at: now,
            completed_at: Some(now),
        }
    }

    #[tokio::test]
    async fn test_claim_once() {
        let repo = InMemoryWorkflowRepository::new();
        let rec = record();
        repo.put_suspension(&rec).await.unwrap();

        let claimed = repo.claim_suspension(&rec.suspension_id).await.unwrap();
        assert_eq!(claimed.status, SuspensionStatus::Claimed);
        assert_eq!(claimed.version, 1);

        let err = repo.claim_suspension(&rec.suspension_id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(repo.list_suspensions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_one_winner() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let rec = record();
        repo.put_suspension(&rec).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = Arc::clone(&repo);
            let id = rec.suspension_id;
            handles.push(tokio::spawn(async move { repo.claim_suspension(&id).await }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_release_and_abandon() {
        let repo = BoxWorkflowRepository::new(InMemoryWorkflowRepository::new());
        let rec = record();
        repo.put_suspension(&rec).await.unwrap();

        repo.claim_suspension(&rec.suspension_id).await.unwrap();
        repo.release_suspension(&rec.suspension_id).await.unwrap();
        assert_eq!(repo.list_suspensions().await.unwrap().len(), 1);

        let abandoned = repo.abandon_suspension(&rec.suspension_id).await.unwrap();
        assert_eq!(abandoned.status, SuspensionStatus::Abandoned);
        let err = repo.claim_suspension(&rec.suspension_id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));

        assert!(repo.delete_suspension(&rec.suspension_id).await.unwrap());
        assert!(!repo.delete_suspension(&rec.suspension_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_runs_filtered_and_limited() {
        let repo = InMemoryWorkflowRepository::new();
        let first = run("wf");
        repo.save_run(&first).await.unwrap();
        repo.save_run(&run("wf")).await.unwrap();
        repo.save_run(&run("other")).await.unwrap();

        assert_eq!(repo.list_runs("wf", None).await.unwrap().len(), 2);
        assert_eq!(repo.list_runs("wf", Some(1)).await.unwrap().len(), 1);
        assert!(repo.get_run("other", &first.run_id).await.unwrap().is_none());
        assert!(repo.get_run("wf", &first.run_id).await.unwrap().is_some());
    }
}
