//! Workflow state repository trait definition.
//!
//! Defines the storage interface for run history and suspension records.
//! The infrastructure layer (weaver-infra) implements it with SQLite and
//! plain JSON files; `InMemoryWorkflowRepository` covers tests and
//! non-durable use.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use uuid::Uuid;
use weaver_types::error::RepositoryError;
use weaver_types::workflow::{SuspensionRecord, WorkflowRunRecord};

/// Repository trait for workflow state persistence.
///
/// Covers two entity families:
/// - **Runs:** one record per run, overwritten as the run progresses.
/// - **Suspensions:** snapshots of paused runs, claimed exactly once on resume.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert or replace a run record.
    fn save_run(
        &self,
        run: &WorkflowRunRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        workflow_id: &str,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowRunRecord>, RepositoryError>> + Send;

    /// Runs of a workflow, newest first.
    fn list_runs(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<WorkflowRunRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Suspensions
    // -----------------------------------------------------------------------

    /// Insert or replace a suspension record.
    fn put_suspension(
        &self,
        record: &SuspensionRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> impl Future<Output = Result<Option<SuspensionRecord>, RepositoryError>> + Send;

    /// Active suspensions, oldest first.
    fn list_suspensions(
        &self,
    ) -> impl Future<Output = Result<Vec<SuspensionRecord>, RepositoryError>> + Send;

    /// Atomically move an active record to claimed and return it.
    ///
    /// Fails with `Conflict` when already claimed and `NotFound` when the
    /// record is missing or abandoned. Of two concurrent claims exactly one
    /// succeeds.
    fn claim_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> impl Future<Output = Result<SuspensionRecord, RepositoryError>> + Send;

    /// Return a claimed record to active (a resume failed before finishing).
    fn release_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove a record. Returns `true` if it existed.
    fn delete_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark an active record abandoned so it can never be resumed.
    fn abandon_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> impl Future<Output = Result<SuspensionRecord, RepositoryError>> + Send;
}

type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Object-safe version of [`WorkflowRepository`] with boxed futures.
pub trait WorkflowRepositoryDyn: Send + Sync {
    fn save_run_boxed<'a>(&'a self, run: &'a WorkflowRunRecord) -> RepoFuture<'a, ()>;

    fn get_run_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
        run_id: &'a Uuid,
    ) -> RepoFuture<'a, Option<WorkflowRunRecord>>;

    fn list_runs_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
        limit: Option<u32>,
    ) -> RepoFuture<'a, Vec<WorkflowRunRecord>>;

    fn put_suspension_boxed<'a>(&'a self, record: &'a SuspensionRecord) -> RepoFuture<'a, ()>;

    fn get_suspension_boxed<'a>(
        &'a self,
        suspension_id: &'a Uuid,
    ) -> RepoFuture<'a, Option<SuspensionRecord>>;

    fn list_suspensions_boxed(&self) -> RepoFuture<'_, Vec<SuspensionRecord>>;

    fn claim_suspension_boxed<'a>(
        &'a self,
        suspension_id: &'a Uuid,
    ) -> RepoFuture<'a, SuspensionRecord>;

    fn release_suspension_boxed<'a>(&'a self, suspension_id: &'a Uuid) -> RepoFuture<'a, ()>;

    fn delete_suspension_boxed<'a>(&'a self, suspension_id: &'a Uuid) -> RepoFuture<'a, bool>;

    fn abandon_suspension_boxed<'a>(
        &'a self,
        suspension_id: &'a Uuid,
    ) -> RepoFuture<'a, SuspensionRecord>;
}

impl<T: WorkflowRepository> WorkflowRepositoryDyn for T {
    fn save_run_boxed<'a>(&'a self, run: &'a WorkflowRunRecord) -> RepoFuture<'a, ()> {
        Box::pin(self.save_run(run))
    }

    fn get_run_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
        run_id: &'a Uuid,
    ) -> RepoFuture<'a, Option<WorkflowRunRecord>> {
        Box::pin(self.get_run(workflow_id, run_id))
    }

    fn list_runs_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
        limit: Option<u32>,
    ) -> RepoFuture<'a, Vec<WorkflowRunRecord>> {
        Box::pin(self.list_runs(workflow_id, limit))
    }

    fn put_suspension_boxed<'a>(&'a self, record: &'a SuspensionRecord) -> RepoFuture<'a, ()> {
        Box::pin(self.put_suspension(record))
    }

    fn get_suspension_boxed<'a>(
        &'a self,
        suspension_id: &'a Uuid,
    ) -> RepoFuture<'a, Option<SuspensionRecord>> {
        Box::pin(self.get_suspension(suspension_id))
    }

    fn list_suspensions_boxed(&self) -> RepoFuture<'_, Vec<SuspensionRecord>> {
        Box::pin(self.list_suspensions())
    }

    fn claim_suspension_boxed<'a>(
        &'a self,
        suspension_id: &'a Uuid,
    ) -> RepoFuture<'a, SuspensionRecord> {
        Box::pin(self.claim_suspension(suspension_id))
    }

    fn release_suspension_boxed<'a>(&'a self, suspension_id: &'a Uuid) -> RepoFuture<'a, ()> {
        Box::pin(self.release_suspension(suspension_id))
    }

    fn delete_suspension_boxed<'a>(&'a self, suspension_id: &'a Uuid) -> RepoFuture<'a, bool> {
        Box::pin(self.delete_suspension(suspension_id))
    }

    fn abandon_suspension_boxed<'a>(
        &'a self,
        suspension_id: &'a Uuid,
    ) -> RepoFuture<'a, SuspensionRecord> {
        Box::pin(self.abandon_suspension(suspension_id))
    }
}

/// Type-erased repository so the engine can pick a backend at runtime.
#[derive(Clone)]
pub struct BoxWorkflowRepository {
    inner: Arc<dyn WorkflowRepositoryDyn>,
}

impl BoxWorkflowRepository {
    pub fn new<T: WorkflowRepository + 'static>(repo: T) -> Self {
        Self {
            inner: Arc::new(repo),
        }
    }

    pub async fn save_run(&self, run: &WorkflowRunRecord) -> Result<(), RepositoryError> {
        self.inner.save_run_boxed(run).await
    }

    pub async fn get_run(
        &self,
        workflow_id: &str,
        run_id: &Uuid,
    ) -> Result<Option<WorkflowRunRecord>, RepositoryError> {
        self.inner.get_run_boxed(workflow_id, run_id).await
    }

    pub async fn list_runs(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
        self.inner.list_runs_boxed(workflow_id, limit).await
    }

    pub async fn put_suspension(&self, record: &SuspensionRecord) -> Result<(), RepositoryError> {
        self.inner.put_suspension_boxed(record).await
    }

    pub async fn get_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        self.inner.get_suspension_boxed(suspension_id).await
    }

    pub async fn list_suspensions(&self) -> Result<Vec<SuspensionRecord>, RepositoryError> {
        self.inner.list_suspensions_boxed().await
    }

    pub async fn claim_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<SuspensionRecord, RepositoryError> {
        self.inner.claim_suspension_boxed(suspension_id).await
    }

    pub async fn release_suspension(&self, suspension_id: &Uuid) -> Result<(), RepositoryError> {
        self.inner.release_suspension_boxed(suspension_id).await
    }

    pub async fn delete_suspension(&self, suspension_id: &Uuid) -> Result<bool, RepositoryError> {
        self.inner.delete_suspension_boxed(suspension_id).await
    }

    pub async fn abandon_suspension(
        &self,
        suspension_id: &Uuid,
    ) -> Result<SuspensionRecord, RepositoryError> {
        self.inner.abandon_suspension_boxed(suspension_id).await
    }
}

impl std::fmt::Debug for BoxWorkflowRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxWorkflowRepository").finish_non_exhaustive()
    }
}
