use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::models::{Error, Job, JobLock, JobRun, JobRunStatus, JobStatus, JobType, NewJob};

pub mod jobs;
pub mod runs;

mod memory;
mod postgres;

pub use memory::MemStore;
pub use postgres::PgStore;

/// Job reclaimed from an abandoned lock and the status it was moved to.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ReclaimedJob {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
}

/// Persisted job table. Writes after a claim only apply while the job is
/// still RUNNING under the given lock and report whether they applied.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: NewJob) -> Result<i64, Error>;

    async fn get_by_id(&self, job_id: i64) -> Result<Option<Job>, Error>;

    /// Newest first.
    async fn get_recent(&self, limit: i64, offset: i64) -> Result<Vec<Job>, Error>;

    async fn has_pending_by_type(&self, job_type: JobType) -> Result<bool, Error>;

    /// QUEUED or RETRYING jobs with `run_at <= now`, oldest `run_at` first.
    async fn fetch_due(&self, limit: i64) -> Result<Vec<Job>, Error>;

    /// Atomic compare-and-swap from claimable to RUNNING. `None` when
    /// another worker got there first.
    async fn claim(&self, job_id: i64, worker_id: &str) -> Result<Option<Job>, Error>;

    async fn succeed(&self, job_id: i64, lock: &JobLock) -> Result<bool, Error>;

    async fn retry(
        &self,
        job_id: i64,
        lock: &JobLock,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, Error>;

    async fn fail(&self, job_id: i64, lock: &JobLock, error: &str) -> Result<bool, Error>;

    /// Recovers RUNNING jobs locked longer than `stale_after`: QUEUED for an
    /// immediate rerun, or FAILED once attempts are exhausted.
    async fn reclaim_stale(
        &self,
        stale_after: Duration,
        requeue_error: &str,
        fail_error: &str,
    ) -> Result<Vec<ReclaimedJob>, Error>;

    async fn ping(&self) -> Result<(), Error>;
}

/// Append-only execution history.
#[async_trait]
pub trait JobRunStore: Send + Sync {
    async fn start_run(&self, job_id: i64) -> Result<i64, Error>;

    async fn finish_run(
        &self,
        run_id: i64,
        status: JobRunStatus,
        error_message: Option<&str>,
        metrics: &Value,
    ) -> Result<bool, Error>;

    /// Newest first.
    async fn get_runs(&self, job_id: i64) -> Result<Vec<JobRun>, Error>;
}

pub trait Store: JobStore + JobRunStore {}

impl<T: JobStore + JobRunStore> Store for T {}
