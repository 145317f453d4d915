use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres};
use std::time::Duration;

use super::{jobs, runs, JobRunStore, JobStore, ReclaimedJob};
use crate::models::{Error, Job, JobLock, JobRun, JobRunStatus, JobType, NewJob};

/// Store shared by every worker process through one Postgres database.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create(&self, job: NewJob) -> Result<i64, Error> {
        jobs::create(&self.pool, job).await
    }

    async fn get_by_id(&self, job_id: i64) -> Result<Option<Job>, Error> {
        jobs::get_by_id(&self.pool, job_id).await
    }

    async fn get_recent(&self, limit: i64, offset: i64) -> Result<Vec<Job>, Error> {
        jobs::get_recent(&self.pool, limit, offset).await
    }

    async fn has_pending_by_type(&self, job_type: JobType) -> Result<bool, Error> {
        jobs::has_pending_by_type(&self.pool, job_type).await
    }

    async fn fetch_due(&self, limit: i64) -> Result<Vec<Job>, Error> {
        jobs::fetch_due(&self.pool, limit).await
    }

    async fn claim(&self, job_id: i64, worker_id: &str) -> Result<Option<Job>, Error> {
        jobs::claim(&self.pool, job_id, worker_id).await
    }

    async fn succeed(&self, job_id: i64, lock: &JobLock) -> Result<bool, Error> {
        Ok(jobs::succeed(&self.pool, job_id, lock).await? > 0)
    }

    async fn retry(
        &self,
        job_id: i64,
        lock: &JobLock,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, Error> {
        Ok(jobs::retry(&self.pool, job_id, lock, run_at, error).await? > 0)
    }

    async fn fail(&self, job_id: i64, lock: &JobLock, error: &str) -> Result<bool, Error> {
        Ok(jobs::fail(&self.pool, job_id, lock, error).await? > 0)
    }

    async fn reclaim_stale(
        &self,
        stale_after: Duration,
        requeue_error: &str,
        fail_error: &str,
    ) -> Result<Vec<ReclaimedJob>, Error> {
        jobs::reclaim_stale(&self.pool, stale_after, requeue_error, fail_error).await
    }

    async fn ping(&self) -> Result<(), Error> {
        jobs::select_one(&self.pool).await
    }
}

#[async_trait]
impl JobRunStore for PgStore {
    async fn start_run(&self, job_id: i64) -> Result<i64, Error> {
        runs::start(&self.pool, job_id).await
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: JobRunStatus,
        error_message: Option<&str>,
        metrics: &Value,
    ) -> Result<bool, Error> {
        Ok(runs::finish(&self.pool, run_id, status, error_message, metrics).await? > 0)
    }

    async fn get_runs(&self, job_id: i64) -> Result<Vec<JobRun>, Error> {
        runs::get_by_job_id(&self.pool, job_id).await
    }
}
