use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};
use tokio::sync::Mutex;

use super::{JobRunStore, JobStore, ReclaimedJob};
use crate::models::{Error, Job, JobLock, JobRun, JobRunStatus, JobStatus, JobType, NewJob};

/// Single-process store. Every operation runs under one mutex, which gives
/// claims the same compare-and-swap semantics as the conditional update in
/// Postgres.
#[derive(Debug, Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

#[derive(Debug, Default)]
struct MemState {
    jobs: BTreeMap<i64, Job>,
    runs: Vec<JobRun>,
    next_job_id: i64,
    next_run_id: i64,
}

impl MemState {
    fn locked_job(&mut self, job_id: i64, lock: &JobLock) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id).filter(|job| {
            job.status == JobStatus::Running
                && job.locked_by.as_deref() == Some(lock.locked_by.as_str())
                && job.locked_at == Some(lock.locked_at)
        })
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct mutation of a stored job, for setting up states the engine
    /// would only reach over time.
    #[cfg(test)]
    pub async fn update<F: FnOnce(&mut Job)>(&self, job_id: i64, f: F) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        f(job);
        Ok(())
    }

    #[cfg(test)]
    pub async fn all_jobs(&self) -> Vec<Job> {
        self.state.lock().await.jobs.values().cloned().collect()
    }
}

fn release(job: &mut Job, status: JobStatus, now: DateTime<Utc>) {
    job.status = status;
    job.locked_by = None;
    job.locked_at = None;
    job.updated_at = now;
}

#[async_trait]
impl JobStore for MemStore {
    async fn create(&self, job: NewJob) -> Result<i64, Error> {
        let mut state = self.state.lock().await;
        state.next_job_id += 1;
        let id = state.next_job_id;
        let now = Utc::now();
        state.jobs.insert(
            id,
            Job {
                id,
                job_type: job.job_type.as_str().to_owned(),
                status: JobStatus::Queued,
                payload: job.payload,
                run_at: job.run_at.unwrap_or(now),
                attempts: 0,
                max_attempts: job.max_attempts,
                locked_by: None,
                locked_at: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_by_id(&self, job_id: i64) -> Result<Option<Job>, Error> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn get_recent(&self, limit: i64, offset: i64) -> Result<Vec<Job>, Error> {
        let state = self.state.lock().await;
        let mut jobs: Vec<&Job> = state.jobs.values().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn has_pending_by_type(&self, job_type: JobType) -> Result<bool, Error> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .any(|job| job.job_type == job_type.as_str() && job.status.is_pending()))
    }

    async fn fetch_due(&self, limit: i64) -> Result<Vec<Job>, Error> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut due: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.status.is_claimable() && job.run_at <= now)
            .collect();
        due.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id)));
        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn claim(&self, job_id: i64, worker_id: &str) -> Result<Option<Job>, Error> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let Some(job) = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.status.is_claimable() && job.run_at <= now)
        else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.locked_by = Some(worker_id.to_owned());
        job.locked_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn succeed(&self, job_id: i64, lock: &JobLock) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let Some(job) = state.locked_job(job_id, lock) else {
            return Ok(false);
        };
        job.last_error = None;
        release(job, JobStatus::Succeeded, Utc::now());
        Ok(true)
    }

    async fn retry(
        &self,
        job_id: i64,
        lock: &JobLock,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let Some(job) = state.locked_job(job_id, lock) else {
            return Ok(false);
        };
        job.attempts += 1;
        job.run_at = run_at;
        job.last_error = Some(error.to_owned());
        release(job, JobStatus::Retrying, Utc::now());
        Ok(true)
    }

    async fn fail(&self, job_id: i64, lock: &JobLock, error: &str) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let Some(job) = state.locked_job(job_id, lock) else {
            return Ok(false);
        };
        job.attempts = (job.attempts + 1).min(job.max_attempts);
        job.last_error = Some(error.to_owned());
        release(job, JobStatus::Failed, Utc::now());
        Ok(true)
    }

    async fn reclaim_stale(
        &self,
        stale_after: Duration,
        requeue_error: &str,
        fail_error: &str,
    ) -> Result<Vec<ReclaimedJob>, Error> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|_| Error::InvalidParams("stale_after"))?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for job in state.jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && job.locked_at.is_some_and(|at| at < now - stale_after);
            if !stale {
                continue;
            }
            if job.attempts + 1 >= job.max_attempts {
                job.attempts = job.max_attempts;
                job.last_error = Some(fail_error.to_owned());
                release(job, JobStatus::Failed, now);
            } else {
                job.attempts += 1;
                job.run_at = now;
                job.last_error = Some(requeue_error.to_owned());
                release(job, JobStatus::Queued, now);
            }
            reclaimed.push(ReclaimedJob {
                id: job.id,
                status: job.status,
            });
        }
        Ok(reclaimed)
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl JobRunStore for MemStore {
    async fn start_run(&self, job_id: i64) -> Result<i64, Error> {
        let mut state = self.state.lock().await;
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.push(JobRun {
            id,
            job_id,
            status: JobRunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
            metrics: None,
        });
        Ok(id)
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: JobRunStatus,
        error_message: Option<&str>,
        metrics: &Value,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let Some(run) = state
            .runs
            .iter_mut()
            .find(|run| run.id == run_id && run.status == JobRunStatus::Running)
        else {
            return Ok(false);
        };
        run.status = status;
        run.finished_at = Some(Utc::now());
        run.error_message = error_message.map(str::to_owned);
        run.metrics = Some(metrics.clone());
        Ok(true)
    }

    async fn get_runs(&self, job_id: i64) -> Result<Vec<JobRun>, Error> {
        let state = self.state.lock().await;
        let mut runs: Vec<JobRun> = state
            .runs
            .iter()
            .filter(|run| run.job_id == job_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_job(job_type: JobType) -> NewJob {
        NewJob {
            job_type,
            payload: json!({}),
            run_at: None,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive() -> anyhow::Result<()> {
        // arrange
        let store = MemStore::new();
        let job_id = store.create(new_job(JobType::Export)).await?;

        // act
        let (a, b) = tokio::join!(store.claim(job_id, "worker-a"), store.claim(job_id, "worker-b"));

        // assert
        let claimed: Vec<Job> = [a?, b?].into_iter().flatten().collect();
        assert_eq!(1, claimed.len());
        assert_eq!(JobStatus::Running, claimed[0].status);
        assert!(claimed[0].lock().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn claim_skips_future_jobs() -> anyhow::Result<()> {
        // arrange
        let store = MemStore::new();
        let mut job = new_job(JobType::Draft);
        job.run_at = Some(Utc::now() + chrono::Duration::minutes(5));
        let job_id = store.create(job).await?;

        // act
        let claimed = store.claim(job_id, "worker-a").await?;

        // assert
        assert!(claimed.is_none());
        assert!(store.fetch_due(10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn fetch_due_orders_by_run_at_and_limits() -> anyhow::Result<()> {
        // arrange
        let store = MemStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for minutes in [1, 3, 2] {
            let mut job = new_job(JobType::Packet);
            job.run_at = Some(now - chrono::Duration::minutes(minutes));
            ids.push(store.create(job).await?);
        }

        // act
        let due = store.fetch_due(2).await?;

        // assert
        let due_ids: Vec<i64> = due.iter().map(|job| job.id).collect();
        assert_eq!(vec![ids[1], ids[2]], due_ids);
        Ok(())
    }

    #[tokio::test]
    async fn writes_require_the_claim_lock() -> anyhow::Result<()> {
        // arrange
        let store = MemStore::new();
        let job_id = store.create(new_job(JobType::Docs)).await?;
        let job = store.claim(job_id, "worker-a").await?.expect("claimed");
        let mut foreign = job.lock().expect("locked");
        foreign.locked_by = "worker-b".into();

        // act
        let applied = store.succeed(job_id, &foreign).await?;

        // assert
        assert!(!applied);
        let stored = store.get_by_id(job_id).await?.expect("stored");
        assert_eq!(JobStatus::Running, stored.status);
        Ok(())
    }

    #[tokio::test]
    async fn fail_never_exceeds_max_attempts() -> anyhow::Result<()> {
        // arrange
        let store = MemStore::new();
        let job_id = store.create(new_job(JobType::Docs)).await?;
        store.update(job_id, |job| job.attempts = job.max_attempts).await?;
        let job = store.claim(job_id, "worker-a").await?.expect("claimed");

        // act
        store.fail(job_id, &job.lock().expect("locked"), "boom").await?;

        // assert
        let stored = store.get_by_id(job_id).await?.expect("stored");
        assert_eq!(JobStatus::Failed, stored.status);
        assert_eq!(stored.max_attempts, stored.attempts);
        Ok(())
    }

    #[tokio::test]
    async fn runs_are_listed_newest_first() -> anyhow::Result<()> {
        // arrange
        let store = MemStore::new();
        let job_id = store.create(new_job(JobType::Export)).await?;
        let first = store.start_run(job_id).await?;
        let second = store.start_run(job_id).await?;

        // act
        let finished = store
            .finish_run(first, JobRunStatus::Failed, Some("boom"), &json!({}))
            .await?;
        let finished_again = store
            .finish_run(first, JobRunStatus::Succeeded, None, &json!({}))
            .await?;
        let runs = store.get_runs(job_id).await?;

        // assert
        assert!(finished);
        assert!(!finished_again);
        assert_eq!(vec![second, first], runs.iter().map(|run| run.id).collect::<Vec<_>>());
        assert_eq!(JobRunStatus::Failed, runs[1].status);
        assert_eq!(Some("boom"), runs[1].error_message.as_deref());
        Ok(())
    }
}
