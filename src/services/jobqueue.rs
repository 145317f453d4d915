use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::{
    db::Store,
    models::{Error, JobType, NewJob},
};

/// Enqueue API used by request handlers and by periodic jobs scheduling
/// their next run.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn Store>,
    max_attempts: i32,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>, max_attempts: i32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    /// Inserts a QUEUED job eligible at `run_at`, or immediately when `None`.
    /// No deduplication happens here.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: Value,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<i64, Error> {
        self.enqueue_with_attempts(job_type, payload, run_at, self.max_attempts)
            .await
    }

    pub async fn enqueue_with_attempts(
        &self,
        job_type: JobType,
        payload: Value,
        run_at: Option<DateTime<Utc>>,
        max_attempts: i32,
    ) -> Result<i64, Error> {
        if max_attempts < 1 {
            return Err(Error::InvalidParams("max_attempts"));
        }
        let job_id = self
            .store
            .create(NewJob {
                job_type,
                payload,
                run_at,
                max_attempts,
            })
            .await?;
        debug!({ job_id, job_type = %job_type, max_attempts }, "enqueued");
        Ok(job_id)
    }

    /// True while a job of this type is QUEUED, RUNNING or RETRYING.
    pub async fn has_pending_job_by_type(&self, job_type: JobType) -> Result<bool, Error> {
        self.store.has_pending_by_type(job_type).await
    }

    /// Enqueues unless a job of the same type is already pending. Two callers
    /// racing past the check may both enqueue.
    pub async fn schedule_unique(
        &self,
        job_type: JobType,
        payload: Value,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Option<i64>, Error> {
        if self.has_pending_job_by_type(job_type).await? {
            debug!({ job_type = %job_type }, "already pending, skip schedule");
            return Ok(None);
        }
        self.enqueue(job_type, payload, run_at).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobStore, MemStore};
    use crate::models::JobStatus;
    use serde_json::json;

    fn queue() -> (Arc<MemStore>, JobQueue) {
        let store = Arc::new(MemStore::new());
        let queue = JobQueue::new(store.clone(), 3);
        (store, queue)
    }

    #[tokio::test]
    async fn enqueue_creates_queued_job() -> anyhow::Result<()> {
        // arrange
        let (store, queue) = queue();

        // act
        let job_id = queue
            .enqueue(JobType::Export, json!({ "sheet": "summary" }), None)
            .await?;

        // assert
        let job = store.get_by_id(job_id).await?.expect("stored");
        assert_eq!("EXPORT", job.job_type);
        assert_eq!(JobStatus::Queued, job.status);
        assert_eq!(0, job.attempts);
        assert_eq!(3, job.max_attempts);
        assert!(job.run_at <= Utc::now());
        assert!(job.lock().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_rejects_zero_attempts() -> anyhow::Result<()> {
        // arrange
        let (_, queue) = queue();

        // act
        let res = queue
            .enqueue_with_attempts(JobType::Docs, json!({}), None, 0)
            .await;

        // assert
        assert!(matches!(res, Err(Error::InvalidParams("max_attempts"))));
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_does_not_deduplicate() -> anyhow::Result<()> {
        // arrange
        let (store, queue) = queue();

        // act
        queue.enqueue(JobType::Docs, json!({}), None).await?;
        queue.enqueue(JobType::Docs, json!({}), None).await?;

        // assert
        assert_eq!(2, store.all_jobs().await.len());
        Ok(())
    }

    #[tokio::test]
    async fn schedule_unique_skips_when_pending() -> anyhow::Result<()> {
        // arrange
        let (store, queue) = queue();
        let first = queue.schedule_unique(JobType::Detect, json!({}), None).await?;

        // act
        let second = queue.schedule_unique(JobType::Detect, json!({}), None).await?;
        let other_type = queue.schedule_unique(JobType::Draft, json!({}), None).await?;

        // assert
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(other_type.is_some());
        assert_eq!(2, store.all_jobs().await.len());
        Ok(())
    }
}
