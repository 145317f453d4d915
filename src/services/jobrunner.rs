use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{json, Value};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use super::{
    jobqueue::JobQueue,
    registry::{HandlerError, HandlerRegistry},
};
use crate::{
    db::Store,
    models::{Error, Job, JobLock, JobRunStatus, JobType, WorkerOptions},
};

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Retrying,
    Failed,
    /// The lock was reclaimed while the handler ran; the terminal write was dropped.
    LockLost,
}

enum Failure {
    Handler(HandlerError),
    UnknownJobType(String),
}

impl Failure {
    fn message(&self) -> String {
        match self {
            Failure::Handler(err) => err.to_string(),
            Failure::UnknownJobType(job_type) => format!("no handler registered for job type '{job_type}'"),
        }
    }
}

/// Execution wrapper: owns every job and run write that follows a claim.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn Store>,
    registry: Arc<HandlerRegistry>,
    queue: JobQueue,
    options: WorkerOptions,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<HandlerRegistry>,
        queue: JobQueue,
        options: WorkerOptions,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            options,
        }
    }

    /// Runs a job claimed by this worker. Handler failures never escape.
    pub async fn run(&self, job: &Job) -> Result<RunOutcome, Error> {
        let lock = job.lock().ok_or(Error::JobNotLocked(job.id))?;
        let worker_id = lock.locked_by.as_str();
        info!(
            { worker_id, job_id = job.id, job_type = %job.job_type, attempts = job.attempts },
            "==> run"
        );
        let run_id = self.store.start_run(job.id).await?;
        let started = Instant::now();

        let job_type = job.job_type.parse::<JobType>().ok();
        let result = match job_type {
            Some(job_type) => self.invoke(job_type, job).await.map_err(Failure::Handler),
            None => Err(Failure::UnknownJobType(job.job_type.clone())),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(metrics) => {
                let metrics = with_duration(metrics, duration_ms);
                self.store
                    .finish_run(run_id, JobRunStatus::Succeeded, None, &metrics)
                    .await?;
                if !self.store.succeed(job.id, &lock).await? {
                    return Ok(self.lock_lost(job, &lock));
                }
                info!({ worker_id, job_id = job.id, duration_ms }, "==> succeeded");
                if let Some(job_type) = job_type {
                    self.reschedule(job_type, job).await;
                }
                Ok(RunOutcome::Succeeded)
            }
            Err(failure) => {
                let message = failure.message();
                let metrics = json!({ "duration_ms": duration_ms });
                self.store
                    .finish_run(run_id, JobRunStatus::Failed, Some(&message), &metrics)
                    .await?;
                self.on_failure(job, &lock, failure, &message).await
            }
        }
    }

    async fn invoke(&self, job_type: JobType, job: &Job) -> Result<Value, HandlerError> {
        let handler = self.registry.handler(job_type);
        match AssertUnwindSafe(handler.run(job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic))),
        }
    }

    async fn on_failure(
        &self,
        job: &Job,
        lock: &JobLock,
        failure: Failure,
        message: &str,
    ) -> Result<RunOutcome, Error> {
        let worker_id = lock.locked_by.as_str();
        let attempts = job.attempts + 1;
        let exhausted = attempts >= job.max_attempts;

        if let Failure::UnknownJobType(_) = failure {
            error!({ worker_id, job_id = job.id, job_type = %job.job_type }, "==> unknown job type, failing without retry");
        } else if !exhausted {
            let run_at = self.options.backoff.next_run_at(attempts, Utc::now());
            if !self.store.retry(job.id, lock, run_at, message).await? {
                return Ok(self.lock_lost(job, lock));
            }
            warn!({ worker_id, job_id = job.id, attempts, %run_at }, "==> retrying: {}", message);
            return Ok(RunOutcome::Retrying);
        }

        if !self.store.fail(job.id, lock, message).await? {
            return Ok(self.lock_lost(job, lock));
        }
        error!({ worker_id, job_id = job.id, attempts }, "==> failed: {}", message);
        Ok(RunOutcome::Failed)
    }

    async fn reschedule(&self, job_type: JobType, job: &Job) {
        let Some(after) = self.options.reschedule_after(job_type) else {
            return;
        };
        let run_at = chrono::Duration::from_std(after)
            .ok()
            .and_then(|after| Utc::now().checked_add_signed(after))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        match self
            .queue
            .schedule_unique(job_type, job.payload.clone(), Some(run_at))
            .await
        {
            Ok(Some(next_id)) => {
                debug!({ job_id = job.id, next_id, job_type = %job_type }, "==> rescheduled")
            }
            Ok(None) => {}
            Err(err) => {
                error!({ job_id = job.id, job_type = %job_type }, "reschedule error {:?}", err)
            }
        }
    }

    fn lock_lost(&self, job: &Job, lock: &JobLock) -> RunOutcome {
        warn!(
            { worker_id = lock.locked_by.as_str(), job_id = job.id },
            "==> lock lost before completion, result dropped"
        );
        RunOutcome::LockLost
    }
}

/// Handler metrics with the elapsed time added; non-object results are wrapped.
fn with_duration(metrics: Value, duration_ms: u64) -> Value {
    match metrics {
        Value::Object(mut map) => {
            map.insert("duration_ms".into(), duration_ms.into());
            Value::Object(map)
        }
        Value::Null => json!({ "duration_ms": duration_ms }),
        other => json!({ "result": other, "duration_ms": duration_ms }),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_owned();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_owned()
}

#[tokio::test]
async fn with_duration_merges_objects() -> anyhow::Result<()> {
    // act & assert
    assert_eq!(
        json!({ "rows": 10, "duration_ms": 5 }),
        with_duration(json!({ "rows": 10 }), 5)
    );
    assert_eq!(
        json!({ "result": [1, 2], "duration_ms": 5 }),
        with_duration(json!([1, 2]), 5)
    );
    assert_eq!(json!({ "duration_ms": 5 }), with_duration(Value::Null, 5));
    Ok(())
}
