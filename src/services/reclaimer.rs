use std::{sync::Arc, time::Duration};
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::{
    db::Store,
    models::{Error, JobStatus},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub requeued: usize,
    pub failed: usize,
}

impl ReclaimReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Recovers jobs whose worker stopped making progress. The age of the lock
/// is the only liveness signal.
#[derive(Clone)]
pub struct StaleLockReclaimer {
    store: Arc<dyn Store>,
    stale_after: Duration,
}

impl StaleLockReclaimer {
    pub fn new(store: Arc<dyn Store>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub async fn run(&self) -> Result<ReclaimReport, Error> {
        let secs = self.stale_after.as_secs();
        let requeue_error = format!("stale lock reclaimed after {secs}s without completion");
        let fail_error = format!("stale lock reclaimed after {secs}s without completion, attempts exhausted");
        let reclaimed = self
            .store
            .reclaim_stale(self.stale_after, &requeue_error, &fail_error)
            .await?;

        let mut report = ReclaimReport::default();
        for job in reclaimed {
            match job.status {
                JobStatus::Failed => {
                    report.failed += 1;
                    error!({ job_id = job.id, status = job.status.as_str() }, "stale lock, attempts exhausted");
                }
                _ => {
                    report.requeued += 1;
                    warn!({ job_id = job.id, status = job.status.as_str() }, "stale lock, requeued");
                }
            }
        }
        Ok(report)
    }
}
