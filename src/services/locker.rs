use std::sync::Arc;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::{
    db::Store,
    models::{Error, Job},
};

/// Claims jobs for one worker identity.
#[derive(Clone)]
pub struct Locker {
    store: Arc<dyn Store>,
    worker_id: String,
}

impl Locker {
    pub fn new(store: Arc<dyn Store>, worker_id: String) -> Self {
        Self { store, worker_id }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// `Ok(None)` means another worker won the claim, which is a normal outcome.
    pub async fn claim(&self, job_id: i64) -> Result<Option<Job>, Error> {
        let job = self.store.claim(job_id, &self.worker_id).await?;
        match &job {
            Some(job) => debug!({ worker_id = %self.worker_id, job_id, attempts = job.attempts }, "claimed"),
            None => debug!({ worker_id = %self.worker_id, job_id }, "claim lost"),
        }
        Ok(job)
    }
}
