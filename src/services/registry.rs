use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::error::Elapsed;

use crate::models::{Error, Job, JobType};

/// Business logic bound to one job type. Handlers read the payload and do
/// their work; they never touch job or run records.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Returns handler metrics merged into the run record on success.
    async fn run(&self, job: &Job) -> Result<Value, HandlerError>;
}

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid payload - {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("timed out")]
    Timeout(#[from] Elapsed),

    #[error(transparent)]
    HttpError(#[from] hyper::http::Error),

    #[error(transparent)]
    HyperError(#[from] hyper::Error),

    #[error(transparent)]
    HyperClientError(#[from] hyper_util::client::legacy::Error),

    #[error("handler panicked - {0}")]
    Panicked(String),
}

/// One handler per [`JobType`]; dispatch is an exhaustive match.
#[derive(Clone)]
pub struct HandlerRegistry {
    export: Arc<dyn JobHandler>,
    packet: Arc<dyn JobHandler>,
    detect: Arc<dyn JobHandler>,
    draft: Arc<dyn JobHandler>,
    docs: Arc<dyn JobHandler>,
}

impl HandlerRegistry {
    pub fn try_from_fn<F>(mut f: F) -> Result<Self, Error>
    where
        F: FnMut(JobType) -> Result<Arc<dyn JobHandler>, Error>,
    {
        Ok(HandlerRegistry {
            export: f(JobType::Export)?,
            packet: f(JobType::Packet)?,
            detect: f(JobType::Detect)?,
            draft: f(JobType::Draft)?,
            docs: f(JobType::Docs)?,
        })
    }

    pub fn handler(&self, job_type: JobType) -> &dyn JobHandler {
        match job_type {
            JobType::Export => self.export.as_ref(),
            JobType::Packet => self.packet.as_ref(),
            JobType::Detect => self.detect.as_ref(),
            JobType::Draft => self.draft.as_ref(),
            JobType::Docs => self.docs.as_ref(),
        }
    }
}
