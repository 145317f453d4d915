pub use backoff::Backoff;
pub use error::Error;
pub use job::Job;
pub use job::JobDetail;
pub use job::JobLock;
pub use job::JobRun;
pub use job::JobRunStatus;
pub use job::JobStatus;
pub use job::JobType;
pub use job::NewJob;
pub use state::AppState;
pub use state::CollaboratorOptions;
pub use state::WorkerOptions;

mod backoff;
mod error;
mod job;
mod state;
