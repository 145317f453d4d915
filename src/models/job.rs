use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Error;

/// Closed set of job types known to the handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Spreadsheet export rendering
    Export,
    /// Summary packet assembly
    Packet,
    /// Periodic staleness and governance detection sweep
    Detect,
    /// Outreach draft generation
    Draft,
    /// Documentation regeneration
    Docs,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::Export,
        JobType::Packet,
        JobType::Detect,
        JobType::Draft,
        JobType::Docs,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            JobType::Export => "EXPORT",
            JobType::Packet => "PACKET",
            JobType::Detect => "DETECT",
            JobType::Draft => "DRAFT",
            JobType::Docs => "DOCS",
        }
    }

    /// Path segment of the collaborator endpoint serving this type.
    pub const fn path(&self) -> &'static str {
        match self {
            JobType::Export => "export",
            JobType::Packet => "packet",
            JobType::Detect => "detect",
            JobType::Draft => "draft",
            JobType::Docs => "docs",
        }
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownJobType(s.to_owned()))
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Queued, running or waiting for a retry.
    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Running | JobStatus::Retrying
        )
    }

    /// Eligible for claiming once `run_at` has elapsed.
    pub const fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retrying)
    }
}

impl TryFrom<String> for JobStatus {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "RETRYING" => Ok(JobStatus::Retrying),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(Error::UnknownStatus(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobRunStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "RUNNING",
            JobRunStatus::Succeeded => "SUCCEEDED",
            JobRunStatus::Failed => "FAILED",
        }
    }
}

impl TryFrom<String> for JobRunStatus {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "RUNNING" => Ok(JobRunStatus::Running),
            "SUCCEEDED" => Ok(JobRunStatus::Succeeded),
            "FAILED" => Ok(JobRunStatus::Failed),
            _ => Err(Error::UnknownStatus(value)),
        }
    }
}

/// Persisted job record. `job_type` stays a plain tag here, it is parsed
/// into [`JobType`] only at dispatch.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Job {
    pub id: i64,
    pub job_type: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub payload: Value,
    pub run_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Lock held by the claiming worker, present only while RUNNING.
    pub fn lock(&self) -> Option<JobLock> {
        match (&self.locked_by, self.locked_at) {
            (Some(locked_by), Some(locked_at)) => Some(JobLock {
                locked_by: locked_by.clone(),
                locked_at,
            }),
            _ => None,
        }
    }
}

/// Identity of one claim. Every write after a claim is conditioned on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLock {
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: Value,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct JobRun {
    pub id: i64,
    pub job_id: i64,
    #[sqlx(try_from = "String")]
    pub status: JobRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metrics: Option<Value>,
}

/// A job with its execution history, newest run first.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub runs: Vec<JobRun>,
}

#[tokio::test]
async fn job_type_from_str() -> anyhow::Result<()> {
    // arrange
    let s = "DOCS";
    // act
    let job_type: JobType = s.parse()?;

    // assert
    assert_eq!(JobType::Docs, job_type);
    assert_eq!(s, job_type.to_string());
    Ok(())
}

#[tokio::test]
async fn job_type_from_str_err() -> anyhow::Result<()> {
    // arrange
    let s = "docs";
    // act
    let job_type: Result<JobType, _> = s.parse();

    // assert
    assert!(matches!(job_type, Err(Error::UnknownJobType(t)) if t == "docs"));
    Ok(())
}

#[tokio::test]
async fn job_status_pending() -> anyhow::Result<()> {
    // act & assert
    assert!(JobStatus::Queued.is_pending());
    assert!(JobStatus::Running.is_pending());
    assert!(JobStatus::Retrying.is_pending());
    assert!(!JobStatus::Succeeded.is_pending());
    assert!(!JobStatus::Failed.is_pending());
    assert!(!JobStatus::Running.is_claimable());
    Ok(())
}

#[tokio::test]
async fn job_status_try_from() -> anyhow::Result<()> {
    // act & assert
    assert_eq!(JobStatus::Retrying, JobStatus::try_from("RETRYING".to_owned())?);
    assert!(JobStatus::try_from("DONE".to_owned()).is_err());
    assert_eq!(JobRunStatus::Failed, JobRunStatus::try_from("FAILED".to_owned())?);
    Ok(())
}
