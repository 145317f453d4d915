use dotenv::dotenv;
use hyper::Uri;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use super::{Backoff, Error, JobType};
use crate::{
    db::{MemStore, PgStore, Store},
    flags,
};

/// Ten years; keeps the next periodic run inside the timestamp range of the store.
const MAX_DETECT_INTERVAL: Duration = Duration::from_secs(10 * 366 * 24 * 60 * 60);

pub struct AppState {
    pub instance_id: String,
    pub store: Arc<dyn Store>,
    pub http_port: u16,
    pub worker_options: WorkerOptions,
    pub collaborator_options: CollaboratorOptions,
    pub shutdown_token: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub workers_count: usize,
    pub poll_interval: Duration,
    /// Due jobs fetched per tick.
    pub batch_size: i64,
    /// Lock age after which a RUNNING job is presumed abandoned.
    pub stale_after: Duration,
    pub backoff: Backoff,
    pub max_attempts: i32,
    pub detect_interval: Duration,
}

impl WorkerOptions {
    /// Delay before a succeeded job of a periodic type runs again.
    pub fn reschedule_after(&self, job_type: JobType) -> Option<Duration> {
        match job_type {
            JobType::Detect => Some(self.detect_interval),
            JobType::Export | JobType::Packet | JobType::Draft | JobType::Docs => None,
        }
    }

    fn from_env() -> Result<Self, Error> {
        let defaults = WorkerOptions::default();
        WorkerOptions {
            workers_count: env_or("WORKER_COUNT", defaults.workers_count)?,
            poll_interval: Duration::from_millis(env_or("WORKER_POLL_INTERVAL_MS", 5000)?),
            batch_size: env_or("WORKER_BATCH_SIZE", defaults.batch_size)?,
            stale_after: Duration::from_secs(env_or("WORKER_STALE_LOCK_SECS", 600)?),
            backoff: Backoff::new(Duration::from_secs(env_or("WORKER_BACKOFF_BASE_SECS", 60)?)),
            max_attempts: env_or("JOB_MAX_ATTEMPTS", defaults.max_attempts)?,
            detect_interval: Duration::from_secs(env_or("DETECT_INTERVAL_SECS", 86_400)?),
        }
        .validate()
    }

    /// Rejects values the worker loop cannot run with.
    pub fn validate(self) -> Result<Self, Error> {
        if self.workers_count < 1 {
            return Err(Error::Config("WORKER_COUNT must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("WORKER_POLL_INTERVAL_MS must be at least 1".into()));
        }
        if self.batch_size < 1 {
            return Err(Error::Config("WORKER_BATCH_SIZE must be at least 1".into()));
        }
        if self.stale_after.is_zero() {
            return Err(Error::Config("WORKER_STALE_LOCK_SECS must be at least 1".into()));
        }
        // retry exponents run up to max_attempts - 1 and must not pass the backoff cap
        let max_allowed = Backoff::MAX_EXPONENT as i32 + 1;
        if !(1..=max_allowed).contains(&self.max_attempts) {
            return Err(Error::Config(format!(
                "JOB_MAX_ATTEMPTS must be between 1 and {max_allowed}"
            )));
        }
        if self.detect_interval.is_zero() || self.detect_interval > MAX_DETECT_INTERVAL {
            return Err(Error::Config(format!(
                "DETECT_INTERVAL_SECS must be between 1 and {}",
                MAX_DETECT_INTERVAL.as_secs()
            )));
        }
        Ok(self)
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            workers_count: 1,
            poll_interval: Duration::from_secs(5),
            batch_size: 5,
            stale_after: Duration::from_secs(10 * 60),
            backoff: Backoff::default(),
            max_attempts: 3,
            detect_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollaboratorOptions {
    pub base_url: String,
    pub timeout: Option<Duration>,
}

impl CollaboratorOptions {
    /// Endpoint receiving jobs of the given type.
    pub fn uri(&self, job_type: JobType) -> Result<Uri, Error> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), job_type.path());
        Uri::try_from(url.as_str()).map_err(|_| Error::InvalidUrl)
    }

    fn from_env() -> Result<Self, Error> {
        let base_url = std::env::var("COLLABORATOR_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8200".to_owned());
        let timeout = match std::env::var("COLLABORATOR_TIMEOUT_MS") {
            Ok(ms) => Some(Duration::from_millis(parse_env("COLLABORATOR_TIMEOUT_MS", &ms)?)),
            Err(_) => None,
        };
        Ok(CollaboratorOptions { base_url, timeout })
    }
}

impl AppState {
    pub async fn new(flags: &flags::Deferq) -> Result<Arc<AppState>, Error> {
        dotenv().ok();
        let hostname = whoami::hostname();
        let instance_id = format!("{}:{}", hostname, std::process::id());

        let mut worker_options = WorkerOptions::from_env()?;
        if let Some(workers) = flags.workers {
            worker_options.workers_count = workers;
            worker_options = worker_options.validate()?;
        }
        let http_port = match flags.port {
            Some(port) => port,
            None => env_or("HTTP_PORT", 8102)?,
        };

        let store: Arc<dyn Store> = if flags.memory {
            warn!({ instance_id = %instance_id }, "using in-memory store, jobs are not shared between processes");
            Arc::new(MemStore::new())
        } else {
            let db_url = std::env::var("DATABASE_URL")
                .map_err(|_| Error::Config("DATABASE_URL must be set".into()))?;
            let conn = PgConnectOptions::from_str(&db_url)?.application_name(&instance_id);
            let pool = PgPoolOptions::new()
                .max_connections(16)
                .connect_with(conn)
                .await?;
            let store = PgStore::new(pool);
            store.migrate().await?;
            Arc::new(store)
        };

        let state = AppState {
            instance_id,
            store,
            http_port,
            worker_options,
            collaborator_options: CollaboratorOptions::from_env()?,
            shutdown_token: CancellationToken::new(),
        };
        Ok(Arc::new(state))
    }
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, Error> {
    match std::env::var(key) {
        Ok(value) => parse_env(key, &value),
        Err(_) => Ok(default),
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} has invalid value '{value}'")))
}

#[tokio::test]
async fn collaborator_uri_joins_type_path() -> anyhow::Result<()> {
    // arrange
    let options = CollaboratorOptions {
        base_url: "http://collab.local:8200/jobs/".into(),
        timeout: None,
    };

    // act
    let uri = options.uri(JobType::Docs)?;

    // assert
    assert_eq!("http://collab.local:8200/jobs/docs", uri.to_string());
    Ok(())
}

#[tokio::test]
async fn worker_options_only_detect_reschedules() -> anyhow::Result<()> {
    // arrange
    let options = WorkerOptions::default();

    // act & assert
    assert_eq!(Some(Duration::from_secs(86_400)), options.reschedule_after(JobType::Detect));
    assert_eq!(None, options.reschedule_after(JobType::Docs));
    Ok(())
}

#[tokio::test]
async fn parse_env_reports_key() -> anyhow::Result<()> {
    // act
    let res: Result<u64, _> = parse_env("WORKER_BATCH_SIZE", "five");

    // assert
    assert!(matches!(res, Err(Error::Config(msg)) if msg.contains("WORKER_BATCH_SIZE")));
    Ok(())
}

#[tokio::test]
async fn zero_poll_interval_is_config_error() -> anyhow::Result<()> {
    // arrange
    let options = WorkerOptions {
        poll_interval: Duration::ZERO,
        ..WorkerOptions::default()
    };

    // act
    let res = options.validate();

    // assert
    assert!(matches!(res, Err(Error::Config(msg)) if msg.contains("WORKER_POLL_INTERVAL_MS")));
    Ok(())
}

#[tokio::test]
async fn validate_rejects_out_of_range_options() -> anyhow::Result<()> {
    // arrange
    let defaults = WorkerOptions::default();
    let cases = [
        ("WORKER_COUNT", WorkerOptions { workers_count: 0, ..defaults.clone() }),
        ("WORKER_BATCH_SIZE", WorkerOptions { batch_size: 0, ..defaults.clone() }),
        ("WORKER_STALE_LOCK_SECS", WorkerOptions { stale_after: Duration::ZERO, ..defaults.clone() }),
        ("JOB_MAX_ATTEMPTS", WorkerOptions { max_attempts: 0, ..defaults.clone() }),
        ("JOB_MAX_ATTEMPTS", WorkerOptions { max_attempts: 22, ..defaults.clone() }),
        ("DETECT_INTERVAL_SECS", WorkerOptions { detect_interval: Duration::MAX, ..defaults.clone() }),
    ];

    // act & assert
    for (key, options) in cases {
        let res = options.validate();
        assert!(matches!(res, Err(Error::Config(ref msg)) if msg.contains(key)), "{key}");
    }
    assert!(defaults.clone().validate().is_ok());
    assert!(WorkerOptions { max_attempts: 21, ..defaults }.validate().is_ok());
    Ok(())
}
