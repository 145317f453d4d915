use crate::db::ReclaimedJob;
use crate::models::{Error, Job, JobLock, JobType, NewJob};
use chrono::{DateTime, Utc};
use sqlx::{types::Json, Pool, Postgres};
use std::time::Duration;

pub async fn create(pool: &Pool<Postgres>, job: NewJob) -> Result<i64, Error> {
    const SQL: &str = "INSERT INTO jobs (job_type, payload, run_at, max_attempts)
        VALUES ($1, $2, COALESCE($3, now()), $4) RETURNING id";
    let job_id = sqlx::query_scalar::<_, i64>(SQL)
        .bind(job.job_type.as_str())
        .bind(Json(&job.payload))
        .bind(job.run_at)
        .bind(job.max_attempts)
        .fetch_one(pool)
        .await?;
    Ok(job_id)
}

pub async fn get_by_id(pool: &Pool<Postgres>, job_id: i64) -> Result<Option<Job>, Error> {
    const SQL: &str = "SELECT * FROM jobs WHERE id = $1";
    let job = sqlx::query_as::<_, Job>(SQL)
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

pub async fn get_recent(pool: &Pool<Postgres>, limit: i64, offset: i64) -> Result<Vec<Job>, Error> {
    const SQL: &str = "SELECT * FROM jobs ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2";
    let jobs = sqlx::query_as::<_, Job>(SQL)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    Ok(jobs)
}

pub async fn has_pending_by_type(pool: &Pool<Postgres>, job_type: JobType) -> Result<bool, Error> {
    const SQL: &str = "SELECT EXISTS (
        SELECT 1 FROM jobs WHERE job_type = $1 AND status IN ('QUEUED', 'RUNNING', 'RETRYING')
    )";
    let exists = sqlx::query_scalar::<_, bool>(SQL)
        .bind(job_type.as_str())
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

pub async fn fetch_due(pool: &Pool<Postgres>, limit: i64) -> Result<Vec<Job>, Error> {
    const SQL: &str = "SELECT * FROM jobs
        WHERE status IN ('QUEUED', 'RETRYING') AND run_at <= now()
        ORDER BY run_at, id LIMIT $1";
    let jobs = sqlx::query_as::<_, Job>(SQL)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(jobs)
}

/// Single conditional update; concurrent claimers serialize on the row lock
/// and the loser re-evaluates the predicate against the RUNNING row.
pub async fn claim(pool: &Pool<Postgres>, job_id: i64, worker_id: &str) -> Result<Option<Job>, Error> {
    const SQL: &str = "UPDATE jobs
        SET status = 'RUNNING', locked_by = $2, locked_at = now(), updated_at = now()
        WHERE id = $1 AND status IN ('QUEUED', 'RETRYING') AND run_at <= now()
        RETURNING *";
    let job = sqlx::query_as::<_, Job>(SQL)
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

pub async fn succeed(pool: &Pool<Postgres>, job_id: i64, lock: &JobLock) -> Result<u64, Error> {
    const SQL: &str = "UPDATE jobs
        SET status = 'SUCCEEDED', last_error = NULL, locked_by = NULL, locked_at = NULL, updated_at = now()
        WHERE id = $1 AND status = 'RUNNING' AND locked_by = $2 AND locked_at = $3";
    let res = sqlx::query(SQL)
        .bind(job_id)
        .bind(&lock.locked_by)
        .bind(lock.locked_at)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn retry(
    pool: &Pool<Postgres>,
    job_id: i64,
    lock: &JobLock,
    run_at: DateTime<Utc>,
    error: &str,
) -> Result<u64, Error> {
    const SQL: &str = "UPDATE jobs
        SET status = 'RETRYING', attempts = attempts + 1, run_at = $4, last_error = $5,
            locked_by = NULL, locked_at = NULL, updated_at = now()
        WHERE id = $1 AND status = 'RUNNING' AND locked_by = $2 AND locked_at = $3";
    let res = sqlx::query(SQL)
        .bind(job_id)
        .bind(&lock.locked_by)
        .bind(lock.locked_at)
        .bind(run_at)
        .bind(error)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn fail(pool: &Pool<Postgres>, job_id: i64, lock: &JobLock, error: &str) -> Result<u64, Error> {
    const SQL: &str = "UPDATE jobs
        SET status = 'FAILED', attempts = LEAST(attempts + 1, max_attempts), last_error = $4,
            locked_by = NULL, locked_at = NULL, updated_at = now()
        WHERE id = $1 AND status = 'RUNNING' AND locked_by = $2 AND locked_at = $3";
    let res = sqlx::query(SQL)
        .bind(job_id)
        .bind(&lock.locked_by)
        .bind(lock.locked_at)
        .bind(error)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// SKIP LOCKED keeps concurrent reclaimers off each other's rows; the outer
/// status check drops rows completed since the scan.
pub async fn reclaim_stale(
    pool: &Pool<Postgres>,
    stale_after: Duration,
    requeue_error: &str,
    fail_error: &str,
) -> Result<Vec<ReclaimedJob>, Error> {
    const SQL: &str = "WITH stale AS (
        SELECT id FROM jobs
        WHERE status = 'RUNNING' AND locked_at < now() - $1
        ORDER BY locked_at
        FOR UPDATE SKIP LOCKED
    )
    UPDATE jobs SET
        attempts = LEAST(jobs.attempts + 1, jobs.max_attempts),
        status = CASE WHEN jobs.attempts + 1 >= jobs.max_attempts THEN 'FAILED' ELSE 'QUEUED' END,
        run_at = CASE WHEN jobs.attempts + 1 >= jobs.max_attempts THEN jobs.run_at ELSE now() END,
        last_error = CASE WHEN jobs.attempts + 1 >= jobs.max_attempts THEN $3 ELSE $2 END,
        locked_by = NULL, locked_at = NULL, updated_at = now()
    FROM stale
    WHERE jobs.id = stale.id AND jobs.status = 'RUNNING'
    RETURNING jobs.id, jobs.status";
    let reclaimed = sqlx::query_as::<_, ReclaimedJob>(SQL)
        .bind(stale_after)
        .bind(requeue_error)
        .bind(fail_error)
        .fetch_all(pool)
        .await?;
    Ok(reclaimed)
}

pub async fn select_one(pool: &Pool<Postgres>) -> Result<(), Error> {
    _ = sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(())
}
