use crate::models::{Error, JobRun, JobRunStatus};
use serde_json::Value;
use sqlx::{types::Json, Pool, Postgres};

pub async fn start(pool: &Pool<Postgres>, job_id: i64) -> Result<i64, Error> {
    const SQL: &str = "INSERT INTO job_runs (job_id, status) VALUES ($1, 'RUNNING') RETURNING id";
    let run_id = sqlx::query_scalar::<_, i64>(SQL)
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    Ok(run_id)
}

/// Terminal write, applied at most once per run.
pub async fn finish(
    pool: &Pool<Postgres>,
    run_id: i64,
    status: JobRunStatus,
    error_message: Option<&str>,
    metrics: &Value,
) -> Result<u64, Error> {
    const SQL: &str = "UPDATE job_runs
        SET status = $2, finished_at = now(), error_message = $3, metrics = $4
        WHERE id = $1 AND status = 'RUNNING'";
    let res = sqlx::query(SQL)
        .bind(run_id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(Json(metrics))
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn get_by_job_id(pool: &Pool<Postgres>, job_id: i64) -> Result<Vec<JobRun>, Error> {
    const SQL: &str = "SELECT * FROM job_runs WHERE job_id = $1 ORDER BY started_at DESC, id DESC";
    let runs = sqlx::query_as::<_, JobRun>(SQL)
        .bind(job_id)
        .fetch_all(pool)
        .await?;
    Ok(runs)
}
