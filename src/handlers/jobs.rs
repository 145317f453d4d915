use super::{Paging, PagingResult};
use crate::models::{AppState, Error, JobDetail};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use problemdetails::Problem;
use std::sync::Arc;

const DEFAULT_LIMIT: i64 = 100;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/jobs", get(get_recent))
        .route("/jobs/:id", get(get_by_id))
        .with_state(state)
}

async fn get_recent(
    State(state): State<Arc<AppState>>,
    Query(pagination): Query<Paging>,
) -> Result<impl IntoResponse, Problem> {
    let limit = pagination.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = pagination.offset.unwrap_or(0);
    if limit < 0 {
        return Err(Error::InvalidParams("limit").into());
    }
    if offset < 0 {
        return Err(Error::InvalidParams("offset").into());
    }
    let data = state.store.get_recent(limit, offset).await?;
    Ok(Json(PagingResult {
        limit,
        offset,
        data,
    }))
}

async fn get_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, Problem> {
    let job = state
        .store
        .get_by_id(id)
        .await?
        .ok_or(Error::JobNotFound(id))?;
    let runs = state.store.get_runs(id).await?;
    Ok(Json(JobDetail { job, runs }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobRunStore, JobStore, MemStore, Store};
    use crate::models::{CollaboratorOptions, JobRunStatus, JobType, NewJob, WorkerOptions};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn state(store: Arc<dyn Store>) -> Arc<AppState> {
        Arc::new(AppState {
            instance_id: "test:1".into(),
            store,
            http_port: 0,
            worker_options: WorkerOptions::default(),
            collaborator_options: CollaboratorOptions {
                base_url: "http://127.0.0.1:8200".into(),
                timeout: None,
            },
            shutdown_token: CancellationToken::new(),
        })
    }

    async fn get(app: Router, uri: &str) -> anyhow::Result<(StatusCode, Value)> {
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty())?)
            .await?;
        let status = res.status();
        let bytes = res.into_body().collect().await?.to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, body))
    }

    async fn create(store: &MemStore, job_type: JobType) -> anyhow::Result<i64> {
        Ok(store
            .create(NewJob {
                job_type,
                payload: json!({ "ticket": 7 }),
                run_at: None,
                max_attempts: 3,
            })
            .await?)
    }

    #[tokio::test]
    async fn lists_recent_jobs_newest_first() -> anyhow::Result<()> {
        // arrange
        let store = Arc::new(MemStore::new());
        let first = create(&store, JobType::Export).await?;
        let second = create(&store, JobType::Docs).await?;
        let app = routes(state(store));

        // act
        let (status, body) = get(app, "/jobs").await?;

        // assert
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!(100), body["limit"]);
        assert_eq!(json!(0), body["offset"]);
        assert_eq!(json!(second), body["data"][0]["id"]);
        assert_eq!(json!(first), body["data"][1]["id"]);
        assert_eq!(json!("QUEUED"), body["data"][0]["status"]);
        Ok(())
    }

    #[tokio::test]
    async fn list_honors_limit_and_offset() -> anyhow::Result<()> {
        // arrange
        let store = Arc::new(MemStore::new());
        let first = create(&store, JobType::Export).await?;
        create(&store, JobType::Docs).await?;
        let app = routes(state(store));

        // act
        let (status, body) = get(app, "/jobs?limit=1&offset=1").await?;

        // assert
        assert_eq!(StatusCode::OK, status);
        assert_eq!(1, body["data"].as_array().map_or(0, Vec::len));
        assert_eq!(json!(first), body["data"][0]["id"]);
        Ok(())
    }

    #[tokio::test]
    async fn negative_limit_is_bad_request() -> anyhow::Result<()> {
        // arrange
        let app = routes(state(Arc::new(MemStore::new())));

        // act
        let (status, _) = get(app, "/jobs?limit=-1").await?;

        // assert
        assert_eq!(StatusCode::BAD_REQUEST, status);
        Ok(())
    }

    #[tokio::test]
    async fn job_detail_includes_runs() -> anyhow::Result<()> {
        // arrange
        let store = Arc::new(MemStore::new());
        let job_id = create(&store, JobType::Packet).await?;
        store.claim(job_id, "worker-a").await?;
        let run_id = store.start_run(job_id).await?;
        store
            .finish_run(run_id, JobRunStatus::Failed, Some("boom"), &json!({ "duration_ms": 3 }))
            .await?;
        let app = routes(state(store));

        // act
        let (status, body) = get(app, &format!("/jobs/{job_id}")).await?;

        // assert
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!(job_id), body["id"]);
        assert_eq!(json!("PACKET"), body["job_type"]);
        assert_eq!(json!("RUNNING"), body["status"]);
        assert_eq!(json!({ "ticket": 7 }), body["payload"]);
        assert_eq!(json!("FAILED"), body["runs"][0]["status"]);
        assert_eq!(json!("boom"), body["runs"][0]["error_message"]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() -> anyhow::Result<()> {
        // arrange
        let app = routes(state(Arc::new(MemStore::new())));

        // act
        let (status, _) = get(app, "/jobs/404").await?;

        // assert
        assert_eq!(StatusCode::NOT_FOUND, status);
        Ok(())
    }

    #[tokio::test]
    async fn ready_pings_the_store() -> anyhow::Result<()> {
        // arrange
        let app = crate::handlers::live::routes(state(Arc::new(MemStore::new())));

        // act
        let (status, _) = get(app, "/ready").await?;

        // assert
        assert_eq!(StatusCode::OK, status);
        Ok(())
    }

    #[tokio::test]
    async fn root_names_the_instance() -> anyhow::Result<()> {
        // arrange
        let app = crate::handlers::live::routes(state(Arc::new(MemStore::new())));

        // act
        let res = app
            .oneshot(Request::builder().uri("/").body(Body::empty())?)
            .await?;

        // assert
        assert_eq!(StatusCode::OK, res.status());
        let bytes = res.into_body().collect().await?.to_bytes();
        let text = String::from_utf8(bytes.to_vec())?;
        assert!(text.contains("test:1"));
        assert!(text.contains("/api/v1/jobs"));
        Ok(())
    }
}
