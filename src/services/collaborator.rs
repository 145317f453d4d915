use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::Serialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::time;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use super::registry::{HandlerError, HandlerRegistry, JobHandler};
use crate::models::{CollaboratorOptions, Error, Job};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Longest slice of a failed response body kept in the error message.
const ERROR_BODY_LIMIT: usize = 512;

pub fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(HttpsConnector::new())
}

/// Registry posting every job type to its collaborator endpoint.
pub fn registry(options: &CollaboratorOptions) -> Result<HandlerRegistry, Error> {
    let client = http_client();
    HandlerRegistry::try_from_fn(|job_type| {
        let handler = HttpCollaborator::new(client.clone(), options.uri(job_type)?, options.timeout);
        Ok(Arc::new(handler) as Arc<dyn JobHandler>)
    })
}

#[derive(Serialize)]
struct CollaboratorRequest<'a> {
    job_id: i64,
    job_type: &'a str,
    attempts: i32,
    payload: &'a Value,
}

/// Hands a job to an external service over HTTP. The service owns the
/// typed parse of the payload; a 2xx JSON body becomes the run metrics.
#[derive(Clone)]
pub struct HttpCollaborator {
    client: HttpClient,
    uri: Uri,
    timeout: Option<Duration>,
}

impl HttpCollaborator {
    pub fn new(client: HttpClient, uri: Uri, timeout: Option<Duration>) -> Self {
        Self {
            client,
            uri,
            timeout,
        }
    }
}

#[async_trait]
impl JobHandler for HttpCollaborator {
    async fn run(&self, job: &Job) -> Result<Value, HandlerError> {
        let body = serde_json::to_vec(&CollaboratorRequest {
            job_id: job.id,
            job_type: &job.job_type,
            attempts: job.attempts,
            payload: &job.payload,
        })?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let future = self.client.request(req);
        // first '?' - timeout
        // second '?' - client error
        let response = match self.timeout {
            Some(timeout) => time::timeout(timeout, future).await??,
            None => future.await?,
        };
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        debug!({ job_id = job.id, status = status.as_u16() }, "collaborator response");

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            let text: String = text.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(HandlerError::Failed(format!(
                "collaborator responded {status}: {text}"
            )));
        }
        if bytes.is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, JobType};
    use axum::{http::StatusCode, routing::post, Json, Router};
    use chrono::Utc;
    use serde_json::json;
    use std::net::SocketAddr;

    async fn serve(app: Router) -> anyhow::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(addr)
    }

    fn job(payload: Value) -> Job {
        let now = Utc::now();
        Job {
            id: 42,
            job_type: JobType::Detect.as_str().into(),
            status: JobStatus::Running,
            payload,
            run_at: now,
            attempts: 1,
            max_attempts: 3,
            locked_by: Some("worker-a".into()),
            locked_at: Some(now),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn collaborator(addr: SocketAddr, timeout: Option<Duration>) -> anyhow::Result<HttpCollaborator> {
        let options = CollaboratorOptions {
            base_url: format!("http://{addr}"),
            timeout,
        };
        Ok(HttpCollaborator::new(http_client(), options.uri(JobType::Detect)?, timeout))
    }

    #[tokio::test]
    async fn posts_job_and_returns_response_json() -> anyhow::Result<()> {
        // arrange
        let app = Router::new().route(
            "/detect",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "seen_job_id": body["job_id"],
                    "seen_attempts": body["attempts"],
                    "signals": body["payload"]["scope"],
                }))
            }),
        );
        let addr = serve(app).await?;
        let handler = collaborator(addr, None)?;

        // act
        let metrics = handler.run(&job(json!({ "scope": "all" }))).await?;

        // assert
        assert_eq!(
            json!({ "seen_job_id": 42, "seen_attempts": 1, "signals": "all" }),
            metrics
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_body_is_empty_metrics() -> anyhow::Result<()> {
        // arrange
        let app = Router::new().route("/detect", post(|| async { StatusCode::NO_CONTENT }));
        let addr = serve(app).await?;
        let handler = collaborator(addr, None)?;

        // act
        let metrics = handler.run(&job(json!({}))).await?;

        // assert
        assert_eq!(json!({}), metrics);
        Ok(())
    }

    #[tokio::test]
    async fn error_status_is_handler_failure() -> anyhow::Result<()> {
        // arrange
        let app = Router::new().route(
            "/detect",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "missing workbook") }),
        );
        let addr = serve(app).await?;
        let handler = collaborator(addr, None)?;

        // act
        let res = handler.run(&job(json!({}))).await;

        // assert
        let err = res.expect_err("should fail");
        assert!(err.to_string().contains("422"));
        assert!(err.to_string().contains("missing workbook"));
        Ok(())
    }

    #[tokio::test]
    async fn slow_collaborator_times_out() -> anyhow::Result<()> {
        // arrange
        let app = Router::new().route(
            "/detect",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        );
        let addr = serve(app).await?;
        let handler = collaborator(addr, Some(Duration::from_millis(100)))?;

        // act
        let res = handler.run(&job(json!({}))).await;

        // assert
        assert!(matches!(res, Err(HandlerError::Timeout(_))));
        Ok(())
    }
}
