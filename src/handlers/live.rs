use crate::models::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use problemdetails::Problem;
use std::sync::Arc;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        format!(
            "deferq {} on {}. Use /api/v1/jobs to list jobs.",
            env!("CARGO_PKG_VERSION"),
            state.instance_id
        ),
    )
}

async fn live() -> impl IntoResponse {
    StatusCode::OK
}

/// Ready only while the job store answers; workers cannot claim otherwise.
async fn ready(State(state): State<Arc<AppState>>) -> Result<StatusCode, Problem> {
    if let Err(err) = state.store.ping().await {
        warn!({ instance_id = %state.instance_id }, "store not ready {}", err);
        return Err(problemdetails::new(StatusCode::SERVICE_UNAVAILABLE)
            .with_title(StatusCode::SERVICE_UNAVAILABLE.to_string())
            .with_detail(err.to_string()));
    }
    Ok(StatusCode::OK)
}
