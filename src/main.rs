use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use models::{AppState, Error, JobType};
use serde_json::json;
use services::{collaborator, JobQueue, Worker};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod db;
mod handlers;
mod models;
mod services;

mod flags {
    xflags::xflags! {
        /// Background job queue and worker engine.
        cmd deferq {
            /// Keep jobs in process memory instead of Postgres.
            optional --memory
            /// Port of the read API.
            optional -p, --port port: u16
            /// Number of polling workers in this process.
            optional -w, --workers workers: usize
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deferq=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let flags = flags::Deferq::from_env_or_exit();
    if let Err(err) = run(&flags).await {
        tracing::error!("fatal {}", err);
        std::process::exit(1);
    }
    tracing::info!("->> SHUTDOWN")
}

async fn run(flags: &flags::Deferq) -> Result<(), Error> {
    let state = AppState::new(flags).await?;
    let options = state.worker_options.clone();
    let registry = Arc::new(collaborator::registry(&state.collaborator_options)?);
    let queue = JobQueue::new(Arc::clone(&state.store), options.max_attempts);

    if let Some(job_id) = queue
        .schedule_unique(JobType::Detect, json!({}), None)
        .await?
    {
        tracing::info!({ job_id }, "seeded periodic {}", JobType::Detect);
    }

    let workers: Vec<Arc<Worker>> = (0..options.workers_count)
        .map(|_| {
            Arc::new(Worker::new(
                Worker::generate_id(),
                Arc::clone(&state.store),
                Arc::clone(&registry),
                queue.clone(),
                options.clone(),
            ))
        })
        .collect();
    for worker in &workers {
        worker.start();
    }
    tracing::info!({ instance_id = %state.instance_id, workers = workers.len() }, "workers started");

    let res = start_http_server(&state).await;
    for worker in &workers {
        worker.stop().await;
    }
    res
}

async fn start_http_server(state: &Arc<AppState>) -> Result<(), Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.http_port));
    let app = Router::new()
        .merge(handlers::live::routes(Arc::clone(state)))
        .nest("/api/v1", handlers::jobs::routes(Arc::clone(state)))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(state)))
        .await?;
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install signal handler {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = state.shutdown_token.cancelled() => {},
    }
    state.shutdown_token.cancel();
    tracing::warn!("signal received, starting graceful shutdown");
}
