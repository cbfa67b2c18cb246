//! Axum HTTP surface: admission endpoint, pipeline trigger and job queue.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prisradar_core::{cache_key_for, JobTask};
use prisradar_pipeline::{maybe_build_scheduler, PipelineConfig, RunOptions, Services};
use prisradar_storage::AdmissionRequest;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "prisradar-web";

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    #[serde(flatten)]
    pub task: JobTask,
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub use_cache: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DrainRequest {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct RunResponse<T: Serialize> {
    success: bool,
    summary: T,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/budget", post(budget_handler))
        .route("/run", post(run_handler))
        .route("/jobs", post(enqueue_handler))
        .route("/jobs/drain", post(drain_handler))
        .with_state(Arc::new(state))
}

/// Serves the API and, when enabled, the cron scheduler alongside it.
pub async fn serve(services: Services) -> anyhow::Result<()> {
    let port = services.config.web_port;
    let scheduler = maybe_build_scheduler(
        &services.config,
        services.pipeline.clone(),
        services.queue.clone(),
    )
    .await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!("scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(services))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let services = Services::from_config(PipelineConfig::from_env()).await?;
    serve(services).await
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn budget_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<AdmissionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match state.services.allocator.handle(request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            warn!(error = %err, "admission request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn run_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let options: RunOptions = match optional_json(&body) {
        Ok(options) => options,
        Err(response) => return response,
    };
    match state.services.pipeline.run(options).await {
        Ok(summary) => Json(RunResponse {
            success: true,
            summary,
        })
        .into_response(),
        Err(err) => {
            warn!(error = %err, "pipeline run could not start");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
        }
    }
}

async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let cache_key = match (request.cache_key, request.use_cache) {
        (Some(key), _) => Some(key),
        (None, true) => match cache_key_for(&request.task) {
            Ok(key) => Some(key),
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
        },
        (None, false) => None,
    };
    match state.services.queue.enqueue(request.task, cache_key).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn drain_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: DrainRequest = match optional_json(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let limit = request.limit.unwrap_or(state.services.config.drain_limit);
    match state.services.queue.drain(limit).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// An empty body means all defaults.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| error_response(StatusCode::BAD_REQUEST, err.to_string()))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}
