//! The detached-job HTTP service.
//!
//! Runs on the provisioned VM, all routes under `/cofii/detached/`:
//!
//! | Method | Path | Semantics |
//! |---|---|---|
//! | POST | `/run` | Accept a job, return `{id}` |
//! | POST | `/job/{id}/wait` | Block until the job finishes |
//! | GET  | `/job/{id}/status` | `starting` / `running` / `done` / `failed` |
//! | GET  | `/job/{id}/stdout` | Raw captured stdout |
//! | GET  | `/job/{id}/stderr` | Raw captured stderr |
//! | GET  | `/ping` | Liveness probe |
//! | GET  | `/vm` | VM self-identity |
//!
//! Client mistakes (missing code, unknown id) are 4xx with a
//! diagnostic; server faults are 5xx.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use azgrid_core::DetachedVm;

use crate::error::DetachedResult;
use crate::registry::{JobRegistry, JobState};
use crate::runner::numbered_listing;

/// Shared state for the service handlers.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<JobRegistry>,
    /// Identity of the VM hosting this service.
    pub vm: DetachedVm,
    /// Self-termination requests (`persist == false` jobs) land here;
    /// the daemon deletes the VM through the Azure API.
    pub terminate: mpsc::Sender<()>,
}

/// Build the service router.
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/cofii/detached/run", post(run_job))
        .route("/cofii/detached/job/{id}/wait", post(wait_job))
        .route("/cofii/detached/job/{id}/status", get(job_status))
        .route("/cofii/detached/job/{id}/stdout", get(job_stdout))
        .route("/cofii/detached/job/{id}/stderr", get(job_stderr))
        .route("/cofii/detached/ping", get(ping))
        .route("/cofii/detached/vm", get(vm_identity))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: ServerState, bind: SocketAddr) -> DetachedResult<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %bind, "detached service listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

#[derive(serde::Deserialize)]
struct RunRequest {
    code: Option<String>,
    /// Keep the VM after the job completes. Absent means keep.
    #[serde(default = "default_persist")]
    persist: bool,
    variablebundle: Option<String>,
}

fn default_persist() -> bool {
    true
}

async fn run_job(
    State(state): State<ServerState>,
    Json(request): Json<RunRequest>,
) -> impl IntoResponse {
    let Some(code) = request.code.filter(|c| !c.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "request has no code").into_response();
    };

    if let Some(bundle) = &request.variablebundle {
        match decode_bundle(bundle) {
            Ok(variables) => {
                if let Err(e) = state.registry.merge_variables(variables) {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("cannot store variable bundle: {e}"),
                    )
                        .into_response();
                }
            }
            Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
        }
    }

    let job = match state.registry.submit(&code).await {
        Ok(job) => job,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("cannot start job: {e}"))
                .into_response()
        }
    };

    if !request.persist {
        let terminate = state.terminate.clone();
        let watched = Arc::clone(&job);
        tokio::spawn(async move {
            watched.wait().await;
            info!(job = watched.id, "non-persistent job finished, requesting vm deletion");
            if terminate.send(()).await.is_err() {
                warn!("nobody is listening for termination requests");
            }
        });
    }

    Json(json!({"id": job.id.to_string()})).into_response()
}

fn decode_bundle(bundle: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    let bytes = STANDARD
        .decode(bundle)
        .map_err(|e| format!("variablebundle is not base64: {e}"))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| format!("variablebundle is not json: {e}"))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err("variablebundle must be a json object".to_string()),
    }
}

async fn wait_job(State(state): State<ServerState>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(job) = state.registry.get(&id) else {
        return not_found(&id);
    };
    match job.wait().await {
        JobState::Failed(message) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": message,
                "code": numbered_listing(&job.code),
            })),
        )
            .into_response(),
        _ => Json(json!({"status": "done"})).into_response(),
    }
}

async fn job_status(State(state): State<ServerState>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(job) = state.registry.get(&id) else {
        return not_found(&id);
    };
    Json(json!({"status": job.state().label()})).into_response()
}

async fn job_stdout(State(state): State<ServerState>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(job) = state.registry.get(&id) else {
        return not_found(&id);
    };
    let out = std::fs::read_to_string(&job.stdout_path).unwrap_or_default();
    (StatusCode::OK, out).into_response()
}

async fn job_stderr(State(state): State<ServerState>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(job) = state.registry.get(&id) else {
        return not_found(&id);
    };
    let err = std::fs::read_to_string(&job.stderr_path).unwrap_or_default();
    (StatusCode::OK, err).into_response()
}

async fn ping() -> &'static str {
    "OK"
}

async fn vm_identity(State(state): State<ServerState>) -> Json<DetachedVm> {
    Json(state.vm.clone())
}

fn not_found(id: &str) -> axum::response::Response {
    (StatusCode::NOT_FOUND, format!("no job with id {id}")).into_response()
}
