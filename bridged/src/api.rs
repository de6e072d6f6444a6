use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
};
use common::WorkerSettings;
use libsupervisor::{Supervisor, SupervisorError};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Body of every control api response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReply {
    pub success: bool,
    pub message: String,
    pub pid: Option<u32>,
}

type Reply = (StatusCode, Json<OperationReply>);

pub fn router(supervisor: Supervisor) -> Router {
    Router::new()
        .route("/users/{user_id}/start", post(start_worker))
        .route("/users/{user_id}/stop", post(stop_worker))
        .route("/users/{user_id}/restart", post(restart_worker))
        .route("/users/{user_id}/status", get(worker_status))
        .route("/users/{user_id}", patch(update_worker).delete(destroy_worker))
        .with_state(supervisor)
}

fn ok(message: impl Into<String>, pid: Option<u32>) -> Reply {
    (
        StatusCode::OK,
        Json(OperationReply {
            success: true,
            message: message.into(),
            pid,
        }),
    )
}

fn failed(user_id: &str, e: SupervisorError) -> Reply {
    let status = if e.is_user_error() {
        StatusCode::BAD_REQUEST
    } else if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warn!(user_id, "request failed: {e}");
    (
        status,
        Json(OperationReply {
            success: false,
            message: e.to_string(),
            pid: None,
        }),
    )
}

async fn start_worker(State(supervisor): State<Supervisor>, Path(user_id): Path<String>) -> Reply {
    match supervisor.start(&user_id).await {
        Ok(pid) => ok(format!("worker started with pid {pid}"), Some(pid)),
        Err(e) => failed(&user_id, e),
    }
}

async fn stop_worker(State(supervisor): State<Supervisor>, Path(user_id): Path<String>) -> Reply {
    match supervisor.stop(&user_id).await {
        Ok(()) => ok("worker stopped", None),
        Err(e) => failed(&user_id, e),
    }
}

async fn restart_worker(
    State(supervisor): State<Supervisor>,
    Path(user_id): Path<String>,
) -> Reply {
    match supervisor.restart(&user_id).await {
        Ok(Some(pid)) => ok(format!("worker restarted with pid {pid}"), Some(pid)),
        Ok(None) => ok("worker not running, nothing to restart", None),
        Err(e) => failed(&user_id, e),
    }
}

async fn update_worker(
    State(supervisor): State<Supervisor>,
    Path(user_id): Path<String>,
    Json(settings): Json<WorkerSettings>,
) -> Reply {
    match supervisor.update(&user_id, &settings).await {
        Ok(Some(pid)) => ok(
            format!("settings saved, worker restarted with pid {pid}"),
            Some(pid),
        ),
        Ok(None) => ok("settings saved", None),
        Err(e) => failed(&user_id, e),
    }
}

async fn destroy_worker(
    State(supervisor): State<Supervisor>,
    Path(user_id): Path<String>,
) -> Reply {
    match supervisor.destroy(&user_id).await {
        Ok(()) => ok("user removed", None),
        Err(e) => failed(&user_id, e),
    }
}

async fn worker_status(State(supervisor): State<Supervisor>, Path(user_id): Path<String>) -> Reply {
    match supervisor.record(&user_id).await {
        Ok(record) => {
            let pid = supervisor.worker_pid(&user_id).await;
            ok(record.status.to_string(), pid)
        }
        Err(e) => failed(&user_id, e),
    }
}
