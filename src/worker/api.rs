use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use super::Worker;
use crate::task::{State as TaskState, TaskEvent};

/// Error body returned with 4xx/5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub http_status_code: u16,
    pub message: String,
}

impl ApiErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(ApiErrorResponse {
                http_status_code: status.as_u16(),
                message: message.into(),
            }),
        )
    }
}

/// Exposes a worker's core functionality to the manager.
pub struct WorkerApi {
    worker: Arc<Worker>,
    address: String,
    port: u16,
}

impl WorkerApi {
    pub fn new(worker: Arc<Worker>, address: &str, port: u16) -> Self {
        WorkerApi {
            worker,
            address: address.to_string(),
            port,
        }
    }

    pub fn router(worker: Arc<Worker>) -> Router {
        Router::new()
            .route("/tasks", post(start_task).get(get_tasks))
            .route("/tasks/{task_id}", delete(stop_task))
            .route("/tasks/{task_id}/inspect", get(inspect_task))
            .route("/stats", get(get_stats))
            .with_state(worker)
    }

    pub async fn start(self) -> std::io::Result<()> {
        let app = Self::router(self.worker.clone());
        let listener = TcpListener::bind((self.address.as_str(), self.port)).await?;
        info!(worker = %self.worker.name, address = %self.address, port = self.port, "worker api listening");
        axum::serve(listener, app).await
    }
}

async fn start_task(
    State(worker): State<Arc<Worker>>,
    payload: Result<Json<TaskEvent>, JsonRejection>,
) -> Response {
    let Json(event) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            let message = format!("failed to decode task event: {rejection}");
            error!(worker = %worker.name, %message);
            return ApiErrorResponse::new(StatusCode::BAD_REQUEST, message).into_response();
        }
    };

    worker.add_task(event.task.clone());
    info!(worker = %worker.name, task_id = %event.task.id, "task queued");
    (StatusCode::CREATED, Json(event.task)).into_response()
}

async fn get_tasks(State(worker): State<Arc<Worker>>) -> Response {
    (StatusCode::OK, Json(worker.get_tasks())).into_response()
}

async fn stop_task(State(worker): State<Arc<Worker>>, Path(task_id): Path<String>) -> Response {
    let task_id = match Uuid::parse_str(&task_id) {
        Ok(id) => id,
        Err(err) => {
            return ApiErrorResponse::new(
                StatusCode::BAD_REQUEST,
                format!("malformed task id {task_id}: {err}"),
            )
            .into_response();
        }
    };

    let task = match worker.task(&task_id) {
        Ok(task) => task,
        Err(err) => {
            return ApiErrorResponse::new(StatusCode::NOT_FOUND, err.to_string()).into_response();
        }
    };

    let mut stopping = task;
    stopping.state = TaskState::Complete;
    worker.add_task(stopping);

    info!(worker = %worker.name, %task_id, "task queued for stopping");
    StatusCode::NO_CONTENT.into_response()
}

async fn get_stats(State(worker): State<Arc<Worker>>) -> Response {
    (StatusCode::OK, Json(worker.stats())).into_response()
}

async fn inspect_task(State(worker): State<Arc<Worker>>, Path(task_id): Path<String>) -> Response {
    let task_id = match Uuid::parse_str(&task_id) {
        Ok(id) => id,
        Err(err) => {
            return ApiErrorResponse::new(
                StatusCode::BAD_REQUEST,
                format!("malformed task id {task_id}: {err}"),
            )
            .into_response();
        }
    };

    let task = match worker.task(&task_id) {
        Ok(task) => task,
        Err(err) => {
            return ApiErrorResponse::new(StatusCode::NOT_FOUND, err.to_string()).into_response();
        }
    };

    match worker.inspect_task(&task).await {
        Ok(container) => (StatusCode::OK, Json(container)).into_response(),
        Err(err) => {
            error!(worker = %worker.name, %task_id, error = %err, "failed to inspect task");
            ApiErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                .into_response()
        }
    }
}
