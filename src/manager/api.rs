use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use super::Manager;
use crate::task::{State as TaskState, TaskEvent};
use crate::worker::ApiErrorResponse;

/// The user-facing control plane.
pub struct ManagerApi {
    manager: Arc<Manager>,
    address: String,
    port: u16,
}

impl ManagerApi {
    pub fn new(manager: Arc<Manager>, address: &str, port: u16) -> Self {
        ManagerApi {
            manager,
            address: address.to_string(),
            port,
        }
    }

    pub fn router(manager: Arc<Manager>) -> Router {
        Router::new()
            .route("/tasks", post(start_task).get(get_tasks))
            .route("/tasks/{task_id}", delete(stop_task))
            .with_state(manager)
    }

    pub async fn start(self) -> std::io::Result<()> {
        let app = Self::router(self.manager.clone());
        let listener = TcpListener::bind((self.address.as_str(), self.port)).await?;
        info!(address = %self.address, port = self.port, "manager api listening");
        axum::serve(listener, app).await
    }
}

async fn start_task(
    State(manager): State<Arc<Manager>>,
    payload: Result<Json<TaskEvent>, JsonRejection>,
) -> Response {
    let Json(event) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            let message = format!("failed to decode task event: {rejection}");
            error!(%message);
            return ApiErrorResponse::new(StatusCode::BAD_REQUEST, message).into_response();
        }
    };

    let task = event.task.clone();
    manager.add_task(event);
    (StatusCode::CREATED, Json(task)).into_response()
}

async fn get_tasks(State(manager): State<Arc<Manager>>) -> Response {
    (StatusCode::OK, Json(manager.get_tasks())).into_response()
}

async fn stop_task(State(manager): State<Arc<Manager>>, Path(task_id): Path<String>) -> Response {
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

    let task = match manager.task(&task_id) {
        Ok(task) => task,
        Err(err) => {
            return ApiErrorResponse::new(StatusCode::NOT_FOUND, err.to_string()).into_response();
        }
    };

    let event = TaskEvent {
        id: Uuid::new_v4(),
        state: TaskState::Complete,
        task,
        timestamp: Some(Utc::now()),
    };
    manager.add_task(event);

    info!(%task_id, "task queued for stopping");
    StatusCode::NO_CONTENT.into_response()
}
