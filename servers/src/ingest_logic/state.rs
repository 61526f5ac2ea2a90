use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lib_common::pipeline::{
    AdmissionConflict, AdmissionGuard, BroadcastEnvelope, EventBus, NormalizerHandle, PushGateway,
    TaskDispatcher, TaskError,
};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

/// Shared handles for the HTTP and websocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<PushGateway>,
    pub bus: Arc<EventBus<BroadcastEnvelope>>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub admission: AdmissionGuard,
    pub normalizer: NormalizerHandle,
}

impl AppState {
    pub fn new(
        gateway: Arc<PushGateway>,
        bus: Arc<EventBus<BroadcastEnvelope>>,
        dispatcher: Arc<TaskDispatcher>,
        normalizer: NormalizerHandle,
    ) -> Self {
        Self {
            gateway,
            bus,
            dispatcher,
            admission: AdmissionGuard::new(),
            normalizer,
        }
    }
}

/// Errors surfaced by the HTTP API.
#[derive(Debug)]
pub enum AppError {
    /// The same request is still being processed.
    Duplicate(AdmissionConflict),
    /// A dispatched task failed.
    Task(TaskError),
    /// The request body could not be used.
    BadRequest(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Duplicate(e) => write!(f, "{}", e),
            AppError::Task(e) => write!(f, "{}", e),
            AppError::BadRequest(m) => write!(f, "bad request: {}", m),
        }
    }
}

impl std::error::Error for AppError {}

impl From<AdmissionConflict> for AppError {
    fn from(e: AdmissionConflict) -> Self {
        AppError::Duplicate(e)
    }
}

impl From<TaskError> for AppError {
    fn from(e: TaskError) -> Self {
        AppError::Task(e)
    }
}

impl From<JsonRejection> for AppError {
    fn from(e: JsonRejection) -> Self {
        AppError::BadRequest(e.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Duplicate(conflict) => {
                warn!(key = %conflict.key, "Duplicate request rejected");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    json!({
                        "error_type": "DuplicateRequest",
                        "message": "Request already in progress, please wait",
                        "detail": {
                            "key": conflict.key,
                            "startedAt": conflict.started_at.to_rfc3339(),
                        }
                    }),
                )
            }
            AppError::Task(TaskError::UnknownTask(name)) => (
                StatusCode::NOT_FOUND,
                json!({
                    "error_type": "UnknownTask",
                    "message": format!("No task named {}", name),
                    "detail": name,
                }),
            ),
            AppError::Task(TaskError::InvalidParams { task, message }) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error_type": "InvalidTaskParameters",
                    "message": message,
                    "detail": task,
                }),
            ),
            AppError::Task(TaskError::Query(e)) => {
                error!(query = %e.query, params = ?e.params, error = %e.message, "Query task failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error_type": "QueryError",
                        "message": e.message,
                        "detail": { "query": e.query, "params": e.params },
                    }),
                )
            }
            AppError::Task(TaskError::Failed { task, message }) => {
                error!(task = %task, error = %message, "Task failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error_type": "TaskFailed",
                        "message": message,
                        "detail": task,
                    }),
                )
            }
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error_type": "BadRequest",
                    "message": message,
                    "detail": null,
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}
