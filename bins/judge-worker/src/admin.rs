// Admin HTTP surface: read-only views of the node plus task cancellation
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::LanguageRegistry;
use crate::scheduler::{Scheduler, SchedulerError};

pub struct AdminState {
    pub scheduler: Arc<Scheduler>,
    pub registry: LanguageRegistry,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/queue", get(get_queue))
        .route("/languages", get(list_languages))
        .route("/tasks/:task_id", get(get_task).delete(cancel_task))
        .route("/submissions/:submission_id", get(get_submission))
        .with_state(state)
}

fn not_found(what: String) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": what }))).into_response()
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /stats - scheduler counters
pub async fn get_stats(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.scheduler.stats()))
}

/// GET /queue - pending tasks in dispatch order
pub async fn get_queue(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.scheduler.queue_status()))
}

/// GET /languages
pub async fn list_languages(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.registry.describe()))
}

/// GET /tasks/{task_id}
pub async fn get_task(State(state): State<Arc<AdminState>>, Path(task_id): Path<String>) -> Response {
    match state.scheduler.get_by_task_id(&task_id) {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => not_found(format!("task not found: {}", task_id)),
    }
}

/// GET /submissions/{submission_id} - latest task for a submission
pub async fn get_submission(State(state): State<Arc<AdminState>>, Path(submission_id): Path<i64>) -> Response {
    match state.scheduler.find_by_submission_id(submission_id) {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => not_found(format!("no task for submission {}", submission_id)),
    }
}

/// DELETE /tasks/{task_id} - cancel; terminal tasks are left alone
pub async fn cancel_task(State(state): State<Arc<AdminState>>, Path(task_id): Path<String>) -> Response {
    match state.scheduler.cancel(&task_id) {
        Ok(()) => {
            info!(task_id = %task_id, "Cancel requested via admin API");
            match state.scheduler.get_by_task_id(&task_id) {
                Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
                None => StatusCode::OK.into_response(),
            }
        }
        Err(SchedulerError::NotFound(_)) => not_found(format!("task not found: {}", task_id)),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Cancel failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}
