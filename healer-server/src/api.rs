use crate::webhook::{parse_with_adapter, AirflowContextAdapter, FailureAdapter, PipelineAdapter};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use healer_core::actuator::Actuator;
use healer_core::RemediationLoop;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

const FEEDBACK_KEPT: usize = 20;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub feedback: Option<String>,
    pub rating: Option<Value>,
    pub timestamp: String,
}

pub struct AppState<A> {
    pub healer: Arc<RemediationLoop<A>>,
    feedback: Arc<Mutex<VecDeque<Feedback>>>,
}

impl<A> AppState<A> {
    pub fn new(healer: Arc<RemediationLoop<A>>) -> Self {
        Self {
            healer,
            feedback: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl<A> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            healer: self.healer.clone(),
            feedback: self.feedback.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub dag_id: String,
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub feedback: Option<String>,
    pub rating: Option<Value>,
}

pub fn router<A: Actuator>(state: AppState<A>) -> Router {
    Router::new()
        .route("/webhook", post(handle_pipeline::<A>))
        .route("/webhook/airflow", post(handle_airflow::<A>))
        .route("/api/status", get(status::<A>))
        .route("/api/summary", get(summary::<A>))
        .route("/api/resolve", post(resolve::<A>))
        .route("/api/fixes/:fix_id/rollback", post(rollback::<A>))
        .route("/api/approval", get(approval_state::<A>))
        .route("/api/approval/approve", post(approve::<A>))
        .route("/api/timeline/:dag_id/:task_id", get(timeline::<A>))
        .route("/api/feedback", post(post_feedback::<A>).get(get_feedback::<A>))
        .with_state(state)
}

async fn handle_pipeline<A: Actuator>(
    State(state): State<AppState<A>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    intake(&state, payload, &PipelineAdapter).await
}

async fn handle_airflow<A: Actuator>(
    State(state): State<AppState<A>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    intake(&state, payload, &AirflowContextAdapter).await
}

async fn intake<A: Actuator>(
    state: &AppState<A>,
    payload: Result<Json<Value>, JsonRejection>,
    adapter: &dyn FailureAdapter,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let event = match parse_with_adapter(&payload, adapter) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "failure notification rejected");
            return bad_request(err.to_string());
        }
    };
    let outcome = state.healer.handle(event).await;
    Json(outcome).into_response()
}

async fn status<A: Actuator>(State(state): State<AppState<A>>) -> Json<Value> {
    Json(json!({ "pipeline_runs": state.healer.recent_runs() }))
}

async fn summary<A: Actuator>(State(state): State<AppState<A>>) -> Response {
    Json(state.healer.summary()).into_response()
}

async fn resolve<A: Actuator>(
    State(state): State<AppState<A>>,
    request: Result<Json<ResolveRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let resolved = state.healer.resolve(&request.dag_id, &request.task_id);
    Json(json!({
        "dag_id": request.dag_id,
        "task_id": request.task_id,
        "resolved": resolved,
    }))
    .into_response()
}

async fn rollback<A: Actuator>(
    State(state): State<AppState<A>>,
    Path(fix_id): Path<String>,
) -> Response {
    if state.healer.executor().find(&fix_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown fix {fix_id}") })),
        )
            .into_response();
    }
    let rolled_back = state.healer.rollback(&fix_id).await;
    Json(json!({
        "fix_id": fix_id,
        "rolled_back": rolled_back,
        "fix": state.healer.executor().find(&fix_id),
    }))
    .into_response()
}

async fn approval_state<A: Actuator>(State(state): State<AppState<A>>) -> Response {
    match state.healer.approval_state() {
        Ok(approval) => Json(approval).into_response(),
        Err(err) => internal_error(err.to_string()),
    }
}

async fn approve<A: Actuator>(State(state): State<AppState<A>>) -> Response {
    match state.healer.approve() {
        Ok(approval) => Json(approval).into_response(),
        Err(err) => internal_error(err.to_string()),
    }
}

async fn timeline<A: Actuator>(
    State(state): State<AppState<A>>,
    Path((dag_id, task_id)): Path<(String, String)>,
) -> Response {
    match state.healer.timeline(&dag_id, &task_id) {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn post_feedback<A: Actuator>(
    State(state): State<AppState<A>>,
    request: Result<Json<FeedbackRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    info!(rating = ?request.rating, "feedback received");
    let mut feedback = state.feedback.lock();
    feedback.push_back(Feedback {
        feedback: request.feedback,
        rating: request.rating,
        timestamp: chrono::Utc::now().to_rfc3339(),
    });
    while feedback.len() > FEEDBACK_KEPT {
        feedback.pop_front();
    }
    Json(json!({ "status": "received" })).into_response()
}

async fn get_feedback<A: Actuator>(State(state): State<AppState<A>>) -> Json<Value> {
    let feedback: Vec<Feedback> = state.feedback.lock().iter().cloned().collect();
    Json(json!({ "feedback": feedback }))
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn internal_error(message: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message }))).into_response()
}
