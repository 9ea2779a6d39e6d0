//! HTTP surface: execute, plan, search and extension routes plus an SSE feed
//! of agent steps.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::client::{FailureKind, UalClient};
use crate::error::UalError;
use crate::planner::PlanRequest;
use crate::registry::ActionArgs;
use crate::types::{AgentStep, Task, WebAction};

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<UalClient>,
}

impl AppState {
    pub fn new(client: UalClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl IntoResponse for UalError {
    fn into_response(self) -> Response {
        let status = match &self {
            UalError::ActionNotFound(_) | UalError::StateNotFound(_) => StatusCode::NOT_FOUND,
            UalError::Planning(_) | UalError::InvalidArgs { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            UalError::Phase { .. } | UalError::SessionBusy(_) => StatusCode::CONFLICT,
            UalError::Search(_) | UalError::Ai(_) | UalError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute_handler))
        .route("/plan", post(plan_handler))
        .route("/events", get(sse_handler))
        .route("/actions", get(list_actions_handler))
        .route("/actions/{name}", post(run_action_handler))
        .route("/search", post(search_handler))
        .route("/search/{state_id}", get(search_state_handler))
        .route("/search/{state_id}/reply", post(search_reply_handler))
        .route("/answers/{answer_id}/feedback", post(feedback_handler))
        .route("/extension", post(extension_message_handler))
        .route("/extension/execute", post(extension_execute_handler))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("UAL agent listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn execute_handler(State(state): State<AppState>, Json(task): Json<Task>) -> Response {
    info!(goal = %task.goal, session = ?task.session_id, "POST /execute");
    let report = state.client.execute(task).await;
    let status = match report.failure {
        None => StatusCode::OK,
        Some(FailureKind::Planning) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(FailureKind::Fatal) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(report)).into_response()
}

async fn plan_handler(
    State(state): State<AppState>,
    Json(request): Json<PlanRequest>,
) -> Result<Response, UalError> {
    info!(goal = %request.goal, "POST /plan");
    let response = state.client.plan_request(&request).await?;
    Ok(Json(response).into_response())
}

fn step_event(step: &AgentStep) -> Event {
    let kind = serde_json::to_value(step.kind)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "step".to_string());
    Event::default()
        .event(kind)
        .data(serde_json::to_string(step).unwrap_or_else(|_| "{}".to_string()))
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.client.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(step) => Some(Ok::<_, Infallible>(step_event(&step))),
        // Lagged receivers skip what they missed.
        Err(_) => None,
    });
    Sse::new(stream)
}

async fn list_actions_handler(State(state): State<AppState>) -> Response {
    Json(state.client.list_actions()).into_response()
}

async fn run_action_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(args): Json<ActionArgs>,
) -> Result<Json<Value>, UalError> {
    info!(action = %name, "POST /actions");
    Ok(Json(state.client.run_action(&name, &args).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPayload {
    session_id: String,
    query: String,
}

async fn search_handler(
    State(state): State<AppState>,
    Json(payload): Json<SearchPayload>,
) -> Result<Response, UalError> {
    if payload.query.trim().is_empty() {
        return Err(UalError::InvalidArgs {
            action: "search".to_string(),
            message: "query must not be empty".to_string(),
        });
    }
    let outcome = state
        .client
        .search()
        .start(&payload.session_id, &payload.query)
        .await?;
    Ok(Json(outcome).into_response())
}

#[derive(Deserialize)]
struct ReplyPayload {
    text: String,
}

async fn search_reply_handler(
    State(state): State<AppState>,
    Path(state_id): Path<String>,
    Json(payload): Json<ReplyPayload>,
) -> Result<Response, UalError> {
    let outcome = state.client.search().respond(&state_id, &payload.text).await?;
    Ok(Json(outcome).into_response())
}

async fn search_state_handler(
    State(state): State<AppState>,
    Path(state_id): Path<String>,
) -> Result<Response, UalError> {
    Ok(Json(state.client.search().get(&state_id).await?).into_response())
}

#[derive(Deserialize)]
struct FeedbackPayload {
    helpful: bool,
    #[serde(default)]
    note: Option<String>,
}

async fn feedback_handler(
    State(state): State<AppState>,
    Path(answer_id): Path<String>,
    Json(payload): Json<FeedbackPayload>,
) -> Result<Response, UalError> {
    let answer = state
        .client
        .search()
        .record_feedback(&answer_id, payload.helpful, payload.note)
        .await?;
    Ok(Json(answer).into_response())
}

fn no_extension() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": "ERROR", "message": "No extension document attached" })),
    )
        .into_response()
}

async fn extension_message_handler(
    State(state): State<AppState>,
    Json(message): Json<Value>,
) -> Response {
    let Some(handle) = state.client.extension() else {
        return no_extension();
    };
    let response = handle.send_value(message).await;
    if !response.is_success() {
        warn!("extension replied with error: {:?}", response.message);
    }
    Json(response).into_response()
}

#[derive(Deserialize)]
struct ExtensionPlan {
    actions: Vec<WebAction>,
}

async fn extension_execute_handler(
    State(state): State<AppState>,
    Json(plan): Json<ExtensionPlan>,
) -> Response {
    let Some(handle) = state.client.extension() else {
        return no_extension();
    };
    let run = state.client.execute_via_extension(handle, &plan.actions).await;
    Json(run).into_response()
}
