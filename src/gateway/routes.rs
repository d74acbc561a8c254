//! HTTP surface — REST endpoints for event ingestion and state polling, plus
//! SSE streams for live delivery.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::delivery::frame::StateFrame;
use crate::error::{GatewayError, RegistryError};
use crate::provision::WorkflowRequest;
use crate::registry::SessionRegistry;

use super::Gateway;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub registry: Arc<SessionRegistry>,
}

/// Build the Axum router for the sync service.
pub fn sync_routes(gateway: Arc<Gateway>, registry: Arc<SessionRegistry>) -> Router {
    let state = AppState { gateway, registry };

    Router::new()
        .route("/health", get(health))
        .route("/api/runs", post(start_run))
        .route("/api/events", post(ingest_event))
        .route("/api/state/{participant}", get(run_state))
        .route("/api/runs/{participant}/stream", get(stream_run))
        .route("/api/checklist/{participant}/{platform}", get(checklist))
        .route("/api/runs/{participant}/events", get(event_log))
        .route("/api/runs/{participant}/reset", post(reset_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error_body(message: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": message.to_string() }))
}

fn map_gateway_error(err: GatewayError) -> ApiError {
    match err {
        GatewayError::MalformedEvent(_) => (StatusCode::BAD_REQUEST, error_body(err)),
        GatewayError::Registry(RegistryError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, error_body(err))
        }
        GatewayError::Registry(RegistryError::DuplicateRun { .. }) => {
            (StatusCode::CONFLICT, error_body(err))
        }
    }
}

fn not_found(participant: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        error_body(format!("no run for {participant}")),
    )
}

fn frame_event(frame: &StateFrame) -> Event {
    let event = Event::default().event(frame.event.as_str());
    match event.json_data(frame) {
        Ok(event) => event,
        // StateFrame serialization cannot fail; keep the stream alive anyway.
        Err(_) => Event::default().event("error").data("serialization failed"),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "onboard-sync"
    }))
}

// ── Run lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StartRunBody {
    participant_key: String,
    platform: String,
    #[serde(default)]
    request: WorkflowRequest,
}

/// Start a run and stream its delivery frames back as SSE.
///
/// The response stream carries every frame from provisioning through
/// onboarding, ending with a `done` or `error` event.
async fn start_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (run, rx) = state
        .gateway
        .initiate(&body.participant_key, &body.platform, body.request)
        .await
        .map_err(map_gateway_error)?;

    info!(participant = %run.participant_key, platform = %run.platform, "Run stream opened");
    let frames = ReceiverStream::new(rx).map(|frame| Ok(frame_event(&frame)));
    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

/// Re-attach to a running session: replay recorded frames, then go live.
async fn stream_run(
    State(state): State<AppState>,
    Path(participant): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Attach first, then snapshot: a frame published in between shows up in
    // both halves and is deduped by seq. Snapshot-then-attach would lose it.
    let rx = state
        .registry
        .attach_channel(&participant)
        .await
        .map_err(|e| map_gateway_error(e.into()))?;
    let run = state
        .registry
        .get_run(&participant)
        .await
        .ok_or_else(|| not_found(&participant))?;
    let replay = run.delivery_log;
    let last_replayed = replay.last().map(|f| f.seq).unwrap_or(0);

    let live = ReceiverStream::new(rx)
        .filter(move |frame| futures::future::ready(frame.seq > last_replayed));
    let frames = stream::iter(replay)
        .chain(live)
        .map(|frame| Ok(frame_event(&frame)));
    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

async fn reset_run(
    State(state): State<AppState>,
    Path(participant): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.registry.reset_run(&participant).await {
        Ok(Json(serde_json::json!({ "reset": true })))
    } else {
        Err(not_found(&participant))
    }
}

// ── Event ingestion ─────────────────────────────────────────────────────

async fn ingest_event(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<super::IngestOutcome>, ApiError> {
    let outcome = state
        .gateway
        .ingest(&body)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(outcome))
}

// ── State polling ───────────────────────────────────────────────────────

/// Poll-fallback snapshot: full run state plus the ordered frame history, so
/// an observer that lost its live channel can resync from here.
async fn run_state(
    State(state): State<AppState>,
    Path(participant): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state
        .registry
        .get_run(&participant)
        .await
        .ok_or_else(|| not_found(&participant))?;

    Ok(Json(serde_json::json!({
        "run_id": run.id,
        "participant_key": run.participant_key,
        "platform": run.platform,
        "phase": run.phase,
        "phase_status": run.phase_status,
        "engagement": run.engagement,
        "agent_activated": run.engagement.agent_activated(),
        "engagement_in_progress": run.engagement.in_progress(),
        "engagement_completed": run.engagement.completed(),
        "progress": run.progress(),
        "created_at": run.created_at,
        "first_activation_at": run.first_activation_at,
        "completed_at": run.completed_at,
        "frames": run.delivery_log,
    })))
}

/// Per-participant task retrieval for the client agent, keyed by both the
/// participant and the platform its run was started for.
async fn checklist(
    State(state): State<AppState>,
    Path((participant, platform)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state
        .registry
        .get_run(&participant)
        .await
        .filter(|run| run.platform == platform)
        .ok_or_else(|| not_found(&participant))?;
    Ok(Json(serde_json::json!({
        "platform": run.platform,
        "steps": run.steps,
        "progress": run.progress(),
    })))
}

async fn event_log(
    State(state): State<AppState>,
    Path(participant): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state
        .registry
        .get_run(&participant)
        .await
        .ok_or_else(|| not_found(&participant))?;
    Ok(Json(serde_json::json!({
        "participant_key": run.participant_key,
        "events": run.event_log,
    })))
}
