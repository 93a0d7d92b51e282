use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::session::SessionName;
use crate::source::AgentSession;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    streams: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        streams: state.streams.active_streams(),
    })
}

#[derive(Serialize)]
pub(super) struct AgentListResponse {
    agents: Vec<AgentSession>,
}

pub(super) async fn agent_list(
    State(state): State<AppState>,
) -> Result<Json<AgentListResponse>, ApiError> {
    let agents = state.streams.source().list_sessions().await.map_err(|e| {
        tracing::error!(error = %e, "failed to list agent sessions");
        ApiError::from(e)
    })?;
    Ok(Json(AgentListResponse { agents }))
}

/// `GET /agents/{name}/stream`: live agent output as Server-Sent Events.
///
/// The name is validated before anything else happens; a bad name gets a
/// plain JSON 400 and never reaches the output source.
pub(super) async fn agent_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let session = SessionName::parse(&name).map_err(|e| {
        tracing::debug!(reason = %e.reason, "rejected stream request");
        ApiError::from(e)
    })?;

    let (handle, events) = state.streams.open_stream(session)?;
    tracing::info!(id = %handle.id(), session = %handle.session(), "agent stream attached");

    let mut response = Body::from_stream(events).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}
