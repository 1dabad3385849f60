//! Terminal bridge endpoints.
//!
//! POST /terminal/connect         - Bind a new terminal id to a session
//! POST /terminal/write/:id       - Forward input bytes
//! POST /terminal/resize/:id      - Change the terminal geometry
//! GET  /terminal/read/:id        - SSE stream of output, ending with `end`
//! POST /terminal/disconnect/:id  - Release the binding

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use cockpit_pty::TerminalId;
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::frames::{already_ended, terminal_events};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub session_name: String,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub terminal_id: TerminalId,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub success: bool,
}

const ACK: Ack = Ack { success: true };

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/terminal/connect", post(connect))
        .route("/terminal/write/:terminal_id", post(write))
        .route("/terminal/resize/:terminal_id", post(resize))
        .route("/terminal/read/:terminal_id", get(read))
        .route("/terminal/disconnect/:terminal_id", post(disconnect))
}

fn parse_terminal_id(raw: &str) -> Result<TerminalId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::MalformedTerminalId(raw.to_string()))
}

async fn connect(
    State(state): State<AppState>,
    principal: Principal,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let Json(request) = payload?;
    // A size is only applied when both dimensions are given.
    let size = request.rows.zip(request.cols);
    let terminal_id = state
        .bridge
        .connect(&principal.username, &request.session_name, size)
        .await?;
    Ok(Json(ConnectResponse { terminal_id }))
}

async fn write(
    State(state): State<AppState>,
    principal: Principal,
    Path(terminal_id): Path<String>,
    payload: Result<Json<WriteRequest>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let terminal_id = parse_terminal_id(&terminal_id)?;
    let Json(request) = payload?;
    state
        .bridge
        .write(&principal.username, terminal_id, request.data.into_bytes())
        .await?;
    Ok(Json(ACK))
}

async fn resize(
    State(state): State<AppState>,
    principal: Principal,
    Path(terminal_id): Path<String>,
    payload: Result<Json<ResizeRequest>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let terminal_id = parse_terminal_id(&terminal_id)?;
    let Json(request) = payload?;
    state
        .bridge
        .resize(&principal.username, terminal_id, request.rows, request.cols)
        .await?;
    Ok(Json(ACK))
}

/// A reconnect after `end` gets 204 and the binding is left alone.
async fn read(
    State(state): State<AppState>,
    principal: Principal,
    Path(terminal_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let terminal_id = parse_terminal_id(&terminal_id)?;
    if already_ended(&headers) {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let stream = state.bridge.read(&principal.username, terminal_id)?;
    log::info!("Terminal {terminal_id} stream opened");
    let events = terminal_events(stream, state.config.server.sse_retry());
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Idempotent: unknown and malformed ids succeed too.
async fn disconnect(
    State(state): State<AppState>,
    principal: Principal,
    Path(terminal_id): Path<String>,
) -> Json<Ack> {
    if let Ok(terminal_id) = terminal_id.parse::<TerminalId>() {
        state.bridge.disconnect(&principal.username, terminal_id);
        log::info!("Terminal {terminal_id} disconnected");
    }
    Json(ACK)
}
