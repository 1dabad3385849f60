//! Session endpoints.
//!
//! GET  /sessions        - List the caller's sessions
//! POST /sessions        - Create a session
//! POST /sessions/delete - Delete a session by name

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use cockpit_pty::SessionList;
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub success: bool,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteSessionRequest {
    pub session_name: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteSessionResponse {
    pub success: bool,
    pub message: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/delete", post(delete_session))
}

async fn list_sessions(State(state): State<AppState>, principal: Principal) -> Json<SessionList> {
    Json(state.registry().list(&principal.username))
}

async fn create_session(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let info = state.registry().create(&principal.username)?;
    Ok(Json(CreateSessionResponse {
        success: true,
        message: format!("Session {} created", info.name),
        name: info.name,
    }))
}

async fn delete_session(
    State(state): State<AppState>,
    principal: Principal,
    payload: Result<Json<DeleteSessionRequest>, JsonRejection>,
) -> Result<Json<DeleteSessionResponse>, ApiError> {
    let Json(request) = payload?;
    state
        .registry()
        .delete(&principal.username, &request.session_name)?;
    Ok(Json(DeleteSessionResponse {
        success: true,
        message: format!("Session {} deleted", request.session_name),
    }))
}
