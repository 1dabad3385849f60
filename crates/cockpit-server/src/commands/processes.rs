//! Process endpoints.
//!
//! GET /processes         - Largest processes by memory, as JSON
//! GET /processes/stream  - SSE feed of full snapshots, one per interval

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::frames::{already_ended, feed_events};
use crate::process_list::ProcessList;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    /// Distinguishes several viewers of the same user.
    pub client: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/processes", get(list_processes))
        .route("/processes/stream", get(stream_processes))
}

fn client_key(username: &str, client: Option<&str>) -> String {
    format!("{username}:{}", client.unwrap_or("default"))
}

async fn list_processes(
    State(state): State<AppState>,
    _principal: Principal,
) -> Result<Json<ProcessList>, ApiError> {
    Ok(Json(state.processes.list().await?))
}

/// A browser reconnecting after `end` gets 204 instead of a new feed, so a
/// superseded tab cannot take the feed back.
async fn stream_processes(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<FeedQuery>,
    headers: HeaderMap,
) -> Response {
    let key = client_key(&principal.username, query.client.as_deref());
    if already_ended(&headers) {
        log::debug!("Process feed for {key} already ended, not restarting");
        return StatusCode::NO_CONTENT.into_response();
    }
    let feed = state.feeds.start(&key).await;
    Sse::new(feed_events(feed, state.config.server.sse_retry()))
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_key() {
        assert_eq!(client_key("alice", None), "alice:default");
        assert_eq!(client_key("alice", Some("tab2")), "alice:tab2");
    }
}
