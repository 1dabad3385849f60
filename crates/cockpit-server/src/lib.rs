//! cockpit-server: HTTP and SSE front end for durable shell sessions.
//!
//! # Architecture
//!
//! - [`commands`]: Route handlers, one module per resource.
//! - [`auth`]: Token extraction and the [`auth::Principal`] extractor.
//! - [`frames`]: SSE framing of terminal output and process snapshots.
//! - [`process_feed`]: Periodic process snapshots, one feed per client.
//! - [`process_list`]: JSON listing of the largest processes.
//! - [`state`]: Shared [`state::AppState`].

pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod frames;
pub mod process_feed;
pub mod process_list;
pub mod state;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::state::AppState;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let mut router = commands::routes();

    if let Some(dir) = state.config.server.static_dir.as_ref() {
        log::info!("Serving static files from {}", dir.display());
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.layer(CorsLayer::permissive()).with_state(state)
}
