//! HTTP route handlers.

pub mod health;
pub mod processes;
pub mod sessions;
pub mod terminal;

use axum::Router;

use crate::state::AppState;

/// All API routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sessions::routes())
        .merge(terminal::routes())
        .merge(processes::routes())
}
