//! Caller authentication.
//!
//! Credential checking belongs to an [`Authenticator`]; this module only
//! extracts the presented token and turns the answer into a [`Principal`].

use std::collections::HashMap;

use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use serde::Deserialize;

use crate::config::AuthConfig;
use crate::error::ApiError;
use crate::state::AppState;

/// Cookie carrying the token for browser clients.
pub const TOKEN_COOKIE: &str = "cockpit_token";

/// The authenticated caller. Sessions and bindings are scoped to `username`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
}

/// Validates caller tokens.
pub trait Authenticator: Send + Sync {
    /// When `false`, every request is accepted as [`Authenticator::anonymous`].
    fn is_enabled(&self) -> bool;

    fn authenticate(&self, token: &str) -> Option<Principal>;

    fn anonymous(&self) -> Principal {
        Principal {
            username: "local".to_string(),
        }
    }
}

/// Static token table from `[auth].users`.
pub struct TokenAuthenticator {
    enabled: bool,
    tokens: HashMap<String, String>,
}

impl TokenAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let tokens = config
            .users
            .iter()
            .map(|user| (user.token.clone(), user.username.clone()))
            .collect();
        Self {
            enabled: config.enabled,
            tokens,
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn authenticate(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token).map(|username| Principal {
            username: username.clone(),
        })
    }
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        if !state.auth.is_enabled() {
            return Ok(state.auth.anonymous());
        }

        let token = extract_token(parts).ok_or(ApiError::Unauthorized)?;
        state
            .auth
            .authenticate(&token)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Extract the token from, in order:
/// 1. `Authorization: Bearer <token>`
/// 2. `X-API-Key: <token>`
/// 3. the `cockpit_token` cookie
/// 4. `?token=<token>` (EventSource cannot set headers)
fn extract_token(parts: &Parts) -> Option<String> {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    };

    if let Some(token) = header("authorization").and_then(|v| v.strip_prefix("Bearer ")) {
        return Some(token.trim().to_string());
    }

    if let Some(key) = header("x-api-key") {
        return Some(key.trim().to_string());
    }

    if let Some(cookies) = header("cookie") {
        let cookie_prefix = format!("{TOKEN_COOKIE}=");
        if let Some(token) = cookies
            .split(';')
            .find_map(|c| c.trim().strip_prefix(cookie_prefix.as_str()))
        {
            return Some(token.to_string());
        }
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}
