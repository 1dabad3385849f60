//! HTTP error mapping.
//!
//! Every failed call answers with `{ "error": <message>, "code": <code> }`.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cockpit_pty::ErrorKind;
use serde_json::json;
use thiserror::Error;

use crate::process_feed::SnapshotError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Terminal(#[from] cockpit_pty::Error),

    #[error("Not authenticated")]
    Unauthorized,

    /// A path id that can never name a binding.
    #[error("terminal not found: {0}")]
    MalformedTerminalId(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    ProcessList(#[from] SnapshotError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Terminal(err) => match err.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::MalformedTerminalId(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ProcessList(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Terminal(err) => err.code(),
            Self::Unauthorized => "unauthorized",
            Self::MalformedTerminalId(_) => "terminal_not_found",
            Self::BadRequest(_) => "bad_request",
            Self::ProcessList(_) => "process_list_failed",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::warn!("Request failed: {self}");
        }
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cockpit_pty::{Error, TerminalId};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(Error::SessionNotFound("x".into())), StatusCode::NOT_FOUND),
            (ApiError::from(Error::SessionLimit { max: 1 }), StatusCode::TOO_MANY_REQUESTS),
            (ApiError::from(Error::StreamBusy(TerminalId::new())), StatusCode::CONFLICT),
            (
                ApiError::from(Error::InvalidGeometry { rows: 0, cols: 0 }),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ApiError::MalformedTerminalId("zz".into()), StatusCode::NOT_FOUND),
            (ApiError::BadRequest("missing field".into()), StatusCode::BAD_REQUEST),
            (
                ApiError::from(SnapshotError::Timeout),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn test_message_is_verbatim() {
        let err = ApiError::from(Error::SessionLimit { max: 3 });
        assert_eq!(err.to_string(), "maximum 3 sessions allowed per user");
        assert_eq!(err.code(), "session_limit");
        assert_eq!(err.into_response().status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
