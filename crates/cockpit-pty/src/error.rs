//! Error types for session and bridge operations.

use thiserror::Error;

use crate::bridge::TerminalId;
use crate::pty::PtyError;

/// Broad classification used by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    ResourceExhausted,
    Conflict,
    InvalidInput,
    Internal,
}

/// Session registry and terminal bridge error type
#[derive(Debug, Error)]
pub enum Error {
    /// No live session with this name belongs to the caller
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The binding does not exist or has already been released
    #[error("terminal not found: {0}")]
    TerminalNotFound(TerminalId),

    /// The caller already owns the maximum number of sessions
    #[error("maximum {max} sessions allowed per user")]
    SessionLimit { max: usize },

    /// The binding's output stream was already handed out
    #[error("terminal {0} already has an open output stream")]
    StreamBusy(TerminalId),

    #[error("invalid terminal size {rows}x{cols}")]
    InvalidGeometry { rows: u16, cols: u16 },

    /// The session's input queue is gone (process exited or session deleted)
    #[error("session closed: {0}")]
    Closed(String),

    #[error(transparent)]
    Pty(#[from] PtyError),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_) | Self::TerminalNotFound(_) | Self::Closed(_) => {
                ErrorKind::NotFound
            }
            Self::SessionLimit { .. } => ErrorKind::ResourceExhausted,
            Self::StreamBusy(_) => ErrorKind::Conflict,
            Self::InvalidGeometry { .. } => ErrorKind::InvalidInput,
            Self::Pty(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::TerminalNotFound(_) => "terminal_not_found",
            Self::SessionLimit { .. } => "session_limit",
            Self::StreamBusy(_) => "stream_busy",
            Self::InvalidGeometry { .. } => "invalid_geometry",
            Self::Closed(_) => "session_closed",
            Self::Pty(_) => "pty_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::SessionNotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::SessionLimit { max: 3 }.kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            Error::StreamBusy(TerminalId::new()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            Error::InvalidGeometry { rows: 0, cols: 80 }.kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::SessionLimit { max: 3 };
        assert_eq!(err.to_string(), "maximum 3 sessions allowed per user");
        assert_eq!(err.code(), "session_limit");

        let err = Error::SessionNotFound("cockpit_alice_0".into());
        assert!(err.to_string().contains("cockpit_alice_0"));
    }
}
