//! Connection-scoped errors. None of these ever close the server.

use desktop_agent_common::{ErrorReason, ProtocolError, ValidationError};
use thiserror::Error;

use crate::session::SessionState;

/// The OS refused to start a tool.
#[derive(Debug, Error)]
#[error("failed to spawn '{executable}': {source}")]
pub struct SpawnError {
    pub executable: String,
    #[source]
    pub source: std::io::Error,
}

/// A scan session was asked to move along an edge its state machine lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// Why one inbound client message was rejected.
#[derive(Debug, Error)]
pub enum CommandError {
    // ── Decoding ──────────────────────────────────────────────────────────────
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("rate limit exceeded: at most {limit} messages per {window_secs}s")]
    RateLimited { limit: usize, window_secs: u64 },

    // ── execute_tool ──────────────────────────────────────────────────────────
    #[error("tool '{0}' is not supported")]
    UnsupportedTool(String),

    #[error("invalid target: {0}")]
    Validation(#[from] ValidationError),

    #[error("'{0}' is already running on this connection; wait for it or cancel")]
    Busy(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    // ── cancel ────────────────────────────────────────────────────────────────
    #[error("no scan is running on this connection")]
    NotRunning,

    // ── Faults ────────────────────────────────────────────────────────────────
    #[error(transparent)]
    Session(#[from] TransitionError),

    #[error("internal error while handling the message")]
    Internal,
}

impl CommandError {
    #[must_use]
    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::Protocol(e) => e.reason(),
            Self::RateLimited { .. } => ErrorReason::RateLimited,
            Self::UnsupportedTool(_) => ErrorReason::UnsupportedTool,
            Self::Validation(e) => e.reason(),
            Self::Busy(_) => ErrorReason::Busy,
            Self::Spawn(_) => ErrorReason::SpawnFailed,
            Self::NotRunning => ErrorReason::NotRunning,
            Self::Session(_) | Self::Internal => ErrorReason::InternalError,
        }
    }
}
