//! Typed error enums shared by the agent crates.
//!
//! Every variant that can reach a client maps to a stable [`ErrorReason`]
//! wire code through its `reason()` method.

use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::ErrorReason;
use crate::target::MAX_TARGET_LEN;

// ── Target validation ─────────────────────────────────────────────────────────

/// Why a client-supplied target was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("target is empty")]
    Empty,

    #[error("target exceeds {max} characters", max = MAX_TARGET_LEN)]
    TooLong,

    #[error("target contains characters outside the allowed set")]
    IllegalCharacters,

    #[error("target is not a hostname, IP address, CIDR block, or http(s) URL")]
    UnrecognizedShape,
}

impl ValidationError {
    #[must_use]
    pub fn reason(self) -> ErrorReason {
        match self {
            Self::Empty => ErrorReason::Empty,
            Self::TooLong => ErrorReason::TooLong,
            Self::IllegalCharacters => ErrorReason::IllegalCharacters,
            Self::UnrecognizedShape => ErrorReason::UnrecognizedShape,
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Errors raised while building the tool allow-list at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool '{0}' is registered more than once")]
    DuplicateName(String),

    #[error("tool '{name}' must have exactly one target slot, found {found}")]
    TargetSlots { name: String, found: usize },

    #[error("tool '{0}' has an empty executable")]
    EmptyExecutable(String),
}

// ── Protocol ──────────────────────────────────────────────────────────────────

/// Errors raised while decoding an inbound client frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("message is not valid UTF-8")]
    NotUtf8,

    #[error("message has no string 'type' field")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid '{kind}' message: {detail}")]
    InvalidFields { kind: String, detail: String },
}

impl ProtocolError {
    #[must_use]
    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::UnknownType(_) => ErrorReason::UnknownMessageType,
            _ => ErrorReason::MalformedMessage,
        }
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

/// Errors related to server configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("listen address {0} is not a loopback address; the agent must only accept local clients")]
    NonLoopback(SocketAddr),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}
