//! Wire protocol between the front-end and the agent.
//!
//! Every frame is a JSON object tagged by `type`. Unknown fields are ignored
//! in both directions; an unknown client `type` is an error.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

// ===================================================================
// Client → server
// ===================================================================

/// Commands a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Run an allow-listed tool against a target.
    ExecuteTool {
        tool: String,
        target: String,
        /// Opaque client data echoed back in `start` and `complete`.
        /// Never used for any decision.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    /// Stop the scan currently running on this connection.
    Cancel,
    /// Liveness probe; answered with `pong`.
    Ping,
}

impl ClientCommand {
    /// Every `type` value the server understands.
    pub const KINDS: &'static [&'static str] = &["execute_tool", "cancel", "ping"];

    /// Decode one text frame.
    ///
    /// Distinguishes malformed JSON, a missing `type`, an unknown `type`,
    /// and a known `type` with bad fields.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
            kind,
            detail: e.to_string(),
        })
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecuteTool { .. } => "execute_tool",
            Self::Cancel => "cancel",
            Self::Ping => "ping",
        }
    }
}

// ===================================================================
// Server → client
// ===================================================================

/// Which pipe an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The tool exited on its own (any exit code).
    Completed,
    /// The tool died from a signal it was not sent by the agent.
    Failed,
    /// The agent stopped the tool after its maximum run time.
    TimedOut,
    /// The client cancelled or disconnected.
    Cancelled,
}

/// Machine-readable reason carried by every `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    Empty,
    TooLong,
    IllegalCharacters,
    UnrecognizedShape,
    UnsupportedTool,
    Busy,
    Timeout,
    SpawnFailed,
    NotRunning,
    RateLimited,
    OutputLimitExceeded,
    MalformedMessage,
    UnknownMessageType,
    InternalError,
}

impl ErrorReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::TooLong => "too_long",
            Self::IllegalCharacters => "illegal_characters",
            Self::UnrecognizedShape => "unrecognized_shape",
            Self::UnsupportedTool => "unsupported_tool",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::SpawnFailed => "spawn_failed",
            Self::NotRunning => "not_running",
            Self::RateLimited => "rate_limited",
            Self::OutputLimitExceeded => "output_limit_exceeded",
            Self::MalformedMessage => "malformed_message",
            Self::UnknownMessageType => "unknown_message_type",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once, right after the connection is accepted.
    Welcome {
        message: String,
        connection_id: u64,
        available_tools: Vec<String>,
    },
    /// The tool process was spawned.
    Start {
        tool: String,
        target: String,
        /// Executable followed by its arguments, as passed to the OS.
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    /// One line of tool output.
    Output {
        tool: String,
        line: String,
        stream: OutputStream,
    },
    /// The tool process is gone.
    Complete {
        tool: String,
        target: String,
        /// Exit code, or -1 when the process was killed by a signal.
        return_code: i32,
        success: bool,
        status: CompletionStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    Error {
        reason: ErrorReason,
        message: String,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl ServerEvent {
    pub fn error(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self::Error {
            reason,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- ClientCommand::parse ---

    #[test]
    fn parses_execute_tool() {
        let cmd =
            ClientCommand::parse(r#"{"type":"execute_tool","tool":"nmap","target":"example.com"}"#)
                .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::ExecuteTool {
                tool: "nmap".to_string(),
                target: "example.com".to_string(),
                context: None,
            }
        );
        assert_eq!(cmd.kind(), "execute_tool");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let cmd = ClientCommand::parse(
            r#"{"type":"execute_tool","tool":"nmap","target":"example.com","user_id":"u1","tier":"elite"}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ClientCommand::ExecuteTool { context: None, .. }));

        let ping = ClientCommand::parse(r#"{"type":"ping","sent_at":12345}"#).unwrap();
        assert_eq!(ping, ClientCommand::Ping);
    }

    #[test]
    fn context_is_carried_opaquely() {
        let cmd = ClientCommand::parse(
            r#"{"type":"execute_tool","tool":"nmap","target":"a.io","context":{"project":7}}"#,
        )
        .unwrap();
        let ClientCommand::ExecuteTool { context, .. } = cmd else {
            panic!("expected execute_tool");
        };
        assert_eq!(context, Some(json!({"project": 7})));
    }

    #[test]
    fn parses_unit_commands() {
        assert_eq!(ClientCommand::parse(r#"{"type":"cancel"}"#).unwrap(), ClientCommand::Cancel);
        assert_eq!(ClientCommand::parse(r#"{"type":"ping"}"#).unwrap(), ClientCommand::Ping);
    }

    #[test]
    fn every_kind_is_parseable() {
        for kind in ClientCommand::KINDS {
            let frame = json!({"type": kind, "tool": "t", "target": "x.io"}).to_string();
            let cmd = ClientCommand::parse(&frame).unwrap();
            assert_eq!(cmd.kind(), *kind);
        }
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = ClientCommand::parse("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
        assert_eq!(err.reason(), ErrorReason::MalformedMessage);
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(matches!(
            ClientCommand::parse(r#"{"tool":"nmap"}"#).unwrap_err(),
            ProtocolError::MissingType
        ));
        assert!(matches!(
            ClientCommand::parse("[1,2]").unwrap_err(),
            ProtocolError::MissingType
        ));
        assert!(matches!(
            ClientCommand::parse(r#"{"type":5}"#).unwrap_err(),
            ProtocolError::MissingType
        ));
    }

    #[test]
    fn unknown_type_is_reported_as_such() {
        let err = ClientCommand::parse(r#"{"type":"install_tool","tool":"nmap"}"#).unwrap_err();
        assert!(matches!(&err, ProtocolError::UnknownType(kind) if kind == "install_tool"));
        assert_eq!(err.reason(), ErrorReason::UnknownMessageType);
    }

    #[test]
    fn missing_fields_are_malformed() {
        let err = ClientCommand::parse(r#"{"type":"execute_tool","tool":"nmap"}"#).unwrap_err();
        assert!(matches!(&err, ProtocolError::InvalidFields { kind, .. } if kind == "execute_tool"));
        assert_eq!(err.reason(), ErrorReason::MalformedMessage);

        let err =
            ClientCommand::parse(r#"{"type":"execute_tool","tool":1,"target":"a.io"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFields { .. }));
    }

    // --- ServerEvent shapes ---

    #[test]
    fn welcome_shape() {
        let event = ServerEvent::Welcome {
            message: "Desktop Agent connected".to_string(),
            connection_id: 3,
            available_tools: vec!["nmap".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "welcome",
                "message": "Desktop Agent connected",
                "connection_id": 3,
                "available_tools": ["nmap"],
            })
        );
    }

    #[test]
    fn start_omits_absent_context() {
        let event = ServerEvent::Start {
            tool: "nmap".to_string(),
            target: "example.com".to_string(),
            command: vec!["nmap".to_string(), "example.com".to_string()],
            context: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "start");
        assert!(value.get("context").is_none());
    }

    #[test]
    fn output_shape() {
        let event = ServerEvent::Output {
            tool: "nmap".to_string(),
            line: "22/tcp open ssh".to_string(),
            stream: OutputStream::Stderr,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "output", "tool": "nmap", "line": "22/tcp open ssh", "stream": "stderr"})
        );
    }

    #[test]
    fn complete_shape() {
        let event = ServerEvent::Complete {
            tool: "nmap".to_string(),
            target: "example.com".to_string(),
            return_code: 0,
            success: true,
            status: CompletionStatus::Completed,
            duration_ms: 1500,
            context: Some(json!("scan-1")),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "complete",
                "tool": "nmap",
                "target": "example.com",
                "return_code": 0,
                "success": true,
                "status": "completed",
                "duration_ms": 1500,
                "context": "scan-1",
            })
        );
    }

    #[test]
    fn error_shape_uses_reason_code() {
        let json = ServerEvent::error(ErrorReason::IllegalCharacters, "bad target")
            .to_json()
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&json).unwrap(),
            json!({"type": "error", "reason": "illegal_characters", "message": "bad target"})
        );
    }

    #[test]
    fn error_reason_display_matches_serde() {
        let reasons = [
            ErrorReason::Empty,
            ErrorReason::TooLong,
            ErrorReason::IllegalCharacters,
            ErrorReason::UnrecognizedShape,
            ErrorReason::UnsupportedTool,
            ErrorReason::Busy,
            ErrorReason::Timeout,
            ErrorReason::SpawnFailed,
            ErrorReason::NotRunning,
            ErrorReason::RateLimited,
            ErrorReason::OutputLimitExceeded,
            ErrorReason::MalformedMessage,
            ErrorReason::UnknownMessageType,
            ErrorReason::InternalError,
        ];
        for reason in reasons {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{reason}\""));
        }
    }

    #[test]
    fn server_events_tolerate_unknown_fields() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"pong","timestamp":"2026-01-01T00:00:00Z","v":2}"#)
                .unwrap();
        assert!(matches!(event, ServerEvent::Pong { .. }));
    }
}
