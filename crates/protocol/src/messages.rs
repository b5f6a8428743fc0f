//! Protocol message definitions for ptygate.
//!
//! This module defines the JSON messages exchanged between a browser terminal
//! view and the gateway. Every frame is a single JSON object carrying a
//! lowercase `type` tag; inbound and outbound kinds are closed enums so both
//! sides match exhaustively instead of comparing strings.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Terminal width used when a `create` request does not carry one.
pub const DEFAULT_COLS: u16 = 80;

/// Terminal height used when a `create` request does not carry one.
pub const DEFAULT_ROWS: u16 = 24;

/// Messages sent from the client to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Allocate (or replace) a session and bind this connection to it.
    Create(CreateSession),
    /// Raw keystrokes for the shell's stdin.
    Input(SessionInput),
    /// New terminal geometry.
    Resize(SessionResize),
    /// Terminate and remove the bound session.
    Kill,
}

impl ClientMessage {
    /// Tag values accepted on the wire.
    pub const KINDS: [&'static str; 4] = ["create", "input", "resize", "kill"];

    /// Parse and validate a client frame.
    ///
    /// Unknown `type` tags are reported as [`ProtocolError::UnknownType`] so the
    /// gateway can tell a typo apart from a broken payload.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "type",
                reason: "missing or not a string".to_string(),
            })?;

        if !Self::KINDS.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        let message: Self = serde_json::from_value(value)?;
        message.validate()?;
        Ok(message)
    }

    /// Returns the wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Create(_) => "create",
            ClientMessage::Input(_) => "input",
            ClientMessage::Resize(_) => "resize",
            ClientMessage::Kill => "kill",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        match self {
            ClientMessage::Create(req) => {
                if req.session_id.trim().is_empty() {
                    return Err(ProtocolError::InvalidField {
                        field: "sessionId",
                        reason: "must not be empty".to_string(),
                    });
                }
                if req.user_id.trim().is_empty() {
                    return Err(ProtocolError::InvalidField {
                        field: "userId",
                        reason: "must not be empty".to_string(),
                    });
                }
                if req.cols == Some(0) {
                    return Err(ProtocolError::InvalidField {
                        field: "cols",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                if req.rows == Some(0) {
                    return Err(ProtocolError::InvalidField {
                        field: "rows",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Ok(())
            }
            ClientMessage::Resize(req) => {
                if req.cols == 0 {
                    return Err(ProtocolError::InvalidField {
                        field: "cols",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                if req.rows == 0 {
                    return Err(ProtocolError::InvalidField {
                        field: "rows",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Ok(())
            }
            ClientMessage::Input(_) | ClientMessage::Kill => Ok(()),
        }
    }
}

/// Request to allocate a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    /// Caller-chosen session identifier.
    pub session_id: String,
    /// Owner of the session, as vouched for by the identity layer.
    pub user_id: String,
    /// Directory the shell starts in (default: configured directory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Initial terminal columns (default: 80).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    /// Initial terminal rows (default: 24).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl CreateSession {
    /// Create a request with default geometry and working directory.
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            cwd: None,
            cols: None,
            rows: None,
        }
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Requested geometry, falling back to the protocol defaults.
    pub fn geometry(&self) -> (u16, u16) {
        (
            self.cols.unwrap_or(DEFAULT_COLS),
            self.rows.unwrap_or(DEFAULT_ROWS),
        )
    }
}

/// Keystrokes destined for the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInput {
    /// Raw input text, forwarded byte-for-byte.
    pub data: String,
}

/// Terminal resize notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResize {
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Messages sent from the gateway to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// The connection is bound and accepts `input`/`resize`/`kill`.
    Ready,
    /// A session was allocated for this connection.
    Created {
        /// Identifier of the allocated session.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// A chunk of interleaved shell stdout/stderr.
    Output {
        /// Decoded terminal output.
        data: String,
    },
    /// The shell process terminated.
    Exit {
        /// Exit status, `null` when the process died from a signal.
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        /// Terminating signal number, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    /// A request failed or was not valid in the current state.
    Error {
        /// Human-readable description.
        error: String,
        /// Machine-readable classification.
        code: ErrorCode,
    },
}

impl ServerMessage {
    /// Build an `output` message.
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    /// Build an `error` message.
    pub fn error(code: ErrorCode, error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            code,
        }
    }

    /// Returns the wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Ready => "ready",
            ServerMessage::Created { .. } => "created",
            ServerMessage::Output { .. } => "output",
            ServerMessage::Exit { .. } => "exit",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a server frame (used by clients and tests).
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Error classification carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The frame could not be parsed or failed validation.
    InvalidMessage,
    /// The message is not accepted in the connection's current state.
    InvalidState,
    /// The OS could not create the process or pseudo-terminal.
    SpawnFailed,
    /// The referenced session does not exist.
    UnknownSession,
    /// The owner already holds the maximum number of sessions.
    QuotaExceeded,
    /// The service cannot host more sessions right now.
    CapacityExhausted,
    /// The caller is not allowed to act on the session.
    Forbidden,
    /// Unexpected server-side failure.
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::UnknownSession => "unknown_session",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::CapacityExhausted => "capacity_exhausted",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::Internal => "internal",
        };
        f.write_str(s)
    }
}
