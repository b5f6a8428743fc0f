//! IPC message types for CLI-daemon communication.

use serde::{Deserialize, Serialize};

use crate::session::SessionInfo;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all live sessions.
    ListSessions,
    /// Kill a specific session by ID.
    KillSession {
        /// The session to kill.
        session_id: String,
        /// Signal to send (default: SIGKILL).
        signal: Option<i32>,
    },
    /// Kill every session one owner holds.
    KillOwnerSessions {
        /// The owner whose sessions go away.
        owner_id: String,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of live sessions.
        session_count: usize,
        /// Number of open gateway connections.
        connection_count: usize,
        /// Address the gateway listens on.
        bind_addr: String,
        /// Client protocol version the gateway speaks.
        #[serde(default)]
        protocol_version: u8,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Live sessions.
    Sessions {
        /// Snapshot of each session.
        sessions: Vec<SessionInfo>,
    },
    /// Confirmation that a session was killed.
    SessionKilled {
        /// The ID of the killed session.
        session_id: String,
    },
    /// Confirmation of a bulk kill.
    SessionsKilled {
        /// How many sessions were killed.
        count: usize,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionState, SubscriberStats};

    #[test]
    fn test_unit_requests_are_bare_strings() {
        for (request, expected) in [
            (IpcRequest::Ping, r#""Ping""#),
            (IpcRequest::Status, r#""Status""#),
            (IpcRequest::Stop, r#""Stop""#),
            (IpcRequest::ListSessions, r#""ListSessions""#),
        ] {
            assert_eq!(serde_json::to_string(&request).unwrap(), expected);
        }
    }

    #[test]
    fn test_kill_session_request_shape() {
        let request = IpcRequest::KillSession {
            session_id: "s1".to_string(),
            signal: Some(15),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"KillSession":{"session_id":"s1","signal":15}}"#);

        let parsed: IpcRequest = serde_json::from_str(r#"{"KillSession":{"session_id":"s1","signal":null}}"#).unwrap();
        assert_eq!(
            parsed,
            IpcRequest::KillSession {
                session_id: "s1".to_string(),
                signal: None
            }
        );
    }

    #[test]
    fn test_sessions_response_carries_state() {
        let response = IpcResponse::Sessions {
            sessions: vec![SessionInfo {
                id: "s1".to_string(),
                owner_id: "u1".to_string(),
                instance: 3,
                cwd: "/tmp".to_string(),
                pid: Some(1234),
                cols: 80,
                rows: 24,
                state: SessionState::Active,
                created_at: 1_700_000_000,
                idle_secs: 5,
                subscribers: vec![SubscriberStats {
                    events_delivered: 4,
                    bytes_delivered: 120,
                    last_activity: 1_700_000_005_000,
                }],
            }],
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""owner_id":"u1""#));
        assert!(json.contains(r#""state":"active""#));
        assert!(json.contains(r#""bytes_delivered":120"#));

        let parsed: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_status_without_protocol_version_still_parses() {
        let json = r#"{"Status":{"running":true,"uptime_secs":1,"session_count":0,"connection_count":0,"bind_addr":"127.0.0.1:7681"}}"#;
        let parsed: IpcResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, IpcResponse::Status { protocol_version: 0, .. }));
    }

    #[test]
    fn test_kill_owner_round_trip() {
        let request = IpcRequest::KillOwnerSessions {
            owner_id: "u1".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"KillOwnerSessions":{"owner_id":"u1"}}"#);

        let response: IpcResponse = serde_json::from_str(r#"{"SessionsKilled":{"count":2}}"#).unwrap();
        assert_eq!(response, IpcResponse::SessionsKilled { count: 2 });
    }

    #[test]
    fn test_error_response() {
        let response = IpcResponse::Error {
            message: "session not found: s9".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"Error":{"message":"session not found: s9"}}"#);
    }
}
