use serde::{Deserialize, Serialize};

use crate::types::{ClientType, DaemonStatusInfo, SessionSummary};

/// Client -> Daemon IPC requests.
///
/// One JSONL message per request, discriminated by the `"action"` field.
/// Tags are snake_case, payload fields camelCase, matching the WS protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    /// Daemon health: pid, uptime, port, session counts, memory.
    Status,

    /// List all known sessions (including completed ones awaiting cleanup).
    SessionList,

    SessionCreate {
        working_directory: String,
        agent_config: serde_json::Value,
    },

    /// Switch this connection into streaming attach mode. The daemon replies
    /// with `attached`, then pushes `output` frames; the client sends
    /// `AttachFrame`s on the same socket until `session_detach` or EOF.
    SessionAttach {
        session_id: String,
        client_type: ClientType,
        #[serde(skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },

    SessionKill {
        session_id: String,
        #[serde(default)]
        force: bool,
    },

    /// Flush and return the persisted scrollback for a session.
    SessionExport {
        session_id: String,
    },

    /// Mint a short-lived pairing code for a session.
    PairCode {
        session_id: String,
    },

    /// Graceful daemon stop.
    Shutdown,

    Ping,
}

/// Frames a client may send while a connection is in attach mode.
///
/// Discriminated by `"type"` to match the frames the WS hub speaks, so the
/// CLI attach shim and the browser send the same shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AttachFrame {
    TerminalInput {
        /// Base64-encoded bytes to write to the PTY.
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    SessionDetach,
}

/// Daemon -> Client IPC responses and streamed frames.
///
/// Discriminated by the `"type"` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DaemonResponse {
    Status {
        status: DaemonStatusInfo,
    },

    SessionList {
        sessions: Vec<SessionSummary>,
    },

    SessionCreated {
        id: String,
    },

    Attached {
        session_id: String,
    },

    /// Streamed PTY output while attached. Base64-encoded raw bytes.
    Output {
        data: String,
    },

    /// Session lifecycle notification pushed while attached (e.g. the PTY
    /// child exited).
    SessionEvent {
        event: String,
        session_id: String,
    },

    Killed {
        killed: bool,
    },

    Exported {
        session_id: String,
        lines: Vec<String>,
        total_lines: u64,
    },

    PairingCode {
        session_id: String,
        code: String,
        /// Unix milliseconds at which the code expires.
        expires_at: u64,
        /// HTTP port the pairing endpoint listens on.
        port: u16,
    },

    Ack,

    Pong,

    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes returned by the daemon in error responses.
///
/// Unknown codes from future daemon versions deserialize to `Unknown` via
/// `#[serde(other)]`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    SessionCompleted,
    SessionAlreadyExists,
    InvalidStateTransition,
    MaxSessionsReached,
    PtyError,
    StorageError,
    ConfigInvalid,
    AuthFailed,
    RateLimited,
    DaemonAlreadyRunning,
    DaemonNotRunning,
    ConnectionFailed,
    ProtocolError,
    RequestTimeout,
    ShutdownTimeout,
    IoError,
    SerializationError,
    Base64DecodeError,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Convert a string error code (from `DaemonError::error_code()`).
    pub fn from_code(code: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(code.to_string()))
            .unwrap_or(ErrorCode::Unknown)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        f.write_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SessionId, SessionState};

    #[test]
    fn test_request_wire_format() {
        let json = r#"{"action":"status"}"#;
        let parsed: ClientRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, ClientRequest::Status));

        let json = r#"{"action":"session_create","workingDirectory":"/home/me","agentConfig":{"preset":"shell"}}"#;
        let parsed: ClientRequest = serde_json::from_str(json).unwrap();
        match parsed {
            ClientRequest::SessionCreate {
                working_directory, ..
            } => assert_eq!(working_directory, "/home/me"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_request_roundtrip_all_variants() {
        let requests = vec![
            ClientRequest::Status,
            ClientRequest::SessionList,
            ClientRequest::SessionCreate {
                working_directory: "/tmp".into(),
                agent_config: serde_json::json!({}),
            },
            ClientRequest::SessionAttach {
                session_id: "s1".into(),
                client_type: ClientType::Pc,
                cols: Some(120),
                rows: Some(40),
            },
            ClientRequest::SessionKill {
                session_id: "s1".into(),
                force: true,
            },
            ClientRequest::SessionExport {
                session_id: "s1".into(),
            },
            ClientRequest::PairCode {
                session_id: "s1".into(),
            },
            ClientRequest::Shutdown,
            ClientRequest::Ping,
        ];
        for req in requests {
            let json = serde_json::to_string(&req).unwrap();
            let parsed: ClientRequest = serde_json::from_str(&json).unwrap();
            assert_eq!(
                serde_json::to_string(&parsed).unwrap(),
                json,
                "roundtrip mismatch for {json}"
            );
        }
    }

    #[test]
    fn test_attach_frame_matches_ws_shapes() {
        let json = r#"{"type":"terminal_input","data":"bHMK"}"#;
        let parsed: AttachFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, AttachFrame::TerminalInput { .. }));

        let json = r#"{"type":"resize","cols":80,"rows":24}"#;
        let parsed: AttachFrame = serde_json::from_str(json).unwrap();
        match parsed {
            AttachFrame::Resize { cols, rows } => {
                assert_eq!((cols, rows), (80, 24));
            }
            other => panic!("wrong variant: {:?}", other),
        }

        let json = r#"{"type":"session_detach"}"#;
        let parsed: AttachFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, AttachFrame::SessionDetach));
    }

    #[test]
    fn test_response_error_roundtrip() {
        let resp = DaemonResponse::Error {
            code: ErrorCode::SessionNotFound,
            message: "no session 's1'".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""code":"session_not_found""#));
        let parsed: DaemonResponse = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonResponse::Error { code, message } => {
                assert_eq!(code, ErrorCode::SessionNotFound);
                assert!(message.contains("s1"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_response_session_list_roundtrip() {
        let resp = DaemonResponse::SessionList {
            sessions: vec![SessionSummary {
                id: SessionId::new("s1"),
                state: SessionState::Running,
                working_directory: "/tmp".into(),
                agent_config: serde_json::json!(null),
                created_at: "2026-07-01T12:00:00Z".into(),
                last_activity: "2026-07-01T12:00:00Z".into(),
                client_count: None,
                pty_pid: Some(4321),
            }],
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: DaemonResponse = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonResponse::SessionList { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].pty_pid, Some(4321));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_error_code_from_code() {
        assert_eq!(
            ErrorCode::from_code("session_not_found"),
            ErrorCode::SessionNotFound
        );
        assert_eq!(ErrorCode::from_code("rate_limited"), ErrorCode::RateLimited);
        assert_eq!(ErrorCode::from_code("bogus_code"), ErrorCode::Unknown);
    }

    #[test]
    fn test_error_code_display_matches_wire() {
        assert_eq!(ErrorCode::SessionNotFound.to_string(), "session_not_found");
        assert_eq!(ErrorCode::AuthFailed.to_string(), "auth_failed");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        // Forward compatibility: unknown fields in a request are ignored.
        let json = r#"{"action":"ping","future_field":42}"#;
        let parsed: ClientRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, ClientRequest::Ping));
    }
}
