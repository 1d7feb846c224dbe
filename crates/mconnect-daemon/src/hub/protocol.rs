//! WebSocket protocol v2 frames.
//!
//! All frames are JSON with a snake_case `type` discriminator and camelCase
//! payload fields. Unknown client frame types are logged and ignored;
//! unknown fields are ignored for forward compatibility. Timestamps are
//! Unix milliseconds.

use mconnect_protocol::{ClientType, Priority, SessionState, SessionSummary};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "2.0";

/// Client -> server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    SessionAttach { session_id: String },

    SessionDetach {},

    #[serde(rename_all = "camelCase")]
    TerminalInput {
        data: String,
        #[serde(default)]
        agent_id: Option<String>,
    },

    Resize { cols: u16, rows: u16 },

    #[serde(rename_all = "camelCase")]
    ScrollbackRequest {
        session_id: String,
        from_line: u64,
        count: usize,
    },

    ControlRequest { action: String },

    HeartbeatAck { timestamp: u64 },

    Ping,

    #[serde(rename_all = "camelCase")]
    ApprovalResponse { approval_id: String, approved: bool },

    /// Forward compatibility: unrecognized frame types are ignored.
    #[serde(other)]
    Unknown,
}

/// Summary of a peer client, carried by `client_joined`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub client_type: ClientType,
    pub priority: Priority,
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        client_id: String,
        protocol_version: &'static str,
        client_type: ClientType,
    },

    SessionList {
        sessions: Vec<SessionSummary>,
    },

    #[serde(rename_all = "camelCase")]
    SessionState {
        session_id: String,
        state: SessionState,
        last_activity: String,
    },

    #[serde(rename_all = "camelCase")]
    ScrollbackResponse {
        session_id: String,
        lines: Vec<String>,
        from_line: u64,
        total_lines: u64,
    },

    #[serde(rename_all = "camelCase")]
    ControlStatus {
        session_id: String,
        state: String,
        active_client: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exclusive_expires: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_pc_activity: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    ControlResponse {
        granted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<u64>,
    },

    InputRejected {
        reason: String,
    },

    ClientJoined {
        client: ClientInfo,
    },

    #[serde(rename_all = "camelCase")]
    ClientLeft {
        client_id: String,
    },

    Heartbeat {
        timestamp: u64,
    },

    #[serde(rename_all = "camelCase")]
    TerminalOutput {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },

    Pong,

    Error {
        message: String,
        code: &'static str,
    },

    #[serde(rename_all = "camelCase")]
    CommandBlocked {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ApprovalRequest {
        approval_id: String,
        session_id: String,
        command: String,
    },
}

/// Stable per-connection error codes.
pub mod error_codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const SESSION_COMPLETED: &str = "SESSION_COMPLETED";
    pub const NOT_ATTACHED: &str = "NOT_ATTACHED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_wire_shapes() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"session_attach","sessionId":"s1"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::SessionAttach { session_id } if session_id == "s1"));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"terminal_input","data":"ls\n","agentId":"a1"}"#)
                .unwrap();
        match frame {
            ClientFrame::TerminalInput { data, agent_id } => {
                assert_eq!(data, "ls\n");
                assert_eq!(agent_id.as_deref(), Some("a1"));
            }
            other => panic!("wrong variant: {:?}", other),
        }

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"scrollback_request","sessionId":"s1","fromLine":0,"count":1000}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::ScrollbackRequest {
                session_id,
                from_line,
                count,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(from_line, 0);
                assert_eq!(count, 1000);
            }
            other => panic!("wrong variant: {:?}", other),
        }

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"control_request","action":"exclusive"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::ControlRequest { action } if action == "exclusive"));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"heartbeat_ack","timestamp":1700000000000}"#).unwrap();
        assert!(matches!(frame, ClientFrame::HeartbeatAck { timestamp } if timestamp > 0));

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[test]
    fn test_unknown_frame_type_ignored() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"future_thing","x":1}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Unknown));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"ping","extra":"field"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[test]
    fn test_auth_success_serialization() {
        let msg = ServerMessage::AuthSuccess {
            client_id: "c1".to_string(),
            protocol_version: PROTOCOL_VERSION,
            client_type: ClientType::Mobile,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"auth_success""#));
        assert!(json.contains(r#""clientId":"c1""#));
        assert!(json.contains(r#""protocolVersion":"2.0""#));
        assert!(json.contains(r#""clientType":"mobile""#));
    }

    #[test]
    fn test_scrollback_response_serialization() {
        let msg = ServerMessage::ScrollbackResponse {
            session_id: "s1".to_string(),
            lines: vec!["hello".to_string(), "world".to_string()],
            from_line: 0,
            total_lines: 2,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""fromLine":0"#));
        assert!(json.contains(r#""totalLines":2"#));
        assert!(json.contains(r#""lines":["hello","world"]"#));
    }

    #[test]
    fn test_control_status_optional_fields_skipped() {
        let msg = ServerMessage::ControlStatus {
            session_id: "s1".to_string(),
            state: "pc_active".to_string(),
            active_client: Some("c1".to_string()),
            exclusive_expires: None,
            last_pc_activity: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("exclusiveExpires"));
        assert!(!json.contains("lastPcActivity"));
        // activeClient is always present (nullable).
        assert!(json.contains(r#""activeClient":"c1""#));
    }

    #[test]
    fn test_error_frame_shape() {
        let msg = ServerMessage::Error {
            message: "no such session".to_string(),
            code: error_codes::SESSION_NOT_FOUND,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""code":"SESSION_NOT_FOUND""#));
    }

    #[test]
    fn test_input_rejected_shape() {
        let msg = ServerMessage::InputRejected {
            reason: "pc_typing".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"input_rejected","reason":"pc_typing"}"#);
    }
}
