use serde::{Deserialize, Serialize};

/// Generate a newtype wrapper around `String` with standard trait impls.
macro_rules! newtype_string {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

newtype_string! {
    /// Opaque unique session identifier, stable across daemon restarts.
    SessionId
}

/// Session lifecycle state.
///
/// `Completed` is terminal: no transitions out of it are valid.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Paused,
    Completed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SessionState::Running),
            "paused" => Some(SessionState::Paused),
            "completed" => Some(SessionState::Completed),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::Running, SessionState::Paused) => true,
            (SessionState::Paused, SessionState::Running) => true,
            (SessionState::Running, SessionState::Completed) => true,
            (SessionState::Paused, SessionState::Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Pc,
    Mobile,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Pc => "pc",
            ClientType::Mobile => "mobile",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pc" => Some(ClientType::Pc),
            "mobile" => Some(ClientType::Mobile),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input priority assigned to a connected client.
///
/// Ordering is by rank: `Exclusive` outranks everything, `Observer` may
/// never submit input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Exclusive,
    High,
    Normal,
    Low,
    Observer,
}

impl Priority {
    /// Numeric rank for ordering: lower is stronger.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Exclusive => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Observer => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Exclusive => "exclusive",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Observer => "observer",
        }
    }

    /// Default priority for a client type: PC clients drive by default,
    /// mobile clients queue behind them.
    pub fn default_for(client_type: ClientType) -> Self {
        match client_type {
            ClientType::Pc => Priority::High,
            ClientType::Mobile => Priority::Normal,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a session as returned via IPC and the WS `session_list` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub working_directory: String,
    /// Opaque agent configuration blob (preset name + agent descriptors).
    pub agent_config: serde_json::Value,
    pub created_at: String,
    pub last_activity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pty_pid: Option<u32>,
}

/// Daemon health snapshot returned by the IPC `status` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatusInfo {
    pub pid: u32,
    pub uptime_secs: u64,
    pub port: u16,
    pub ipc_path: String,
    pub session_count: usize,
    pub running_sessions: usize,
    pub connected_clients: usize,
    /// Resident memory of the daemon process in bytes, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_roundtrip() {
        for state in [
            SessionState::Running,
            SessionState::Paused,
            SessionState::Completed,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            let parsed: SessionState = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, state);
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_session_state_transitions() {
        use SessionState::*;
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Completed));
        // Completed is terminal
        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Paused));
        assert!(!Completed.can_transition_to(Completed));
        // No self-transitions
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_priority_rank_ordering() {
        assert!(Priority::Exclusive.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
        assert!(Priority::Low.rank() < Priority::Observer.rank());
    }

    #[test]
    fn test_priority_defaults() {
        assert_eq!(Priority::default_for(ClientType::Pc), Priority::High);
        assert_eq!(Priority::default_for(ClientType::Mobile), Priority::Normal);
    }

    #[test]
    fn test_client_type_parse() {
        assert_eq!(ClientType::parse("pc"), Some(ClientType::Pc));
        assert_eq!(ClientType::parse("mobile"), Some(ClientType::Mobile));
        assert_eq!(ClientType::parse("tablet"), None);
    }

    #[test]
    fn test_session_id_newtype() {
        let id = SessionId::new("abc-123");
        assert_eq!(id.as_ref(), "abc-123");
        assert_eq!(id.to_string(), "abc-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""abc-123""#);
    }

    #[test]
    fn test_session_summary_serde() {
        let summary = SessionSummary {
            id: SessionId::new("s1"),
            state: SessionState::Running,
            working_directory: "/tmp".to_string(),
            agent_config: serde_json::json!({"preset": "shell"}),
            created_at: "2026-07-01T12:00:00Z".to_string(),
            last_activity: "2026-07-01T12:05:00Z".to_string(),
            client_count: Some(2),
            pty_pid: None,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains(r#""state":"running""#));
        assert!(json.contains(r#""workingDirectory":"/tmp""#));
        assert!(!json.contains("ptyPid"));
        let parsed: SessionSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, summary.id);
        assert_eq!(parsed.client_count, Some(2));
    }
}
