use std::io;

/// All error types for the mconnect-daemon crate.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon not running")]
    NotRunning,

    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("session completed: {0}")]
    SessionCompleted(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("session limit reached ({0} concurrent sessions)")]
    MaxSessionsReached(usize),

    #[error("PTY error: {0}")]
    PtyError(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("rate limited")]
    RateLimited,

    #[error("request timed out")]
    RequestTimeout,

    #[error("shutdown timeout exceeded")]
    ShutdownTimeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

impl DaemonError {
    /// Error code string for the IPC and WS protocols.
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::NotRunning => "daemon_not_running",
            DaemonError::AlreadyRunning(_) => "daemon_already_running",
            DaemonError::ConnectionFailed(_) => "connection_failed",
            DaemonError::ProtocolError(_) => "protocol_error",
            DaemonError::SessionNotFound(_) => "session_not_found",
            DaemonError::SessionAlreadyExists(_) => "session_already_exists",
            DaemonError::SessionCompleted(_) => "session_completed",
            DaemonError::InvalidStateTransition { .. } => "invalid_state_transition",
            DaemonError::MaxSessionsReached(_) => "max_sessions_reached",
            DaemonError::PtyError(_) => "pty_error",
            DaemonError::Storage(_) => "storage_error",
            DaemonError::ConfigInvalid(_) => "config_invalid",
            DaemonError::AuthFailed => "auth_failed",
            DaemonError::RateLimited => "rate_limited",
            DaemonError::RequestTimeout => "request_timeout",
            DaemonError::ShutdownTimeout => "shutdown_timeout",
            DaemonError::Io(_) => "io_error",
            DaemonError::Serde(_) => "serialization_error",
            DaemonError::Base64Decode(_) => "base64_decode_error",
        }
    }

    /// Whether this error is caused by user input rather than a daemon fault.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DaemonError::SessionNotFound(_)
                | DaemonError::SessionAlreadyExists(_)
                | DaemonError::SessionCompleted(_)
                | DaemonError::InvalidStateTransition { .. }
                | DaemonError::MaxSessionsReached(_)
                | DaemonError::AlreadyRunning(_)
                | DaemonError::AuthFailed
                | DaemonError::RateLimited
        )
    }
}
