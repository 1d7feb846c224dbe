//! Synchronous JSONL IPC client for the daemon's Unix socket.
//!
//! Used by the CLI for request/response verbs. The `session_attach`
//! streaming mode is driven directly over a raw `UnixStream` by the attach
//! command, not through this client.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::{ClientRequest, DaemonResponse, ErrorCode};

/// Error from the IPC client layer.
#[non_exhaustive]
#[derive(Debug)]
pub enum IpcError {
    /// Daemon socket does not exist or connection was refused.
    NotRunning { path: String },
    /// Socket exists but connection failed for a non-`ConnectionRefused` reason.
    ConnectionFailed(std::io::Error),
    /// Daemon returned an explicit error response.
    DaemonError { code: ErrorCode, message: String },
    /// Protocol-level error (serialization, empty response, invalid JSON).
    ProtocolError { message: String },
    /// Other I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::NotRunning { path } => {
                write!(f, "Daemon is not running (socket not found at {})", path)
            }
            IpcError::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            IpcError::DaemonError { code, message } => {
                write!(f, "Daemon error [{}]: {}", code, message)
            }
            IpcError::ProtocolError { message } => write!(f, "Protocol error: {}", message),
            IpcError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::ConnectionFailed(e) | IpcError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        IpcError::Io(e)
    }
}

/// A synchronous JSONL connection to the MConnect daemon.
#[derive(Debug)]
pub struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    /// Connect to the daemon at the given Unix socket path.
    ///
    /// Checks that the socket file exists, connects, and configures the
    /// 5-second request timeout on both directions. Returns
    /// `IpcError::NotRunning` if the socket doesn't exist or connection is
    /// refused.
    pub fn connect(socket_path: &Path) -> Result<Self, IpcError> {
        if !socket_path.exists() {
            return Err(IpcError::NotRunning {
                path: socket_path.display().to_string(),
            });
        }

        let stream = UnixStream::connect(socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                IpcError::NotRunning {
                    path: socket_path.display().to_string(),
                }
            } else {
                IpcError::ConnectionFailed(e)
            }
        })?;

        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;

        Ok(Self { stream })
    }

    /// Send a typed request and read one typed response.
    ///
    /// Serializes `request` as JSON, writes it as a single line, flushes,
    /// then reads one line of JSON response. Converts
    /// `DaemonResponse::Error` into `IpcError::DaemonError`.
    pub fn send(&mut self, request: &ClientRequest) -> Result<DaemonResponse, IpcError> {
        let msg = serde_json::to_string(request).map_err(|e| IpcError::ProtocolError {
            message: e.to_string(),
        })?;

        writeln!(self.stream, "{}", msg)?;
        self.stream.flush()?;

        // Transient BufReader — the request-response protocol expects exactly
        // one response line per send(). Storing it would risk buffering extra
        // data from a later attach stream.
        let mut reader = BufReader::new(&self.stream);
        let mut line = String::new();
        reader.read_line(&mut line)?;

        if line.is_empty() {
            return Err(IpcError::ProtocolError {
                message: "Empty response from daemon".to_string(),
            });
        }

        let response: DaemonResponse =
            serde_json::from_str(&line).map_err(|e| IpcError::ProtocolError {
                message: format!("Invalid JSON response: {}", e),
            })?;

        if let DaemonResponse::Error { code, message } = response {
            return Err(IpcError::DaemonError { code, message });
        }

        Ok(response)
    }

    /// Consume the connection, returning the raw stream.
    ///
    /// Used by the attach command after `session_attach` is acknowledged to
    /// drive the streaming protocol directly.
    pub fn into_stream(self) -> UnixStream {
        self.stream
    }

    /// Override the read timeout on the underlying socket.
    ///
    /// Callers like the doctor's liveness probe use shorter timeouts than the
    /// default 5 s.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), IpcError> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }
}

/// One-shot ping: connect, send `ping`, expect `pong`.
///
/// Returns `Ok(false)` when the daemon is not running; errors only on
/// unexpected failures.
pub fn ping_daemon(socket_path: &Path) -> Result<bool, IpcError> {
    let mut conn = match IpcConnection::connect(socket_path) {
        Ok(c) => c,
        Err(IpcError::NotRunning { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };
    conn.set_read_timeout(Some(Duration::from_secs(2)))?;
    match conn.send(&ClientRequest::Ping) {
        Ok(DaemonResponse::Pong) => Ok(true),
        Ok(_) => Ok(false),
        Err(IpcError::NotRunning { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
