use std::path::PathBuf;

use mconnect_paths::MconnectPaths;
use mconnect_protocol::{ClientRequest, DaemonResponse, IpcConnection, IpcError};
use owo_colors::OwoColorize;

/// Resolve the data directory, honoring `$MCONNECT_HOME`.
pub fn paths() -> MconnectPaths {
    MconnectPaths::resolve()
        .unwrap_or_else(|_| MconnectPaths::from_dir(PathBuf::from("/tmp/.mconnect")))
}

/// The IPC socket path, honoring the `MCONNECT_IPC_PATH` override.
pub fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("MCONNECT_IPC_PATH") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    paths().daemon_socket()
}

/// Print a user-facing error line in red.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "error:".red().bold(), message);
}

/// Connect to the daemon, or explain how to start it.
pub fn connect() -> Result<IpcConnection, Box<dyn std::error::Error>> {
    let path = socket_path();
    IpcConnection::connect(&path).map_err(|e| {
        match &e {
            IpcError::NotRunning { .. } => {
                print_error("daemon is not running. Start it with: mconnect daemon start");
            }
            other => print_error(&other.to_string()),
        }
        e.into()
    })
}

/// One request/response round-trip on a fresh connection.
pub fn request(req: &ClientRequest) -> Result<DaemonResponse, Box<dyn std::error::Error>> {
    let mut conn = connect()?;
    conn.send(req).map_err(|e| {
        print_error(&e.to_string());
        e.into()
    })
}

/// Whether the daemon answers a ping on the current socket path.
pub fn daemon_alive() -> bool {
    mconnect_protocol::client::ping_daemon(&socket_path()).unwrap_or(false)
}
