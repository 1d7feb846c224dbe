//! Shared IPC protocol for MConnect daemon communication.
//!
//! The CLI talks to the daemon over a local Unix socket speaking
//! line-delimited JSON: one `ClientRequest` per line in, one
//! `DaemonResponse` per line out. The `session_attach` request switches the
//! connection into streaming mode, where the daemon pushes `output` frames
//! and the client sends `AttachFrame`s until detach.

#[cfg(unix)]
pub mod client;
mod messages;
mod types;

#[cfg(unix)]
pub use client::{IpcConnection, IpcError};
pub use messages::{AttachFrame, ClientRequest, DaemonResponse, ErrorCode};
pub use types::{
    ClientType, DaemonStatusInfo, Priority, SessionId, SessionState, SessionSummary,
};
