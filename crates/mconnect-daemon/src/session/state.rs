use std::sync::{Arc, Mutex};

use bytes::Bytes;
use mconnect_protocol::{SessionId, SessionState, SessionSummary};
use tokio::sync::broadcast;

use crate::scrollback::ScrollbackBuffer;
use crate::store::SessionRecord;

/// Capacity of the per-session output broadcast channel. Slow receivers that
/// lag past this many chunks drop output and recover via scrollback.
pub const OUTPUT_BROADCAST_CAP: usize = 64;

/// How long a completed session keeps its live view so detach and export can
/// still read from memory.
pub const COMPLETED_RETAIN_MS: u64 = 60_000;

/// A session the daemon holds live runtime state for.
///
/// The persistent row in the store is authoritative for lifecycle state;
/// this view adds the scrollback buffer, the output fan-out channel, and the
/// PTY pid.
pub struct ActiveSession {
    pub id: String,
    pub state: SessionState,
    pub agent_config: serde_json::Value,
    pub working_directory: String,
    pub created_at: String,
    pub last_activity: String,
    /// Shared with callers that need range queries while the session runs.
    scrollback: Arc<Mutex<ScrollbackBuffer>>,
    /// Fan-out for raw PTY output to every attached consumer.
    output_tx: broadcast::Sender<Bytes>,
    pub pty_pid: Option<u32>,
    /// Set when the session completed; the view is dropped after the
    /// retention window.
    pub completed_at_ms: Option<u64>,
}

impl ActiveSession {
    pub fn new(record: SessionRecord, scrollback: ScrollbackBuffer) -> Self {
        let (output_tx, _) = broadcast::channel(OUTPUT_BROADCAST_CAP);
        Self {
            id: record.id,
            state: record.state,
            agent_config: record.agent_config,
            working_directory: record.working_directory,
            created_at: record.created_at,
            last_activity: record.last_activity,
            scrollback: Arc::new(Mutex::new(scrollback)),
            output_tx,
            pty_pid: None,
            completed_at_ms: None,
        }
    }

    /// Subscribe to live PTY output.
    pub fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    /// Send a chunk to all subscribers. No receivers is fine.
    pub fn broadcast_output(&self, data: Bytes) {
        let _ = self.output_tx.send(data);
    }

    /// The shared scrollback buffer.
    pub fn scrollback(&self) -> Arc<Mutex<ScrollbackBuffer>> {
        self.scrollback.clone()
    }

    pub fn to_summary(&self, client_count: Option<usize>) -> SessionSummary {
        SessionSummary {
            id: SessionId::new(self.id.clone()),
            state: self.state,
            working_directory: self.working_directory.clone(),
            agent_config: self.agent_config.clone(),
            created_at: self.created_at.clone(),
            last_activity: self.last_activity.clone(),
            client_count,
            pty_pid: self.pty_pid,
        }
    }
}
