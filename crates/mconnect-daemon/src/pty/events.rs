use std::io::Read;

use tokio::sync::mpsc;
use tracing::{debug, error};

/// Descriptor for a spawned PTY child, returned from `spawn` and carried by
/// the `Spawn` event.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub session_id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub cols: u16,
    pub rows: u16,
}

/// Events emitted by the process manager's background tasks.
///
/// All events for one session are produced in order: `Spawn`, zero or more
/// `Output` chunks, then exactly one `Exit` before the process record is
/// removed.
#[derive(Debug)]
pub enum PtyEvent {
    Spawn {
        session_id: String,
        info: ProcessInfo,
    },
    Output {
        session_id: String,
        data: Vec<u8>,
    },
    Exit {
        session_id: String,
        exit_code: Option<u32>,
        signal: Option<String>,
    },
}

/// Spawn a blocking task that reads PTY output and forwards chunks as
/// `Output` events. The task exits on EOF (child gone) or read error.
pub fn spawn_pty_reader(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    event_tx: mpsc::UnboundedSender<PtyEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(event = "daemon.pty.reader_eof", session_id = session_id);
                    break;
                }
                Ok(n) => {
                    // Send errors mean the server loop is gone; stop reading.
                    if event_tx
                        .send(PtyEvent::Output {
                            session_id: session_id.clone(),
                            data: buf[..n].to_vec(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        event = "daemon.pty.reader_error",
                        session_id = session_id,
                        error = %e,
                    );
                    break;
                }
            }
        }
    })
}

/// Spawn a blocking task that waits for the child to terminate and emits the
/// `Exit` event with its exit code.
pub fn spawn_pty_waiter(
    session_id: String,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    event_tx: mpsc::UnboundedSender<PtyEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let exit_code = match child.wait() {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                error!(
                    event = "daemon.pty.wait_failed",
                    session_id = session_id,
                    error = %e,
                );
                None
            }
        };
        debug!(
            event = "daemon.pty.child_exited",
            session_id = session_id,
            exit_code = ?exit_code,
        );
        let _ = event_tx.send(PtyEvent::Exit {
            session_id,
            exit_code,
            // portable-pty folds termination signals into the exit code.
            signal: None,
        });
    })
}
