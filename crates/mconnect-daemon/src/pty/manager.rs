use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::DaemonError;
use crate::pty::events::{ProcessInfo, PtyEvent, spawn_pty_reader, spawn_pty_waiter};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Options for spawning a session's PTY child.
#[derive(Debug, Clone)]
pub struct PtySpawnOptions {
    /// Program to run. Defaults to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    pub working_directory: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Extra environment on top of `TERM` and the session id variable.
    pub env: Vec<(String, String)>,
}

impl PtySpawnOptions {
    pub fn new(working_directory: PathBuf) -> Self {
        Self {
            shell: None,
            working_directory,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            env: Vec::new(),
        }
    }
}

/// Handle to a live PTY child.
///
/// The `Child` itself is owned by the waiter task so exits surface with a
/// real exit code; the map keeps a `ChildKiller` for kill requests.
struct ManagedPty {
    /// Master end of the PTY. Used for resize.
    ///
    /// Wrapped in a `Mutex` so `ManagedPty` is `Sync`: the trait object's
    /// concrete implementations hold a `RefCell` internally and are not
    /// `Sync` on their own, but `SessionManager` lives behind a
    /// `tokio::sync::RwLock`, which requires its contents to be `Sync`.
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Kill handle cloned off the child before it moved to the waiter task.
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Writer to PTY stdin. Wrapped in Arc<Mutex<>> because take_writer()
    /// can only be called once, but writes come from multiple contexts.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    pid: Option<u32>,
}

/// Spawns and supervises PTY children, at most one per session.
///
/// Emits `Spawn`/`Output`/`Exit` events on the channel handed to `new`; the
/// server loop routes them into scrollback and the hub.
pub struct ProcessManager {
    ptys: HashMap<String, ManagedPty>,
    event_tx: mpsc::UnboundedSender<PtyEvent>,
}

impl ProcessManager {
    pub fn new(event_tx: mpsc::UnboundedSender<PtyEvent>) -> Self {
        Self {
            ptys: HashMap::new(),
            event_tx,
        }
    }

    /// Create a PTY and spawn the session's child process in it.
    ///
    /// Fails if the session already has a process. Not retried on failure.
    pub fn spawn(
        &mut self,
        session_id: &str,
        opts: &PtySpawnOptions,
    ) -> Result<ProcessInfo, DaemonError> {
        if self.ptys.contains_key(session_id) {
            return Err(DaemonError::SessionAlreadyExists(session_id.to_string()));
        }

        let shell = opts.shell.clone().unwrap_or_else(|| {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        });

        let pty_system = native_pty_system();
        let size = PtySize {
            rows: opts.rows,
            cols: opts.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| DaemonError::PtyError(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(&opts.working_directory);
        cmd.env("TERM", "xterm-256color");
        cmd.env("MCONNECT_SESSION_ID", session_id);
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        info!(
            event = "daemon.pty.spawn_started",
            session_id = session_id,
            command = %shell,
            cols = opts.cols,
            rows = opts.rows,
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DaemonError::PtyError(format!("spawn: {}", e)))?;

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DaemonError::PtyError(format!("clone reader: {}", e)))?;

        // Take the writer once (portable-pty only allows one take_writer call)
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DaemonError::PtyError(format!("take writer: {}", e)))?;

        spawn_pty_reader(session_id.to_string(), reader, self.event_tx.clone());
        spawn_pty_waiter(session_id.to_string(), child, self.event_tx.clone());

        let managed = ManagedPty {
            master: Mutex::new(pair.master),
            killer,
            writer: Arc::new(Mutex::new(writer)),
            pid,
        };
        self.ptys.insert(session_id.to_string(), managed);

        let info = ProcessInfo {
            session_id: session_id.to_string(),
            pid,
            command: shell,
            cols: opts.cols,
            rows: opts.rows,
        };

        let _ = self.event_tx.send(PtyEvent::Spawn {
            session_id: session_id.to_string(),
            info: info.clone(),
        });

        info!(
            event = "daemon.pty.spawn_completed",
            session_id = session_id,
            pid = ?pid,
        );

        Ok(info)
    }

    /// Write bytes to a session's PTY stdin.
    ///
    /// Returns `Ok(false)` (a sentinel, not an error) when the session has no
    /// live process, so callers can answer the client instead of failing.
    pub fn write(&self, session_id: &str, data: &[u8]) -> Result<bool, DaemonError> {
        let Some(pty) = self.ptys.get(session_id) else {
            return Ok(false);
        };
        let mut writer = match pty.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer
            .write_all(data)
            .map_err(|e| DaemonError::PtyError(format!("write stdin: {}", e)))?;
        writer
            .flush()
            .map_err(|e| DaemonError::PtyError(format!("flush stdin: {}", e)))?;
        Ok(true)
    }

    /// Resize a session's PTY.
    pub fn resize(&mut self, session_id: &str, cols: u16, rows: u16) -> Result<(), DaemonError> {
        let pty = self
            .ptys
            .get_mut(session_id)
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?;
        let new_size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = match pty.master.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        master
            .resize(new_size)
            .map_err(|e| DaemonError::PtyError(format!("resize: {}", e)))?;
        debug!(
            event = "daemon.pty.resize_completed",
            session_id = session_id,
            cols = cols,
            rows = rows,
        );
        Ok(())
    }

    /// Terminate a session's child: SIGTERM by default, SIGKILL on `force`.
    ///
    /// The process record stays in the map until the waiter task reports the
    /// `Exit` event and the server loop calls `remove`.
    pub fn kill(&mut self, session_id: &str, force: bool) -> Result<(), DaemonError> {
        let pty = self
            .ptys
            .get_mut(session_id)
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?;

        info!(
            event = "daemon.pty.kill_started",
            session_id = session_id,
            force = force,
        );

        if !force {
            if let Some(pid) = pty.pid {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(
                            event = "daemon.pty.sigterm_failed",
                            session_id = session_id,
                            pid = pid,
                            error = %e,
                        );
                    }
                }
            }
        }

        pty.killer
            .kill()
            .map_err(|e| DaemonError::PtyError(format!("kill: {}", e)))?;
        Ok(())
    }

    /// Drop the process record after its `Exit` event was handled.
    pub fn remove(&mut self, session_id: &str) -> bool {
        let removed = self.ptys.remove(session_id).is_some();
        if removed {
            debug!(event = "daemon.pty.remove_completed", session_id = session_id);
        }
        removed
    }

    pub fn has_process(&self, session_id: &str) -> bool {
        self.ptys.contains_key(session_id)
    }

    pub fn pid(&self, session_id: &str) -> Option<u32> {
        self.ptys.get(session_id).and_then(|p| p.pid)
    }

    /// Number of live PTYs.
    pub fn count(&self) -> usize {
        self.ptys.len()
    }

    /// SIGTERM every child (shutdown path).
    pub fn kill_all(&mut self) {
        let ids: Vec<String> = self.ptys.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.kill(&id, false) {
                error!(
                    event = "daemon.pty.shutdown_kill_failed",
                    session_id = %id,
                    error = %e,
                );
            }
        }
    }
}
