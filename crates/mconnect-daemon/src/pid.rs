//! PID-file ownership.
//!
//! The daemon claims its PID file as a scoped resource: `PidFile::acquire`
//! refuses to start while a live daemon owns the path, replaces leftovers
//! from dead processes, and gives the file back on drop — so every exit
//! path, early startup errors included, releases it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::DaemonError;

/// What the PID file on disk currently records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PidProbe {
    /// A live process owns the file.
    Live(u32),
    /// The recorded process is gone.
    Stale(u32),
    /// Content is not a PID.
    Corrupt,
    /// No file.
    Vacant,
}

fn probe(path: &Path) -> PidProbe {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PidProbe::Vacant,
        Err(e) => {
            warn!(
                event = "daemon.pidfile.probe_failed",
                path = %path.display(),
                error = %e,
            );
            return PidProbe::Corrupt;
        }
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if process_alive(pid) => PidProbe::Live(pid),
        Ok(pid) => PidProbe::Stale(pid),
        Err(_) => PidProbe::Corrupt,
    }
}

/// `kill(pid, 0)`: existence check without delivering a signal. EPERM means
/// the process exists under another user and still counts as alive.
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Exclusive claim on the daemon's PID file, released on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Claim `path` for the current process.
    ///
    /// A live owner aborts the claim with `AlreadyRunning`; stale and
    /// corrupt files are replaced. The PID lands via a staging file and a
    /// rename, so a reader racing the claim never sees a torn write.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        match probe(path) {
            PidProbe::Live(pid) => return Err(DaemonError::AlreadyRunning(pid)),
            PidProbe::Stale(pid) => {
                warn!(
                    event = "daemon.pidfile.stale_replaced",
                    stale_pid = pid,
                    path = %path.display(),
                );
            }
            PidProbe::Corrupt => {
                warn!(
                    event = "daemon.pidfile.corrupt_replaced",
                    path = %path.display(),
                );
            }
            PidProbe::Vacant => {}
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let pid = std::process::id();
        let staging = path.with_extension("pid.tmp");
        fs::write(&staging, format!("{pid}\n"))?;
        fs::rename(&staging, path)?;

        debug!(
            event = "daemon.pidfile.acquired",
            pid = pid,
            path = %path.display(),
        );
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    /// The PID recorded in the file (this process).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(event = "daemon.pidfile.released", path = %self.path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    event = "daemon.pidfile.release_failed",
                    path = %self.path.display(),
                    error = %e,
                );
            }
        }
    }
}
