//! Daemon logging: JSON lines to a size-rotated file under the data
//! directory.
//!
//! Rotation happens inline on the write path: when `daemon.log` exceeds
//! `MAX_LOG_SIZE` the files shift `daemon.log.4 -> .5`, ..., `daemon.log ->
//! .1` and a fresh file is opened. At most `MAX_ROTATED_FILES` rotations are
//! kept.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use mconnect_paths::MconnectPaths;
use tracing_subscriber::EnvFilter;

const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
const MAX_ROTATED_FILES: usize = 5;

/// A `Write` implementation that rotates the underlying file by size.
pub struct RotatingLogWriter {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    max_rotated: usize,
}

impl RotatingLogWriter {
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        Self::with_limits(path, MAX_LOG_SIZE, MAX_ROTATED_FILES)
    }

    pub fn with_limits(path: PathBuf, max_size: u64, max_rotated: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
            max_size,
            max_rotated,
        })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;

        let rotated = |i: usize| {
            let mut name = self.path.as_os_str().to_owned();
            name.push(format!(".{i}"));
            PathBuf::from(name)
        };

        // Shift daemon.log.(N-1) -> .N, dropping the oldest.
        let _ = std::fs::remove_file(rotated(self.max_rotated));
        for i in (1..self.max_rotated).rev() {
            let from = rotated(i);
            if from.exists() {
                std::fs::rename(&from, rotated(i + 1))?;
            }
        }
        std::fs::rename(&self.path, rotated(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Shared handle so the subscriber can hand out writers per log call.
#[derive(Clone)]
pub struct SharedLogWriter(Arc<Mutex<RotatingLogWriter>>);

impl SharedLogWriter {
    pub fn new(writer: RotatingLogWriter) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }
}

impl Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut w) => w.write(buf),
            Err(poisoned) => poisoned.into_inner().write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut w) => w.flush(),
            Err(poisoned) => poisoned.into_inner().flush(),
        }
    }
}

/// Initialize daemon logging.
///
/// Foreground mode logs human-readable lines to stderr; daemonized mode logs
/// JSON lines to the rotating file under `logs/`. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_daemon_logging(foreground: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if foreground {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return;
    }

    let log_path = MconnectPaths::resolve()
        .unwrap_or_else(|_| MconnectPaths::from_dir(PathBuf::from("/tmp/.mconnect")))
        .daemon_log();

    match RotatingLogWriter::open(log_path) {
        Ok(writer) => {
            let shared = SharedLogWriter::new(writer);
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(move || shared.clone())
                .init();
        }
        Err(e) => {
            // Fall back to stderr rather than running blind.
            eprintln!("mconnect-daemon: cannot open log file: {e}");
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let mut w = RotatingLogWriter::with_limits(path.clone(), 1024, 2).unwrap();
        w.write_all(b"hello\n").unwrap();
        w.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn test_rotation_at_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let mut w = RotatingLogWriter::with_limits(path.clone(), 10, 3).unwrap();

        w.write_all(b"aaaaaaaa\n").unwrap(); // 9 bytes
        w.write_all(b"bbbbbbbb\n").unwrap(); // would exceed 10 -> rotate first
        w.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "bbbbbbbb\n");
        let rotated = dir.path().join("daemon.log.1");
        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "aaaaaaaa\n");
    }

    #[test]
    fn test_rotation_keeps_bounded_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let mut w = RotatingLogWriter::with_limits(path.clone(), 4, 2).unwrap();

        for i in 0..5 {
            w.write_all(format!("{i}{i}{i}\n").as_bytes()).unwrap();
        }
        w.flush().unwrap();

        // Only .1 and .2 may exist; .3 must never be created.
        assert!(dir.path().join("daemon.log.1").exists());
        assert!(dir.path().join("daemon.log.2").exists());
        assert!(!dir.path().join("daemon.log.3").exists());
    }

    #[test]
    fn test_reopen_counts_existing_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        std::fs::write(&path, "existing").unwrap();
        let w = RotatingLogWriter::with_limits(path, 1024, 2).unwrap();
        assert_eq!(w.written, 8);
    }
}
