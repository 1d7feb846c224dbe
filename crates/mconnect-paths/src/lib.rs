use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("home directory not found — set $HOME or $MCONNECT_HOME")]
    HomeNotFound,
}

/// Centralized path construction for the MConnect data directory.
///
/// Single source of truth for every path under the data directory. The
/// directory is `$MCONNECT_HOME` when set, otherwise `~/.mconnect`. Use
/// `resolve()` in production code and `from_dir()` in tests.
#[derive(Debug, Clone)]
pub struct MconnectPaths {
    data_dir: PathBuf,
}

impl MconnectPaths {
    /// Resolve the data directory from `$MCONNECT_HOME` or the home directory.
    pub fn resolve() -> Result<Self, PathError> {
        if let Some(dir) = std::env::var_os("MCONNECT_HOME") {
            if !dir.is_empty() {
                return Ok(Self {
                    data_dir: PathBuf::from(dir),
                });
            }
        }
        let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
        Ok(Self {
            data_dir: home.join(".mconnect"),
        })
    }

    /// Create paths from an explicit base directory. Use in tests.
    pub fn from_dir(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// The base data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // --- Top-level files ---

    pub fn session_db(&self) -> PathBuf {
        self.data_dir.join("sessions.db")
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }

    pub fn daemon_socket(&self) -> PathBuf {
        self.data_dir.join("daemon.sock")
    }

    pub fn user_config(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    // --- Logs ---

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.logs_dir().join("daemon.log")
    }

    /// Rotated log file: `daemon.log.1` .. `daemon.log.N`.
    pub fn rotated_log(&self, index: usize) -> PathBuf {
        self.logs_dir().join(format!("daemon.log.{index}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths() -> MconnectPaths {
        MconnectPaths::from_dir(PathBuf::from("/home/user/.mconnect"))
    }

    #[test]
    fn test_resolve_returns_ok_when_home_set() {
        // HOME is set in CI and dev environments
        let result = MconnectPaths::resolve();
        assert!(result.is_ok());
    }

    #[test]
    fn test_from_dir() {
        let paths = MconnectPaths::from_dir(PathBuf::from("/tmp/test-mconnect"));
        assert_eq!(paths.data_dir(), Path::new("/tmp/test-mconnect"));
    }

    #[test]
    fn test_session_db() {
        assert_eq!(
            test_paths().session_db(),
            PathBuf::from("/home/user/.mconnect/sessions.db")
        );
    }

    #[test]
    fn test_daemon_pid_file() {
        assert_eq!(
            test_paths().daemon_pid_file(),
            PathBuf::from("/home/user/.mconnect/daemon.pid")
        );
    }

    #[test]
    fn test_daemon_socket() {
        assert_eq!(
            test_paths().daemon_socket(),
            PathBuf::from("/home/user/.mconnect/daemon.sock")
        );
    }

    #[test]
    fn test_user_config() {
        assert_eq!(
            test_paths().user_config(),
            PathBuf::from("/home/user/.mconnect/config.toml")
        );
    }

    #[test]
    fn test_daemon_log() {
        assert_eq!(
            test_paths().daemon_log(),
            PathBuf::from("/home/user/.mconnect/logs/daemon.log")
        );
    }

    #[test]
    fn test_rotated_log() {
        assert_eq!(
            test_paths().rotated_log(3),
            PathBuf::from("/home/user/.mconnect/logs/daemon.log.3")
        );
    }

    #[test]
    fn test_path_error_message() {
        let err = PathError::HomeNotFound;
        let msg = err.to_string();
        assert!(msg.contains("MCONNECT_HOME"));
    }
}
