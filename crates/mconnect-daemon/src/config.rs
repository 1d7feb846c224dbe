use std::path::PathBuf;

use mconnect_paths::MconnectPaths;
use serde::{Deserialize, Serialize};

/// Daemon configuration.
///
/// Read from the `[daemon]` section of `$MCONNECT_HOME/config.toml`. Every
/// field has a default, so a missing file or section yields a fully working
/// configuration. Values are passed explicitly to component constructors; no
/// global mutable config exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// HTTP/WebSocket listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the Unix domain socket for the CLI.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Path to the PID file.
    #[serde(default = "default_pid_path")]
    pub pid_path: PathBuf,

    /// Path to the SQLite session store.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Milliseconds without PC input before the arbiter considers a PC idle.
    #[serde(default = "default_pc_idle_threshold_ms")]
    pub pc_idle_threshold_ms: u64,

    /// Grace window for a mobile client to finish its burst after a PC
    /// becomes active again.
    #[serde(default = "default_mobile_grace_period_ms")]
    pub mobile_grace_period_ms: u64,

    /// How long a mobile exclusive-control grant lasts before auto-release.
    #[serde(default = "default_exclusive_timeout_ms")]
    pub exclusive_timeout_ms: u64,

    /// Window within which near-simultaneous inputs from the previously
    /// entitled client are still honored.
    #[serde(default = "default_conflict_window_ms")]
    pub conflict_window_ms: u64,

    /// Maximum input bytes per client per rolling one-second window.
    #[serde(default = "default_input_rate_limit_cps")]
    pub input_rate_limit_cps: usize,

    /// Scrollback lines kept in memory per session.
    #[serde(default = "default_memory_lines")]
    pub memory_lines: usize,

    /// Total scrollback lines retained per session (memory + store).
    #[serde(default = "default_max_total_lines")]
    pub max_total_lines: usize,

    /// Lines moved to the store per spill transaction.
    #[serde(default = "default_spill_batch_size")]
    pub spill_batch_size: usize,

    /// Interval between server heartbeat frames.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence threshold after which a client is evicted.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Completed sessions older than this many hours are deleted by the sweep.
    #[serde(default = "default_cleanup_after_hours")]
    pub cleanup_after_hours: u64,

    /// Maximum number of concurrently live sessions.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,

    /// New WebSocket connections allowed per IP per 60-second window.
    #[serde(default = "default_connection_rate_limit")]
    pub connection_rate_limit: u32,

    /// Seconds to wait for graceful drain during shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Whether restored `running` sessions get a fresh PTY child at startup.
    /// Off by default: the store row is authoritative, the PTY is transient.
    #[serde(default)]
    pub respawn_on_restore: bool,
}

impl DaemonConfig {
    /// Validate configuration values.
    ///
    /// Called after loading config to catch misconfiguration early.
    pub fn validate(&self) -> Result<(), crate::errors::DaemonError> {
        use crate::errors::DaemonError;

        if self.memory_lines == 0 {
            return Err(DaemonError::ConfigInvalid(
                "memory_lines must be > 0".to_string(),
            ));
        }
        if self.spill_batch_size == 0 {
            return Err(DaemonError::ConfigInvalid(
                "spill_batch_size must be > 0".to_string(),
            ));
        }
        if self.max_total_lines < self.memory_lines {
            return Err(DaemonError::ConfigInvalid(
                "max_total_lines must be >= memory_lines".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(DaemonError::ConfigInvalid(
                "heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms * 2 {
            return Err(DaemonError::ConfigInvalid(
                "heartbeat_timeout_ms must cover at least two heartbeat intervals".to_string(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(DaemonError::ConfigInvalid(
                "max_concurrent_sessions must be > 0".to_string(),
            ));
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(DaemonError::ConfigInvalid(
                "shutdown_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.input_rate_limit_cps == 0 {
            return Err(DaemonError::ConfigInvalid(
                "input_rate_limit_cps must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Arbiter-facing slice of the configuration.
    pub fn arbiter(&self) -> crate::arbiter::ArbiterConfig {
        crate::arbiter::ArbiterConfig {
            pc_idle_threshold_ms: self.pc_idle_threshold_ms,
            mobile_grace_period_ms: self.mobile_grace_period_ms,
            exclusive_timeout_ms: self.exclusive_timeout_ms,
            conflict_window_ms: self.conflict_window_ms,
            input_rate_limit_cps: self.input_rate_limit_cps,
        }
    }

    /// Scrollback-facing slice of the configuration.
    pub fn scrollback(&self) -> crate::scrollback::ScrollbackConfig {
        crate::scrollback::ScrollbackConfig {
            memory_lines: self.memory_lines,
            max_total_lines: self.max_total_lines,
            spill_batch_size: self.spill_batch_size,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            socket_path: default_socket_path(),
            pid_path: default_pid_path(),
            db_path: default_db_path(),
            pc_idle_threshold_ms: default_pc_idle_threshold_ms(),
            mobile_grace_period_ms: default_mobile_grace_period_ms(),
            exclusive_timeout_ms: default_exclusive_timeout_ms(),
            conflict_window_ms: default_conflict_window_ms(),
            input_rate_limit_cps: default_input_rate_limit_cps(),
            memory_lines: default_memory_lines(),
            max_total_lines: default_max_total_lines(),
            spill_batch_size: default_spill_batch_size(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            cleanup_after_hours: default_cleanup_after_hours(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            connection_rate_limit: default_connection_rate_limit(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            respawn_on_restore: false,
        }
    }
}

fn fallback_paths() -> MconnectPaths {
    MconnectPaths::resolve().unwrap_or_else(|e| {
        tracing::warn!(
            event = "daemon.config.paths_fallback",
            error = %e,
            fallback = "/tmp/.mconnect",
        );
        MconnectPaths::from_dir(PathBuf::from("/tmp/.mconnect"))
    })
}

fn default_port() -> u16 {
    8847
}

fn default_socket_path() -> PathBuf {
    fallback_paths().daemon_socket()
}

fn default_pid_path() -> PathBuf {
    fallback_paths().daemon_pid_file()
}

fn default_db_path() -> PathBuf {
    fallback_paths().session_db()
}

fn default_pc_idle_threshold_ms() -> u64 {
    30_000
}

fn default_mobile_grace_period_ms() -> u64 {
    5_000
}

fn default_exclusive_timeout_ms() -> u64 {
    300_000
}

fn default_conflict_window_ms() -> u64 {
    100
}

fn default_input_rate_limit_cps() -> usize {
    100
}

fn default_memory_lines() -> usize {
    1_000
}

fn default_max_total_lines() -> usize {
    10_000
}

fn default_spill_batch_size() -> usize {
    100
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    90_000
}

fn default_cleanup_after_hours() -> u64 {
    24
}

fn default_max_concurrent_sessions() -> usize {
    5
}

fn default_connection_rate_limit() -> u32 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

/// Wrapper for deserializing the `[daemon]` section from a config file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    daemon: DaemonConfig,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
        }
    }
}

/// Load daemon configuration from `$MCONNECT_HOME/config.toml`.
///
/// Falls back to defaults if the file doesn't exist or the section is
/// missing; a malformed file is logged and ignored rather than fatal.
/// `MCONNECT_PORT` and `MCONNECT_IPC_PATH` override the file — that is how
/// `daemon start --port/--ipc-path` reaches the spawned daemon process.
pub fn load_daemon_config() -> Result<DaemonConfig, crate::errors::DaemonError> {
    let config_path = fallback_paths().user_config();

    let mut config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.daemon,
            Err(e) => {
                tracing::warn!(
                    event = "daemon.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                DaemonConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "daemon.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            DaemonConfig::default()
        }
    };

    if let Ok(port) = std::env::var("MCONNECT_PORT") {
        match port.parse::<u16>() {
            Ok(port) => config.port = port,
            Err(_) => {
                return Err(crate::errors::DaemonError::ConfigInvalid(format!(
                    "MCONNECT_PORT is not a valid port: {port}"
                )));
            }
        }
    }
    if let Ok(path) = std::env::var("MCONNECT_IPC_PATH") {
        if !path.is_empty() {
            config.socket_path = PathBuf::from(path);
        }
    }

    config.validate()?;
    Ok(config)
}
