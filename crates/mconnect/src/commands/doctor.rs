use mconnect_protocol::{ClientRequest, DaemonResponse, IpcConnection};
use owo_colors::OwoColorize;
use tracing::info;

use super::helpers;

struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
    fatal: bool,
}

/// Run local installation checks: data directory, daemon liveness, IPC
/// round-trip, store file, stale artifacts.
pub(crate) fn handle_doctor_command() -> Result<(), Box<dyn std::error::Error>> {
    info!(event = "cli.doctor_started");
    let paths = helpers::paths();
    let mut checks: Vec<Check> = Vec::new();

    // Data directory exists and is writable.
    let data_dir = paths.data_dir().to_path_buf();
    let dir_writable = match std::fs::create_dir_all(&data_dir) {
        Ok(()) => {
            let probe = data_dir.join(".doctor-probe");
            let ok = std::fs::write(&probe, b"ok").is_ok();
            let _ = std::fs::remove_file(&probe);
            ok
        }
        Err(_) => false,
    };
    checks.push(Check {
        name: "data directory",
        ok: dir_writable,
        detail: data_dir.display().to_string(),
        fatal: true,
    });

    // PID file consistency.
    let pid_file = paths.daemon_pid_file();
    let pid = std::fs::read_to_string(&pid_file)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    let socket_path = helpers::socket_path();
    let daemon_alive = helpers::daemon_alive();
    match (pid, daemon_alive) {
        (Some(pid), true) => checks.push(Check {
            name: "daemon",
            ok: true,
            detail: format!("running (PID: {})", pid),
            fatal: false,
        }),
        (None, false) => checks.push(Check {
            name: "daemon",
            ok: true,
            detail: "not running".to_string(),
            fatal: false,
        }),
        (Some(pid), false) => checks.push(Check {
            name: "daemon",
            ok: false,
            detail: format!(
                "stale PID file (PID {} not answering); remove {} or run: mconnect daemon start",
                pid,
                pid_file.display()
            ),
            fatal: false,
        }),
        (None, true) => checks.push(Check {
            name: "daemon",
            ok: true,
            detail: "running (no PID file)".to_string(),
            fatal: false,
        }),
    }

    // IPC round-trip with a status request.
    if daemon_alive {
        let ipc_ok = IpcConnection::connect(&socket_path)
            .and_then(|mut conn| conn.send(&ClientRequest::Status))
            .map(|resp| matches!(resp, DaemonResponse::Status { .. }))
            .unwrap_or(false);
        checks.push(Check {
            name: "ipc socket",
            ok: ipc_ok,
            detail: socket_path.display().to_string(),
            fatal: false,
        });
    } else {
        let stale_socket = socket_path.exists();
        checks.push(Check {
            name: "ipc socket",
            ok: !stale_socket,
            detail: if stale_socket {
                format!("stale socket at {}", socket_path.display())
            } else {
                "no socket (daemon stopped)".to_string()
            },
            fatal: false,
        });
    }

    // Session store file is readable when present.
    let db = paths.session_db();
    let db_ok = !db.exists() || std::fs::File::open(&db).is_ok();
    checks.push(Check {
        name: "session store",
        ok: db_ok,
        detail: if db.exists() {
            db.display().to_string()
        } else {
            "not created yet".to_string()
        },
        fatal: false,
    });

    // Log directory.
    let log = paths.daemon_log();
    checks.push(Check {
        name: "daemon log",
        ok: true,
        detail: if log.exists() {
            log.display().to_string()
        } else {
            "not created yet".to_string()
        },
        fatal: false,
    });

    let mut failed_fatal = false;
    for check in &checks {
        if check.ok {
            println!("{} {:<14} {}", "✔".green(), check.name, check.detail);
        } else {
            println!("{} {:<14} {}", "✘".red(), check.name, check.detail);
            if check.fatal {
                failed_fatal = true;
            }
        }
    }

    info!(
        event = "cli.doctor_completed",
        checks = checks.len(),
        failed = checks.iter().filter(|c| !c.ok).count(),
    );

    if failed_fatal {
        Err("doctor found fatal problems".into())
    } else {
        Ok(())
    }
}
