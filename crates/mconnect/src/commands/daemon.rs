use std::io::{BufRead, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::ArgMatches;
use mconnect_protocol::{ClientRequest, DaemonResponse};
use tracing::{debug, error, info, warn};

use super::helpers;

pub(crate) fn handle_daemon_command(
    matches: &ArgMatches,
) -> Result<(), Box<dyn std::error::Error>> {
    match matches.subcommand() {
        Some(("start", sub)) => handle_daemon_start(sub),
        Some(("stop", sub)) => handle_daemon_stop(sub),
        Some(("restart", _)) => handle_daemon_restart(),
        Some(("status", sub)) => handle_daemon_status(sub),
        Some(("logs", sub)) => handle_daemon_logs(sub),
        Some(("install", sub)) => handle_daemon_install(sub),
        Some(("uninstall", _)) => handle_daemon_uninstall(),
        _ => Err("Unknown daemon subcommand".into()),
    }
}

/// Locate the daemon binary: sibling of the current executable first, then
/// `$PATH`.
fn find_daemon_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("mconnect-daemon");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("mconnect-daemon")
}

fn daemon_command_with_overrides(matches: &ArgMatches) -> std::process::Command {
    let mut cmd = std::process::Command::new(find_daemon_binary());
    if let Some(port) = matches.get_one::<u16>("port") {
        cmd.env("MCONNECT_PORT", port.to_string());
    }
    if let Some(ipc_path) = matches.get_one::<String>("ipc-path") {
        cmd.env("MCONNECT_IPC_PATH", ipc_path);
    }
    cmd
}

fn handle_daemon_start(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let foreground = matches.get_flag("foreground");

    info!(event = "cli.daemon.start_started", foreground = foreground);

    if helpers::daemon_alive() {
        let pid = read_daemon_pid()?;
        println!("Daemon already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        // Inherited stdio; blocks until the daemon exits.
        let status = daemon_command_with_overrides(matches)
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit())
            .stdin(std::process::Stdio::inherit())
            .status()
            .map_err(|e| format!("Failed to start daemon: {}", e))?;

        if !status.success() {
            error!(event = "cli.daemon.start_failed", exit_code = ?status.code());
            return Err(format!("Daemon exited with {}", status).into());
        }
        info!(event = "cli.daemon.start_completed");
        return Ok(());
    }

    // Detached background process. MCONNECT_DAEMON=1 switches it to
    // file logging.
    let mut child = daemon_command_with_overrides(matches)
        .env("MCONNECT_DAEMON", "1")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .stdin(std::process::Stdio::null())
        .spawn()
        .map_err(|e| format!("Failed to start daemon: {}", e))?;

    debug!(event = "cli.daemon.spawn_completed", pid = child.id());

    // Wait for the socket to come up, detecting early crashes.
    let socket_path = matches
        .get_one::<String>("ipc-path")
        .map(PathBuf::from)
        .unwrap_or_else(helpers::socket_path);
    let timeout = Duration::from_secs(5);
    let start = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                error!(event = "cli.daemon.start_failed", reason = "child_exited", status = %status);
                return Err(format!(
                    "Daemon exited with {} before becoming ready.\n\
                     Try: mconnect daemon start --foreground  (to see startup errors)",
                    status
                )
                .into());
            }
            Ok(None) => {}
            Err(e) => {
                debug!(event = "cli.daemon.child_status_check_failed", error = %e);
            }
        }

        let ping_ok = socket_path.exists()
            && mconnect_protocol::client::ping_daemon(&socket_path).unwrap_or(false);
        if ping_ok {
            break;
        }
        if start.elapsed() > timeout {
            eprintln!("Daemon started but socket not available after 5s.");
            eprintln!("Try: mconnect daemon start --foreground  (to see startup errors)");
            return Err("Daemon socket not available after 5s".into());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    match read_daemon_pid() {
        Ok(pid) => {
            println!("Daemon started (PID: {})", pid);
            info!(event = "cli.daemon.start_completed", pid = pid);
        }
        Err(e) => {
            warn!(event = "cli.daemon.pid_read_failed", error = %e);
            println!("Daemon started (PID unknown)");
            info!(event = "cli.daemon.start_completed");
        }
    }
    Ok(())
}

fn handle_daemon_stop(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let force = matches.get_flag("force");
    let timeout_ms = matches.get_one::<u64>("timeout").copied().unwrap_or(5_000);

    info!(event = "cli.daemon.stop_started", force = force);

    if !helpers::daemon_alive() {
        println!("Daemon is not running");
        return Ok(());
    }

    let pid = read_daemon_pid().ok();
    match helpers::request(&ClientRequest::Shutdown) {
        Ok(DaemonResponse::Ack) => {}
        Ok(other) => {
            warn!(event = "cli.daemon.unexpected_response", response = ?other);
        }
        Err(e) => {
            if !force {
                return Err(e);
            }
            warn!(event = "cli.daemon.shutdown_request_failed_continuing");
        }
    }

    // Wait for the PID file to disappear.
    let pid_file = helpers::paths().daemon_pid_file();
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if !pid_file.exists() {
            println!("Daemon stopped");
            info!(event = "cli.daemon.stop_completed");
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    if force {
        if let Some(pid) = pid {
            warn!(event = "cli.daemon.force_kill", pid = pid);
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            let _ = std::fs::remove_file(&pid_file);
            println!("Daemon force-killed (PID: {})", pid);
            return Ok(());
        }
    }

    helpers::print_error(&format!("daemon did not stop within {}ms", timeout_ms));
    Err("Daemon stop timed out".into())
}

fn handle_daemon_restart() -> Result<(), Box<dyn std::error::Error>> {
    info!(event = "cli.daemon.restart_started");
    if helpers::daemon_alive() {
        let stop_matches = crate::app::build_cli()
            .try_get_matches_from(["mconnect", "daemon", "stop"])
            .map_err(|e| e.to_string())?;
        let (_, sub) = stop_matches.subcommand().unwrap();
        let (_, stop_sub) = sub.subcommand().unwrap();
        handle_daemon_stop(stop_sub)?;
    }
    let start_matches = crate::app::build_cli()
        .try_get_matches_from(["mconnect", "daemon", "start"])
        .map_err(|e| e.to_string())?;
    let (_, sub) = start_matches.subcommand().unwrap();
    let (_, start_sub) = sub.subcommand().unwrap();
    handle_daemon_start(start_sub)?;
    info!(event = "cli.daemon.restart_completed");
    Ok(())
}

fn handle_daemon_status(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let json = matches.get_flag("json");
    info!(event = "cli.daemon.status_started");

    if !helpers::daemon_alive() {
        if json {
            println!("{}", serde_json::json!({"running": false}));
        } else {
            println!("Daemon: stopped");
        }
        return Ok(());
    }

    let status = match helpers::request(&ClientRequest::Status)? {
        DaemonResponse::Status { status } => status,
        other => {
            helpers::print_error(&format!("unexpected response: {:?}", other));
            return Err("Unexpected daemon response".into());
        }
    };

    if json {
        let mut value = serde_json::to_value(&status)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("running".to_string(), serde_json::Value::Bool(true));
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Daemon: running (PID: {})", status.pid);
        println!("Uptime: {}s", status.uptime_secs);
        println!("Port: {}", status.port);
        println!("Socket: {}", status.ipc_path);
        println!(
            "Sessions: {} ({} running)",
            status.session_count, status.running_sessions
        );
        println!("Clients: {}", status.connected_clients);
        if let Some(memory) = status.memory_bytes {
            println!("Memory: {} MB", memory / (1024 * 1024));
        }
    }
    Ok(())
}

fn handle_daemon_logs(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let lines = matches.get_one::<usize>("lines").copied().unwrap_or(50);
    let follow = matches.get_flag("follow");
    let log_path = helpers::paths().daemon_log();

    if !log_path.exists() {
        helpers::print_error(&format!("no log file at {}", log_path.display()));
        return Err("Log file not found".into());
    }

    let file = std::fs::File::open(&log_path)?;
    let mut reader = std::io::BufReader::new(file);

    // Tail: collect the last N lines.
    let all: Vec<String> = reader.by_ref().lines().map_while(Result::ok).collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{}", line);
    }

    if !follow {
        return Ok(());
    }

    // Follow: poll for appended data.
    let mut offset = reader.seek(SeekFrom::End(0))?;
    loop {
        std::thread::sleep(Duration::from_millis(500));
        let len = std::fs::metadata(&log_path)?.len();
        if len < offset {
            // Rotated: start over from the top of the new file.
            offset = 0;
        }
        if len > offset {
            let file = std::fs::File::open(&log_path)?;
            let mut reader = std::io::BufReader::new(file);
            reader.seek(SeekFrom::Start(offset))?;
            for line in reader.by_ref().lines().map_while(Result::ok) {
                println!("{}", line);
            }
            offset = len;
        }
    }
}

#[cfg(target_os = "linux")]
fn service_manifest_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let home = std::env::var("HOME").map_err(|_| "HOME is not set")?;
    Ok(PathBuf::from(home).join(".config/systemd/user/mconnect.service"))
}

#[cfg(target_os = "macos")]
fn service_manifest_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let home = std::env::var("HOME").map_err(|_| "HOME is not set")?;
    Ok(PathBuf::from(home).join("Library/LaunchAgents/com.mconnect.daemon.plist"))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn service_manifest_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    Err("service installation is not supported on this platform".into())
}

fn handle_daemon_install(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let no_start = matches.get_flag("no-start");
    let manifest_path = service_manifest_path().map_err(|e| {
        helpers::print_error(&e.to_string());
        e
    })?;
    let binary = find_daemon_binary();

    if let Some(parent) = manifest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(target_os = "linux")]
    let manifest = format!(
        "[Unit]\n\
         Description=MConnect terminal session daemon\n\n\
         [Service]\n\
         ExecStart={}\n\
         Environment=MCONNECT_DAEMON=1\n\
         Restart=on-failure\n\n\
         [Install]\n\
         WantedBy=default.target\n",
        binary.display()
    );

    #[cfg(target_os = "macos")]
    let manifest = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key><string>com.mconnect.daemon</string>
    <key>ProgramArguments</key><array><string>{}</string></array>
    <key>EnvironmentVariables</key><dict><key>MCONNECT_DAEMON</key><string>1</string></dict>
    <key>RunAtLoad</key><true/>
    <key>KeepAlive</key><true/>
</dict>
</plist>
"#,
        binary.display()
    );

    std::fs::write(&manifest_path, manifest)?;
    println!("Service manifest written to {}", manifest_path.display());
    info!(event = "cli.daemon.install_manifest_written", path = %manifest_path.display());

    if no_start {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        let status = std::process::Command::new("systemctl")
            .args(["--user", "enable", "--now", "mconnect.service"])
            .status();
        match status {
            Ok(s) if s.success() => println!("Service enabled and started"),
            _ => println!("Enable it with: systemctl --user enable --now mconnect.service"),
        }
    }

    #[cfg(target_os = "macos")]
    {
        let status = std::process::Command::new("launchctl")
            .arg("load")
            .arg(&manifest_path)
            .status();
        match status {
            Ok(s) if s.success() => println!("Service loaded"),
            _ => println!("Load it with: launchctl load {}", manifest_path.display()),
        }
    }

    Ok(())
}

fn handle_daemon_uninstall() -> Result<(), Box<dyn std::error::Error>> {
    let manifest_path = service_manifest_path().map_err(|e| {
        helpers::print_error(&e.to_string());
        e
    })?;

    if !manifest_path.exists() {
        println!("No service manifest installed");
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("systemctl")
            .args(["--user", "disable", "--now", "mconnect.service"])
            .status();
    }

    #[cfg(target_os = "macos")]
    {
        let _ = std::process::Command::new("launchctl")
            .arg("unload")
            .arg(&manifest_path)
            .status();
    }

    std::fs::remove_file(&manifest_path)?;
    println!("Service manifest removed");
    info!(event = "cli.daemon.uninstall_completed");
    Ok(())
}

fn read_daemon_pid() -> Result<u32, Box<dyn std::error::Error>> {
    let pid_file = helpers::paths().daemon_pid_file();
    let content = std::fs::read_to_string(&pid_file)
        .map_err(|e| format!("Cannot read daemon PID file: {}", e))?;
    content
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("Invalid PID in daemon PID file: {}", e).into())
}
