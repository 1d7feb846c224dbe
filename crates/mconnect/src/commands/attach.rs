use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use base64::Engine;
use clap::ArgMatches;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::termios;
use tracing::{error, info, warn};

use super::helpers;

pub(crate) fn handle_attach_command(
    matches: &ArgMatches,
) -> Result<(), Box<dyn std::error::Error>> {
    let session_id = matches
        .get_one::<String>("session")
        .ok_or("Session argument is required")?;

    info!(event = "cli.attach_started", session_id = %session_id);

    if let Err(e) = attach_to_session(session_id) {
        eprintln!("{}", e);
        error!(event = "cli.attach_failed", session_id = %session_id, error = %e);
        return Err(e);
    }

    info!(event = "cli.attach_completed", session_id = %session_id);
    Ok(())
}

fn attach_to_session(session_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = helpers::socket_path();
    let mut stream = UnixStream::connect(&socket_path).map_err(|e| {
        format!(
            "Cannot connect to daemon at {}: {}\nStart the daemon: mconnect daemon start",
            socket_path.display(),
            e
        )
    })?;

    let (cols, rows) = terminal_size();

    // Switch this connection into streaming attach mode.
    let attach_msg = serde_json::json!({
        "action": "session_attach",
        "sessionId": session_id,
        "clientType": "pc",
        "cols": cols,
        "rows": rows,
    });
    writeln!(stream, "{}", serde_json::to_string(&attach_msg)?)?;
    stream.flush()?;

    // Read the ack.
    let mut reader = std::io::BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    std::io::BufRead::read_line(&mut reader, &mut line)?;

    let ack: serde_json::Value = serde_json::from_str(line.trim())?;
    if ack.get("type").and_then(|t| t.as_str()) == Some("error") {
        let msg = match ack.get("message").and_then(|m| m.as_str()) {
            Some(m) => m.to_string(),
            None => {
                error!(event = "cli.attach.malformed_error_response", response = %ack);
                "Unknown error (daemon returned error with no message)".to_string()
            }
        };
        return Err(format!("Attach failed: {}", msg).into());
    }

    // Block SIGWINCH so a dedicated thread can catch it via sigwait()
    let mut sigwinch_set = SigSet::empty();
    sigwinch_set.add(Signal::SIGWINCH);
    sigwinch_set
        .thread_block()
        .map_err(|e| format!("Failed to block SIGWINCH: {}", e))?;

    // Enter raw terminal mode
    let _raw_guard = enable_raw_mode()?;

    // Stdin reader thread forwards keystrokes to the daemon.
    let mut write_stream = stream.try_clone()?;
    let stdin_handle = std::thread::spawn(move || {
        forward_stdin_to_daemon(&mut write_stream);
    });

    // SIGWINCH thread relays terminal resizes. It exits when its socket
    // write fails; we don't join() because it blocks on sigwait().
    let mut sigwinch_stream = stream.try_clone()?;
    let sigwinch_handle = std::thread::spawn(move || {
        handle_sigwinch(&sigwinch_set, &mut sigwinch_stream);
    });

    // Main thread: daemon output -> stdout.
    let result = forward_daemon_to_stdout(reader);

    drop(_raw_guard);
    eprintln!("\r\nDetached. Reconnect: mconnect session attach {}", session_id);

    if let Err(e) = stdin_handle.join() {
        error!(event = "cli.attach.stdin_thread_panicked", error = ?e);
    }
    drop(sigwinch_handle);

    result
}

fn terminal_size() -> (u16, u16) {
    use nix::libc;
    unsafe {
        let mut winsize: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize) == 0 {
            (winsize.ws_col, winsize.ws_row)
        } else {
            (80, 24)
        }
    }
}

struct RawModeGuard {
    original: termios::Termios,
}

fn enable_raw_mode() -> Result<RawModeGuard, Box<dyn std::error::Error>> {
    use std::os::fd::BorrowedFd;

    let stdin_fd = unsafe { BorrowedFd::borrow_raw(0) };
    let original = termios::tcgetattr(stdin_fd).map_err(|e| format!("tcgetattr failed: {}", e))?;

    let mut raw = original.clone();
    termios::cfmakeraw(&mut raw);
    // Re-enable ISIG so Ctrl+C generates SIGINT and detaches the attach
    // process; the daemon keeps the session alive.
    raw.local_flags.insert(termios::LocalFlags::ISIG);
    termios::tcsetattr(stdin_fd, termios::SetArg::TCSANOW, &raw)
        .map_err(|e| format!("tcsetattr failed: {}", e))?;

    Ok(RawModeGuard { original })
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use std::os::fd::BorrowedFd;
        let stdin_fd = unsafe { BorrowedFd::borrow_raw(0) };
        let _ = termios::tcsetattr(stdin_fd, termios::SetArg::TCSANOW, &self.original);
    }
}

/// Forward stdin bytes to the daemon as base64 `terminal_input` frames.
fn forward_stdin_to_daemon(stream: &mut UnixStream) {
    let stdin = std::io::stdin();
    let mut buf = [0u8; 4096];

    loop {
        let n = match stdin.lock().read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!(event = "cli.attach.stdin_read_failed", error = %e);
                eprintln!("\r\nStdin read failed. Detaching.");
                break;
            }
        };

        let encoded = base64::engine::general_purpose::STANDARD.encode(&buf[..n]);
        let input_msg = serde_json::json!({
            "type": "terminal_input",
            "data": encoded,
        });
        let serialized = match serde_json::to_string(&input_msg) {
            Ok(s) => s,
            Err(e) => {
                error!(event = "cli.attach.stdin_serialize_failed", error = %e);
                eprintln!("\r\nInput encoding failed. Detaching.");
                break;
            }
        };
        if let Err(e) = writeln!(stream, "{}", serialized) {
            error!(event = "cli.attach.stdin_write_failed", error = %e);
            eprintln!("\r\nConnection to daemon lost. Detaching.");
            break;
        }
        if let Err(e) = stream.flush() {
            error!(event = "cli.attach.stdin_flush_failed", error = %e);
            eprintln!("\r\nConnection to daemon lost. Detaching.");
            break;
        }
    }
}

/// Wait for SIGWINCH and relay `resize` frames so TUI apps render at the
/// right dimensions.
fn handle_sigwinch(sigset: &SigSet, stream: &mut UnixStream) {
    loop {
        match sigset.wait() {
            Ok(_sig) => {
                let (cols, rows) = terminal_size();
                let resize_msg = serde_json::json!({
                    "type": "resize",
                    "cols": cols,
                    "rows": rows,
                });
                let serialized = match serde_json::to_string(&resize_msg) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(event = "cli.attach.resize_serialize_failed", error = %e);
                        continue;
                    }
                };
                if let Err(e) = writeln!(stream, "{}", serialized) {
                    warn!(event = "cli.attach.resize_send_failed", error = %e);
                    break;
                }
                if let Err(e) = stream.flush() {
                    warn!(event = "cli.attach.resize_send_failed", error = %e);
                    break;
                }
                info!(event = "cli.attach.resize_sent", cols = cols, rows = rows);
            }
            Err(e) => {
                error!(event = "cli.attach.sigwinch_wait_failed", error = %e);
                break;
            }
        }
    }
}

fn forward_daemon_to_stdout(
    mut reader: std::io::BufReader<UnixStream>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut line = String::new();
    let mut stdout = std::io::stdout();

    loop {
        line.clear();
        let n = std::io::BufRead::read_line(&mut reader, &mut line)?;
        if n == 0 {
            break; // EOF
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let msg: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                error!(event = "cli.attach.parse_failed", error = %e);
                eprintln!("\r\nMalformed daemon message. Try: mconnect daemon restart");
                continue;
            }
        };

        match msg.get("type").and_then(|t| t.as_str()) {
            Some("output") => {
                if let Some(data) = msg.get("data").and_then(|d| d.as_str()) {
                    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(data) {
                        stdout.write_all(&decoded)?;
                        stdout.flush()?;
                    }
                }
            }
            Some("session_event") => {
                if msg.get("event").and_then(|e| e.as_str()) == Some("stopped") {
                    eprintln!("\r\nSession process exited.");
                    break;
                }
            }
            _ => {
                // Ignore other messages (attached ack echoes, etc.)
            }
        }
    }

    Ok(())
}
