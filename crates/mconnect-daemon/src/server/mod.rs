pub mod shutdown;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::errors::DaemonError;
use crate::hub::protocol::ServerMessage;
use crate::hub::{HubState, SharedHub, run_http_server};
use crate::ipc;
use crate::pid::PidFile;
use crate::pty::PtyEvent;
use crate::registry::unix_now_ms;
use crate::session::SessionManager;
use crate::store::{SessionStore, now_rfc3339};

const ARBITER_TICK: Duration = Duration::from_secs(1);
const STALE_SWEEP: Duration = Duration::from_secs(30);
const CLEANUP_SWEEP: Duration = Duration::from_secs(60 * 60);

/// Run the daemon.
///
/// This is the main entrypoint. It:
/// 1. Claims the PID file, refusing to start when a live daemon owns it
/// 2. Opens the session store and restores persisted sessions
/// 3. Binds the Unix IPC socket and the HTTP/WebSocket listener
/// 4. Serves until SIGTERM/SIGINT or an IPC shutdown request
/// 5. Drains gracefully: SIGTERM children, flush scrollback, remove files
pub async fn run_server(config: DaemonConfig) -> Result<(), DaemonError> {
    let socket_path = config.socket_path.clone();

    // Held for the daemon's lifetime; dropping it on any exit path —
    // including the error returns below — releases the file.
    let pid_file = PidFile::acquire(&config.pid_path)?;

    let store = SessionStore::open(&config.db_path)?;

    let (pty_event_tx, mut pty_event_rx) = mpsc::unbounded_channel::<PtyEvent>();
    let mut manager = SessionManager::new(store.clone(), config.clone(), pty_event_tx);
    let restored = manager.initialize()?;
    let sessions = Arc::new(RwLock::new(manager));

    let shutdown = CancellationToken::new();
    let hub = HubState::new(config.clone(), sessions.clone(), store.clone(), shutdown.clone());

    tokio::spawn(shutdown::wait_for_shutdown_signal(shutdown.clone()));

    // IPC socket: fresh bind, restricted to the owning user.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        restrict_permissions(parent, 0o700);
    }
    let ipc_listener = UnixListener::bind(&socket_path)?;
    restrict_permissions(&socket_path, 0o600);

    let http_listener = TcpListener::bind(("127.0.0.1", config.port)).await?;

    info!(
        event = "daemon.server.started",
        pid = pid_file.pid(),
        port = config.port,
        socket = %socket_path.display(),
        restored_sessions = restored,
    );

    let http_hub = hub.clone();
    let http_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_http_server(http_hub, http_listener, http_shutdown).await {
            error!(event = "daemon.server.http_failed", error = %e);
        }
    });

    let started_at = Instant::now();
    let mut arbiter_tick = tokio::time::interval(ARBITER_TICK);
    let mut stale_sweep = tokio::time::interval(STALE_SWEEP);
    let mut cleanup_sweep = tokio::time::interval(CLEANUP_SWEEP);

    loop {
        tokio::select! {
            accept = ipc_listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let hub = hub.clone();
                        tokio::spawn(ipc::handle_connection(stream, hub, started_at));
                    }
                    Err(e) => {
                        error!(event = "daemon.server.ipc_accept_failed", error = %e);
                    }
                }
            }

            Some(event) = pty_event_rx.recv() => {
                handle_pty_event(&hub, event).await;
            }

            _ = arbiter_tick.tick() => {
                hub.tick_arbiters();
            }

            _ = stale_sweep.tick() => {
                run_stale_sweep(&hub).await;
            }

            _ = cleanup_sweep.tick() => {
                let removed = {
                    let mut mgr = hub.sessions.write().await;
                    mgr.cleanup_completed_sessions()
                };
                match removed {
                    Ok(ids) => {
                        for id in ids {
                            hub.tokens.invalidate(&id);
                            hub.drop_arbiter(&id);
                        }
                    }
                    Err(e) => {
                        warn!(event = "daemon.server.cleanup_failed", error = %e);
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!(event = "daemon.server.shutdown_started");
                break;
            }
        }
    }

    drain(&hub, &config).await;
    remove_socket_file(&socket_path);
    drop(pid_file);
    info!(event = "daemon.server.shutdown_completed");
    Ok(())
}

async fn handle_pty_event(hub: &SharedHub, event: PtyEvent) {
    match event {
        PtyEvent::Spawn { session_id, info } => {
            info!(
                event = "daemon.server.pty_spawned",
                session_id = %session_id,
                pid = ?info.pid,
            );
        }
        PtyEvent::Output { session_id, data } => {
            let mut mgr = hub.sessions.write().await;
            if let Err(e) = mgr.append_output(&session_id, &data) {
                warn!(
                    event = "daemon.server.output_append_failed",
                    session_id = %session_id,
                    error = %e,
                );
            }
        }
        PtyEvent::Exit {
            session_id,
            exit_code,
            signal: _,
        } => {
            let new_state = {
                let mut mgr = hub.sessions.write().await;
                mgr.handle_pty_exit(&session_id, exit_code)
            };
            if let Some(state) = new_state {
                hub.tokens.invalidate(&session_id);
                hub.broadcast(
                    &session_id,
                    &ServerMessage::SessionState {
                        session_id: session_id.clone(),
                        state,
                        last_activity: now_rfc3339(),
                    },
                );
            }
        }
    }
}

/// Evict clients that stopped heartbeating and drop expired completed-session
/// views.
async fn run_stale_sweep(hub: &SharedHub) {
    let now = unix_now_ms();
    let timeout = hub.config.heartbeat_timeout_ms;

    for client_id in hub.registry.stale_ids(timeout, now) {
        // The client's own connection loop closes its socket; this sweep
        // covers senderless (IPC) stragglers and bookkeeping rows.
        if let Some(client) = hub.registry.get(&client_id) {
            if client.sender.is_none() {
                hub.registry.remove(&client_id);
            }
        }
    }
    if let Err(e) = hub.store.remove_stale_clients(timeout) {
        warn!(event = "daemon.server.stale_client_sweep_failed", error = %e);
    }

    let mut mgr = hub.sessions.write().await;
    mgr.drop_expired_views(now);
}

/// Graceful drain: SIGTERM children, wait for their exits within the budget,
/// flush what remains.
async fn drain(hub: &SharedHub, config: &DaemonConfig) {
    {
        let mut mgr = hub.sessions.write().await;
        mgr.shutdown_all();
    }

    let deadline = Instant::now() + Duration::from_secs(config.shutdown_timeout_secs);
    loop {
        let remaining = {
            let mgr = hub.sessions.read().await;
            mgr.active_pty_count()
        };
        if remaining == 0 {
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                event = "daemon.server.drain_timeout",
                remaining_ptys = remaining,
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn restrict_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            warn!(
                event = "daemon.server.chmod_failed",
                path = %path.display(),
                error = %e,
            );
        }
    }
}

fn remove_socket_file(socket_path: &Path) {
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            error!(event = "daemon.server.socket_cleanup_failed", error = %e);
        }
    }
}
