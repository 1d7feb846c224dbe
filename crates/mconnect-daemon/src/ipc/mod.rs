//! Local IPC server for the CLI.
//!
//! Line-delimited JSON over a Unix socket restricted to the owning user.
//! Requests get one response each within the 5-second budget; the
//! `session_attach` action switches the connection into streaming mode,
//! forwarding PTY bytes as `output` frames and accepting input/resize/
//! detach frames until EOF.

pub mod codec;

use std::time::{Duration, Instant};

use base64::Engine;
use mconnect_protocol::{AttachFrame, ClientRequest, ClientType, DaemonResponse, ErrorCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::hub::SharedHub;
use crate::hub::protocol::{ClientInfo, ServerMessage};
use crate::pairing::CODE_TTL_MS;
use crate::registry::{ConnectedClient, unix_now_ms};
use codec::{read_message, write_message};

/// Per-request processing budget.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn error_response(e: &DaemonError) -> DaemonResponse {
    DaemonResponse::Error {
        code: ErrorCode::from_code(e.error_code()),
        message: e.to_string(),
    }
}

/// Serve one IPC connection until EOF, a fatal error, or shutdown.
pub async fn handle_connection(stream: UnixStream, hub: SharedHub, started_at: Instant) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request: Option<ClientRequest> = tokio::select! {
            _ = hub.shutdown.cancelled() => break,
            result = read_message(&mut reader) => match result {
                Ok(request) => request,
                Err(e) => {
                    warn!(event = "daemon.ipc.request_parse_failed", error = %e);
                    let _ = write_message(&mut write_half, &error_response(&e)).await;
                    break;
                }
            },
        };
        let Some(request) = request else {
            break; // EOF
        };

        if let ClientRequest::SessionAttach {
            session_id,
            client_type,
            cols,
            rows,
        } = request
        {
            attach_stream(
                &hub,
                reader,
                &mut write_half,
                session_id,
                client_type,
                cols,
                rows,
            )
            .await;
            break;
        }

        let shutting_down = matches!(request, ClientRequest::Shutdown);
        let response = match tokio::time::timeout(
            REQUEST_TIMEOUT,
            dispatch(&hub, request, started_at),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => {
                let e = DaemonError::RequestTimeout;
                warn!(event = "daemon.ipc.request_timed_out");
                let _ = write_message(&mut write_half, &error_response(&e)).await;
                break;
            }
        };

        if write_message(&mut write_half, &response).await.is_err() {
            break;
        }
        if shutting_down {
            let _ = write_half.shutdown().await;
            break;
        }
    }
}

async fn dispatch(hub: &SharedHub, request: ClientRequest, started_at: Instant) -> DaemonResponse {
    match request {
        ClientRequest::Status => status(hub, started_at).await,

        ClientRequest::SessionList => {
            let mgr = hub.sessions.read().await;
            match mgr.list_summaries() {
                Ok(sessions) => DaemonResponse::SessionList { sessions },
                Err(e) => error_response(&e),
            }
        }

        ClientRequest::SessionCreate {
            working_directory,
            agent_config,
        } => {
            let result = {
                let mut mgr = hub.sessions.write().await;
                mgr.create(agent_config, working_directory)
            };
            match result {
                Ok(id) => {
                    // Pairing starts from the session token.
                    hub.tokens.issue(&id);
                    DaemonResponse::SessionCreated { id }
                }
                Err(e) => error_response(&e),
            }
        }

        ClientRequest::SessionKill { session_id, force } => {
            let result = {
                let mut mgr = hub.sessions.write().await;
                mgr.terminate_session(&session_id, force)
            };
            match result {
                Ok(killed) => {
                    if killed {
                        hub.tokens.invalidate(&session_id);
                        hub.drop_arbiter(&session_id);
                        let last_activity = crate::store::now_rfc3339();
                        hub.broadcast(
                            &session_id,
                            &ServerMessage::SessionState {
                                session_id: session_id.clone(),
                                state: mconnect_protocol::SessionState::Completed,
                                last_activity,
                            },
                        );
                    }
                    DaemonResponse::Killed { killed }
                }
                Err(e) => error_response(&e),
            }
        }

        ClientRequest::SessionExport { session_id } => {
            let result = {
                let mut mgr = hub.sessions.write().await;
                mgr.export_session(&session_id)
            };
            match result {
                Ok((lines, total_lines)) => DaemonResponse::Exported {
                    session_id,
                    lines,
                    total_lines,
                },
                Err(e) => error_response(&e),
            }
        }

        ClientRequest::PairCode { session_id } => {
            let known = {
                let mgr = hub.sessions.read().await;
                mgr.get_summary(&session_id)
            };
            match known {
                Ok(Some(_)) => {
                    let token = hub.tokens.issue(&session_id);
                    let now = unix_now_ms();
                    let code = hub.pairing.create_code(&session_id, &token, now);
                    DaemonResponse::PairingCode {
                        session_id,
                        code,
                        expires_at: now + CODE_TTL_MS,
                        port: hub.config.port,
                    }
                }
                Ok(None) => error_response(&DaemonError::SessionNotFound(session_id)),
                Err(e) => error_response(&e),
            }
        }

        ClientRequest::Shutdown => {
            info!(event = "daemon.ipc.shutdown_requested");
            hub.shutdown.cancel();
            DaemonResponse::Ack
        }

        ClientRequest::Ping => DaemonResponse::Pong,

        // Handled by the caller before dispatch.
        ClientRequest::SessionAttach { .. } => error_response(&DaemonError::ProtocolError(
            "attach cannot be dispatched".to_string(),
        )),
    }
}

async fn status(hub: &SharedHub, started_at: Instant) -> DaemonResponse {
    let (session_count, running_sessions) = {
        let mgr = hub.sessions.read().await;
        let all = mgr.list_summaries().map(|s| s.len()).unwrap_or(0);
        (all, mgr.running_count())
    };

    let memory_bytes = current_process_memory();

    DaemonResponse::Status {
        status: mconnect_protocol::DaemonStatusInfo {
            pid: std::process::id(),
            uptime_secs: started_at.elapsed().as_secs(),
            port: hub.config.port,
            ipc_path: hub.config.socket_path.display().to_string(),
            session_count,
            running_sessions,
            connected_clients: hub.registry.count(),
            memory_bytes,
        },
    }
}

fn current_process_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory())
}

/// Streaming attach: the IPC-side counterpart of a WS `session_attach`.
///
/// The connection becomes a bidirectional pipe: PTY output flows out as
/// base64 `output` frames, input/resize/detach frames flow in. The CLI
/// attach verb drives this in raw-TTY mode.
#[allow(clippy::too_many_arguments)]
async fn attach_stream(
    hub: &SharedHub,
    mut reader: BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    session_id: String,
    client_type: ClientType,
    cols: Option<u16>,
    rows: Option<u16>,
) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let now = unix_now_ms();

    let attach_result = {
        let mut mgr = hub.sessions.write().await;
        if mgr.session_state(&session_id) == Some(mconnect_protocol::SessionState::Completed) {
            Err(DaemonError::SessionCompleted(session_id.clone()))
        } else {
            mgr.attach_client(&session_id, &client_id, client_type, None)
                .and_then(|record| {
                    record.ok_or_else(|| DaemonError::SessionNotFound(session_id.clone()))
                })
        }
    };
    let record = match attach_result {
        Ok(record) => record,
        Err(e) => {
            let _ = write_message(writer, &error_response(&e)).await;
            return;
        }
    };

    let output_rx = {
        let mgr = hub.sessions.read().await;
        mgr.subscribe_output(&session_id)
    };
    let Some(mut output_rx) = output_rx else {
        let e = DaemonError::SessionNotFound(session_id.clone());
        let _ = write_message(writer, &error_response(&e)).await;
        return;
    };

    if let (Some(cols), Some(rows)) = (cols, rows) {
        let mut mgr = hub.sessions.write().await;
        if let Err(e) = mgr.resize(&session_id, cols, rows) {
            debug!(event = "daemon.ipc.attach_resize_failed", error = %e);
        }
    }

    hub.registry.register(ConnectedClient {
        id: client_id.clone(),
        session_id: Some(session_id.clone()),
        client_type,
        priority: record.priority,
        connected_at_ms: now,
        last_heartbeat_ms: now,
        user_agent: None,
        sender: None,
    });
    let events = hub.with_arbiter(&session_id, |arb| {
        arb.register_client(&client_id, client_type, record.priority, now)
    });
    hub.relay_control_events(&session_id, &events);
    hub.broadcast(
        &session_id,
        &ServerMessage::ClientJoined {
            client: ClientInfo {
                id: client_id.clone(),
                client_type,
                priority: record.priority,
            },
        },
    );

    if write_message(&mut *writer, &DaemonResponse::Attached {
        session_id: session_id.clone(),
    })
    .await
    .is_err()
    {
        detach_stream_client(hub, &session_id, &client_id).await;
        return;
    }

    // Replay the recent scrollback before live output starts.
    let snapshot = {
        let mgr = hub.sessions.read().await;
        mgr.scrollback_recent(&session_id, 1_000)
    };
    if let Ok((lines, _)) = snapshot {
        if !lines.is_empty() {
            let mut replay = String::new();
            for line in &lines {
                replay.push_str(&line.content);
                replay.push_str("\r\n");
            }
            let frame = DaemonResponse::Output {
                data: base64::engine::general_purpose::STANDARD.encode(replay.as_bytes()),
            };
            if write_message(&mut *writer, &frame).await.is_err() {
                detach_stream_client(hub, &session_id, &client_id).await;
                return;
            }
        }
    }

    info!(
        event = "daemon.ipc.attach_started",
        session_id = %session_id,
        client_id = %client_id,
    );

    // Frames are parsed on a dedicated task; a channel recv is cancel-safe
    // in the select loop where a partially-read line would not be.
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel::<AttachFrame>();
    let frame_reader = tokio::spawn(async move {
        loop {
            match read_message::<_, AttachFrame>(&mut reader).await {
                Ok(Some(frame)) => {
                    if frame_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(event = "daemon.ipc.attach_frame_invalid", error = %e);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = hub.shutdown.cancelled() => break,

            output = output_rx.recv() => {
                match output {
                    Ok(data) => {
                        let frame = DaemonResponse::Output {
                            data: base64::engine::general_purpose::STANDARD.encode(&data),
                        };
                        if write_message(&mut *writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            event = "daemon.ipc.attach_output_lagged",
                            session_id = %session_id,
                            dropped_chunks = n,
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        let _ = write_message(&mut *writer, &DaemonResponse::SessionEvent {
                            event: "stopped".to_string(),
                            session_id: session_id.clone(),
                        })
                        .await;
                        break;
                    }
                }
            }

            frame = frame_rx.recv() => {
                match frame {
                    Some(AttachFrame::TerminalInput { data }) => {
                        let decoded = match base64::engine::general_purpose::STANDARD.decode(&data) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(event = "daemon.ipc.attach_input_decode_failed", error = %e);
                                continue;
                            }
                        };
                        let (decision, events) = hub.with_arbiter(&session_id, |arb| {
                            arb.submit_input(&client_id, decoded.len(), unix_now_ms())
                        });
                        hub.relay_control_events(&session_id, &events);
                        hub.audit_input(
                            &session_id,
                            &client_id,
                            &String::from_utf8_lossy(&decoded),
                            decision.is_accepted(),
                            decision.reject_reason().map(|r| r.as_str()),
                        );
                        if !decision.is_accepted() {
                            continue;
                        }
                        let result = {
                            let mgr = hub.sessions.read().await;
                            mgr.write_input(&session_id, &decoded)
                        };
                        if let Err(e) = result {
                            warn!(
                                event = "daemon.ipc.attach_write_failed",
                                session_id = %session_id,
                                error = %e,
                            );
                        }
                    }
                    Some(AttachFrame::Resize { cols, rows }) => {
                        let mut mgr = hub.sessions.write().await;
                        if let Err(e) = mgr.resize(&session_id, cols, rows) {
                            debug!(event = "daemon.ipc.attach_resize_failed", error = %e);
                        }
                    }
                    Some(AttachFrame::SessionDetach) | None => break,
                }
            }
        }
    }

    frame_reader.abort();

    detach_stream_client(hub, &session_id, &client_id).await;
    info!(
        event = "daemon.ipc.attach_completed",
        session_id = %session_id,
        client_id = %client_id,
    );
}

async fn detach_stream_client(hub: &SharedHub, session_id: &str, client_id: &str) {
    hub.registry.remove(client_id);
    let events = hub.with_arbiter(session_id, |arb| {
        arb.unregister_client(client_id, unix_now_ms())
    });
    hub.relay_control_events(session_id, &events);
    {
        let mut mgr = hub.sessions.write().await;
        if let Err(e) = mgr.detach_client(client_id) {
            debug!(event = "daemon.ipc.detach_persist_failed", error = %e);
        }
    }
    hub.broadcast(
        session_id,
        &ServerMessage::ClientLeft {
            client_id: client_id.to_string(),
        },
    );
}
