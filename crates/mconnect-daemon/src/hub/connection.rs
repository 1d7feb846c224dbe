//! Per-connection WebSocket lifecycle.
//!
//! Upgrade → register → `auth_success` + `session_list` → pump loop. One
//! writer per socket: broadcast frames arrive on the registry queue, PTY
//! output on the session's broadcast channel, heartbeats on a timer. A
//! client that misses heartbeat acks past the timeout is closed with code
//! 1000 and reason `Heartbeat timeout`.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use mconnect_protocol::{ClientType, Priority};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::hub::protocol::{ClientFrame, ClientInfo, PROTOCOL_VERSION, ServerMessage, error_codes};
use crate::hub::{SharedHub, control_status_frame};
use crate::registry::{ConnectedClient, unix_now_ms};

const HEARTBEAT_CLOSE_REASON: &str = "Heartbeat timeout";

struct ConnCtx {
    client_id: String,
    client_type: ClientType,
    /// Session the bearer token authorizes.
    session_scope: String,
    attached: Option<String>,
    output_rx: Option<broadcast::Receiver<Bytes>>,
    last_ack_ms: u64,
}

enum OutputEvent {
    Data(Bytes),
    Lagged(u64),
    Closed,
}

async fn recv_output(rx: &mut Option<broadcast::Receiver<Bytes>>) -> OutputEvent {
    match rx {
        Some(rx) => match rx.recv().await {
            Ok(data) => OutputEvent::Data(data),
            Err(broadcast::error::RecvError::Lagged(n)) => OutputEvent::Lagged(n),
            Err(broadcast::error::RecvError::Closed) => OutputEvent::Closed,
        },
        None => std::future::pending().await,
    }
}

pub async fn handle_socket(
    state: SharedHub,
    socket: WebSocket,
    client_type: ClientType,
    session_scope: String,
    user_agent: Option<String>,
) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let now = unix_now_ms();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.registry.register(ConnectedClient {
        id: client_id.clone(),
        session_id: None,
        client_type,
        priority: Priority::default_for(client_type),
        connected_at_ms: now,
        last_heartbeat_ms: now,
        user_agent: user_agent.clone(),
        sender: Some(out_tx.clone()),
    });

    info!(
        event = "daemon.hub.connection_opened",
        client_id = %client_id,
        client_type = %client_type,
    );

    let _ = out_tx.send(ServerMessage::AuthSuccess {
        client_id: client_id.clone(),
        protocol_version: PROTOCOL_VERSION,
        client_type,
    });
    let sessions = {
        let mgr = state.sessions.read().await;
        mgr.list_summaries().unwrap_or_default()
    };
    let _ = out_tx.send(ServerMessage::SessionList { sessions });

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut ctx = ConnCtx {
        client_id: client_id.clone(),
        client_type,
        session_scope,
        attached: None,
        output_rx: None,
        last_ack_ms: now,
    };

    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat_interval_ms));
    // The first tick fires immediately; consume it so heartbeats start one
    // interval in.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }

            Some(msg) = out_rx.recv() => {
                if send_frame(&mut ws_tx, &msg).await.is_err() {
                    break;
                }
            }

            output = recv_output(&mut ctx.output_rx) => {
                match output {
                    OutputEvent::Data(data) => {
                        let frame = ServerMessage::TerminalOutput {
                            data: String::from_utf8_lossy(&data).into_owned(),
                            agent_id: None,
                        };
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    OutputEvent::Lagged(n) => {
                        // Congested client: dropped output is recoverable via
                        // scrollback_request.
                        warn!(
                            event = "daemon.hub.output_lagged",
                            client_id = %ctx.client_id,
                            dropped_chunks = n,
                        );
                    }
                    OutputEvent::Closed => {
                        ctx.output_rx = None;
                    }
                }
            }

            _ = heartbeat.tick() => {
                let now = unix_now_ms();
                if now.saturating_sub(ctx.last_ack_ms) >= state.config.heartbeat_timeout_ms {
                    info!(
                        event = "daemon.hub.heartbeat_timeout",
                        client_id = %ctx.client_id,
                    );
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: HEARTBEAT_CLOSE_REASON.into(),
                        })))
                        .await;
                    break;
                }
                let frame = ServerMessage::Heartbeat { timestamp: now };
                if send_frame(&mut ws_tx, &frame).await.is_err() {
                    break;
                }
            }

            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => handle_frame(&state, &mut ctx, frame, &out_tx).await,
                            Err(e) => {
                                debug!(
                                    event = "daemon.hub.frame_parse_failed",
                                    client_id = %ctx.client_id,
                                    error = %e,
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(
                            event = "daemon.hub.socket_error",
                            client_id = %ctx.client_id,
                            error = %e,
                        );
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state, &mut ctx).await;
    info!(
        event = "daemon.hub.connection_closed",
        client_id = %client_id,
    );
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!(event = "daemon.hub.frame_serialize_failed", error = %e);
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await
}

async fn handle_frame(
    state: &SharedHub,
    ctx: &mut ConnCtx,
    frame: ClientFrame,
    out_tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match frame {
        ClientFrame::SessionAttach { session_id } => {
            handle_attach(state, ctx, session_id, out_tx).await;
        }

        ClientFrame::SessionDetach {} => {
            handle_detach(state, ctx).await;
        }

        ClientFrame::TerminalInput { data, .. } => {
            handle_input(state, ctx, data, out_tx).await;
        }

        ClientFrame::Resize { cols, rows } => {
            let Some(session_id) = ctx.attached.clone() else {
                let _ = out_tx.send(error_frame("not attached", error_codes::NOT_ATTACHED));
                return;
            };
            let mut mgr = state.sessions.write().await;
            if let Err(e) = mgr.resize(&session_id, cols, rows) {
                debug!(
                    event = "daemon.hub.resize_failed",
                    session_id = %session_id,
                    error = %e,
                );
            }
        }

        ClientFrame::ScrollbackRequest {
            session_id,
            from_line,
            count,
        } => {
            let count = count.min(1_000);
            let result = {
                let mgr = state.sessions.read().await;
                mgr.scrollback_range(&session_id, from_line, count)
            };
            match result {
                Ok((lines, total_lines)) => {
                    let first = lines.first().map(|l| l.line_number).unwrap_or(from_line);
                    let _ = out_tx.send(ServerMessage::ScrollbackResponse {
                        session_id,
                        lines: lines.into_iter().map(|l| l.content).collect(),
                        from_line: first,
                        total_lines,
                    });
                }
                Err(e) => {
                    let _ = out_tx.send(error_frame(&e.to_string(), error_codes::INTERNAL_ERROR));
                }
            }
        }

        ClientFrame::ControlRequest { action } => {
            handle_control_request(state, ctx, &action, out_tx);
        }

        ClientFrame::HeartbeatAck { .. } => {
            let now = unix_now_ms();
            ctx.last_ack_ms = now;
            state.registry.heartbeat(&ctx.client_id, now);
            if let Err(e) = state.store.update_client_heartbeat(&ctx.client_id) {
                debug!(event = "daemon.hub.heartbeat_persist_failed", error = %e);
            }
        }

        ClientFrame::Ping => {
            let _ = out_tx.send(ServerMessage::Pong);
        }

        ClientFrame::ApprovalResponse {
            approval_id,
            approved,
        } => {
            if let Some(held) = state.approvals.resolve(&approval_id, approved) {
                let mgr = state.sessions.read().await;
                match mgr.write_input(&held.session_id, held.data.as_bytes()) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            event = "daemon.hub.approved_input_dropped",
                            session_id = %held.session_id,
                        );
                    }
                    Err(e) => {
                        warn!(
                            event = "daemon.hub.approved_input_failed",
                            session_id = %held.session_id,
                            error = %e,
                        );
                    }
                }
            }
        }

        ClientFrame::Unknown => {
            debug!(
                event = "daemon.hub.unknown_frame_ignored",
                client_id = %ctx.client_id,
            );
        }
    }
}

async fn handle_attach(
    state: &SharedHub,
    ctx: &mut ConnCtx,
    session_id: String,
    out_tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    // Bearer tokens are scoped to one session.
    if session_id != ctx.session_scope {
        let _ = out_tx.send(error_frame(
            "token not valid for this session",
            error_codes::AUTH_FAILED,
        ));
        return;
    }

    // Leaving a previous attachment is implicit in re-attach.
    if ctx.attached.is_some() {
        handle_detach(state, ctx).await;
    }

    let attach_result = {
        let mut mgr = state.sessions.write().await;
        match mgr.session_state(&session_id) {
            Some(mconnect_protocol::SessionState::Completed) => {
                Err(DaemonError::SessionCompleted(session_id.clone()))
            }
            _ => mgr
                .attach_client(
                    &session_id,
                    &ctx.client_id,
                    ctx.client_type,
                    state.registry.get(&ctx.client_id).and_then(|c| c.user_agent),
                )
                .and_then(|record| {
                    record.ok_or_else(|| DaemonError::SessionNotFound(session_id.clone()))
                }),
        }
    };

    let record = match attach_result {
        Ok(record) => record,
        Err(e) => {
            let code = match &e {
                DaemonError::SessionCompleted(_) => error_codes::SESSION_COMPLETED,
                DaemonError::SessionNotFound(_) => error_codes::SESSION_NOT_FOUND,
                _ => error_codes::INTERNAL_ERROR,
            };
            let _ = out_tx.send(error_frame(&e.to_string(), code));
            return;
        }
    };

    state.registry.attach(&ctx.client_id, &session_id);
    ctx.attached = Some(session_id.clone());
    ctx.output_rx = {
        let mgr = state.sessions.read().await;
        mgr.subscribe_output(&session_id)
    };

    let events = state.with_arbiter(&session_id, |arb| {
        arb.register_client(
            &ctx.client_id,
            ctx.client_type,
            record.priority,
            unix_now_ms(),
        )
    });
    state.relay_control_events(&session_id, &events);

    // Catch-up snapshot, then the current control state, then live output.
    let snapshot = {
        let mgr = state.sessions.read().await;
        mgr.scrollback_recent(&session_id, 1_000)
    };
    if let Ok((lines, total_lines)) = snapshot {
        let first = lines.first().map(|l| l.line_number).unwrap_or(0);
        let _ = out_tx.send(ServerMessage::ScrollbackResponse {
            session_id: session_id.clone(),
            lines: lines.into_iter().map(|l| l.content).collect(),
            from_line: first,
            total_lines,
        });
    }
    let status = state.with_arbiter(&session_id, |arb| arb.status());
    let _ = out_tx.send(control_status_frame(&session_id, &status));

    state.broadcast(
        &session_id,
        &ServerMessage::ClientJoined {
            client: ClientInfo {
                id: ctx.client_id.clone(),
                client_type: ctx.client_type,
                priority: record.priority,
            },
        },
    );
}

async fn handle_detach(state: &SharedHub, ctx: &mut ConnCtx) {
    let Some(session_id) = ctx.attached.take() else {
        return;
    };
    ctx.output_rx = None;
    state.registry.detach(&ctx.client_id);

    let events =
        state.with_arbiter(&session_id, |arb| arb.unregister_client(&ctx.client_id, unix_now_ms()));
    state.relay_control_events(&session_id, &events);

    {
        let mut mgr = state.sessions.write().await;
        if let Err(e) = mgr.detach_client(&ctx.client_id) {
            debug!(event = "daemon.hub.detach_persist_failed", error = %e);
        }
    }

    state.broadcast(
        &session_id,
        &ServerMessage::ClientLeft {
            client_id: ctx.client_id.clone(),
        },
    );
}

async fn handle_input(
    state: &SharedHub,
    ctx: &mut ConnCtx,
    data: String,
    out_tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    let Some(session_id) = ctx.attached.clone() else {
        let _ = out_tx.send(error_frame("not attached", error_codes::NOT_ATTACHED));
        return;
    };

    let (decision, events) = state.with_arbiter(&session_id, |arb| {
        arb.submit_input(&ctx.client_id, data.len(), unix_now_ms())
    });
    state.relay_control_events(&session_id, &events);

    let reject_reason = decision.reject_reason().map(|r| r.as_str());
    state.audit_input(
        &session_id,
        &ctx.client_id,
        &data,
        decision.is_accepted(),
        reject_reason,
    );

    if let Some(reason) = reject_reason {
        let _ = out_tx.send(ServerMessage::InputRejected {
            reason: reason.to_string(),
        });
        return;
    }

    // Guardrails check fires on line-terminated input.
    if data.ends_with('\n') || data.ends_with('\r') {
        let command = data.trim_end();
        let verdict = state.policy.check(command);
        if verdict.blocked {
            info!(
                event = "daemon.hub.command_blocked",
                session_id = %session_id,
                client_id = %ctx.client_id,
            );
            state.broadcast(
                &session_id,
                &ServerMessage::CommandBlocked {
                    session_id: session_id.clone(),
                    reason: verdict.reason,
                },
            );
            return;
        }
        if verdict.requires_approval {
            let approval_id = state.approvals.hold(&session_id, &ctx.client_id, &data);
            state.broadcast(
                &session_id,
                &ServerMessage::ApprovalRequest {
                    approval_id,
                    session_id: session_id.clone(),
                    command: command.to_string(),
                },
            );
            return;
        }
    }

    let write_result = {
        let mgr = state.sessions.read().await;
        mgr.write_input(&session_id, data.as_bytes())
    };
    match write_result {
        Ok(true) => {}
        Ok(false) => {
            let _ = out_tx.send(error_frame(
                "session has no live process",
                error_codes::INTERNAL_ERROR,
            ));
        }
        Err(DaemonError::SessionCompleted(_)) => {
            let _ = out_tx.send(error_frame("session completed", error_codes::SESSION_COMPLETED));
        }
        Err(e) => {
            let _ = out_tx.send(error_frame(&e.to_string(), error_codes::INTERNAL_ERROR));
        }
    }
}

fn handle_control_request(
    state: &SharedHub,
    ctx: &mut ConnCtx,
    action: &str,
    out_tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    let Some(session_id) = ctx.attached.clone() else {
        let _ = out_tx.send(error_frame("not attached", error_codes::NOT_ATTACHED));
        return;
    };

    match action {
        "exclusive" => {
            let (outcome, events) = state.with_arbiter(&session_id, |arb| {
                arb.request_exclusive(&ctx.client_id, unix_now_ms())
            });
            state.relay_control_events(&session_id, &events);
            if outcome.granted {
                state.registry.set_priority(&ctx.client_id, Priority::Exclusive);
                if let Err(e) = state
                    .store
                    .update_client_priority(&ctx.client_id, Priority::Exclusive)
                {
                    debug!(event = "daemon.hub.priority_persist_failed", error = %e);
                }
            }
            let _ = out_tx.send(ServerMessage::ControlResponse {
                granted: outcome.granted,
                reason: outcome.reason.map(|r| r.as_str().to_string()),
                expires_at: outcome.expires_at_ms,
            });
        }
        "release" => {
            let (released, events) = state.with_arbiter(&session_id, |arb| {
                arb.release_exclusive(&ctx.client_id, unix_now_ms())
            });
            state.relay_control_events(&session_id, &events);
            if released {
                state.registry.set_priority(&ctx.client_id, Priority::Normal);
                if let Err(e) = state
                    .store
                    .update_client_priority(&ctx.client_id, Priority::Normal)
                {
                    debug!(event = "daemon.hub.priority_persist_failed", error = %e);
                }
            }
            let _ = out_tx.send(ServerMessage::ControlResponse {
                granted: released,
                reason: None,
                expires_at: None,
            });
        }
        other => {
            debug!(
                event = "daemon.hub.unknown_control_action",
                client_id = %ctx.client_id,
                action = other,
            );
        }
    }
}

async fn cleanup(state: &SharedHub, ctx: &mut ConnCtx) {
    handle_detach(state, ctx).await;
    state.registry.remove(&ctx.client_id);
}

fn error_frame(message: &str, code: &'static str) -> ServerMessage {
    ServerMessage::Error {
        message: message.to_string(),
        code,
    }
}
