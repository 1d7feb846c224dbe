//! WebSocket hub and HTTP surface.
//!
//! Terminates WebSocket connections at `GET /?token=…` (protocol v2),
//! serves the pairing exchange at `GET /api/pair`, and routes frames
//! between clients, the session manager, and the per-session input
//! arbiters. CORS is permissive; auth is the bearer token resolved against
//! the token store.

pub mod connection;
pub mod protocol;
pub mod ratelimit;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::Router;
use axum::body::Body;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, Query, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use mconnect_protocol::ClientType;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::arbiter::{ControlEvent, ControlStatus, InputArbiter};
use crate::config::DaemonConfig;
use crate::guardrails::{AllowAllPolicy, CommandPolicy, PendingApprovals};
use crate::pairing::{PairingManager, TokenStore, ValidateOutcome};
use crate::registry::{ClientRegistry, unix_now_ms};
use crate::session::SessionManager;
use crate::store::SessionStore;
use protocol::ServerMessage;
use ratelimit::ConnectionRateLimiter;

/// Shared hub state, one per daemon.
pub struct HubState {
    pub config: DaemonConfig,
    pub sessions: Arc<RwLock<SessionManager>>,
    pub store: SessionStore,
    pub registry: ClientRegistry,
    arbiters: Mutex<HashMap<String, InputArbiter>>,
    pub pairing: PairingManager,
    pub tokens: TokenStore,
    pub limiter: ConnectionRateLimiter,
    pub policy: Box<dyn CommandPolicy>,
    pub approvals: PendingApprovals,
    pub shutdown: CancellationToken,
}

pub type SharedHub = Arc<HubState>;

impl HubState {
    pub fn new(
        config: DaemonConfig,
        sessions: Arc<RwLock<SessionManager>>,
        store: SessionStore,
        shutdown: CancellationToken,
    ) -> SharedHub {
        let limiter = ConnectionRateLimiter::new(config.connection_rate_limit);
        Arc::new(Self {
            config,
            sessions,
            store,
            registry: ClientRegistry::new(),
            arbiters: Mutex::new(HashMap::new()),
            pairing: PairingManager::new(),
            tokens: TokenStore::new(),
            limiter,
            policy: Box::new(AllowAllPolicy),
            approvals: PendingApprovals::new(),
            shutdown,
        })
    }

    fn arbiters_lock(&self) -> MutexGuard<'_, HashMap<String, InputArbiter>> {
        match self.arbiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `f` against the session's arbiter, creating it on first use.
    ///
    /// The lock spans the call, which is what makes arbitration decisions
    /// and timer transitions atomic per session.
    pub fn with_arbiter<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut InputArbiter) -> R,
    ) -> R {
        let mut arbiters = self.arbiters_lock();
        let arbiter = arbiters.entry(session_id.to_string()).or_insert_with(|| {
            InputArbiter::new(session_id.to_string(), self.config.arbiter(), unix_now_ms())
        });
        f(arbiter)
    }

    /// Drop a session's arbiter (session deleted).
    pub fn drop_arbiter(&self, session_id: &str) {
        self.arbiters_lock().remove(session_id);
    }

    /// Advance every arbiter's timers and relay resulting state changes.
    pub fn tick_arbiters(&self) {
        let now = unix_now_ms();
        let per_session: Vec<(String, Vec<ControlEvent>)> = {
            let mut arbiters = self.arbiters_lock();
            arbiters
                .iter_mut()
                .map(|(id, arbiter)| (id.clone(), arbiter.tick(now)))
                .collect()
        };
        for (session_id, events) in per_session {
            self.relay_control_events(&session_id, &events);
        }
    }

    /// Broadcast a frame to every client attached to a session.
    pub fn broadcast(&self, session_id: &str, msg: &ServerMessage) {
        self.registry.broadcast_to_session(session_id, msg);
    }

    /// Relay arbiter events: state changes broadcast `control_status` to the
    /// session, the rest are logged.
    pub fn relay_control_events(&self, session_id: &str, events: &[ControlEvent]) {
        for event in events {
            match event {
                ControlEvent::StateChanged { status } => {
                    let frame = control_status_frame(session_id, status);
                    self.broadcast(session_id, &frame);
                }
                ControlEvent::ExclusiveGranted {
                    client_id,
                    expires_at_ms,
                } => {
                    info!(
                        event = "daemon.hub.exclusive_granted",
                        session_id = session_id,
                        client_id = %client_id,
                        expires_at_ms = expires_at_ms,
                    );
                }
                ControlEvent::ExclusiveReleased {
                    client_id,
                    timed_out,
                } => {
                    info!(
                        event = "daemon.hub.exclusive_released",
                        session_id = session_id,
                        client_id = %client_id,
                        timed_out = timed_out,
                    );
                }
                ControlEvent::Idle {
                    client_id,
                    client_type,
                }
                | ControlEvent::Active {
                    client_id,
                    client_type,
                } => {
                    debug!(
                        event = "daemon.hub.client_activity_changed",
                        session_id = session_id,
                        client_id = %client_id,
                        client_type = %client_type,
                        idle = matches!(event, ControlEvent::Idle { .. }),
                    );
                }
            }
        }
    }

    /// Write an arbitration decision to the input log.
    pub fn audit_input(
        &self,
        session_id: &str,
        client_id: &str,
        input: &str,
        accepted: bool,
        reject_reason: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .log_input(session_id, client_id, input, accepted, reject_reason)
        {
            warn!(
                event = "daemon.hub.input_log_failed",
                session_id = session_id,
                error = %e,
            );
        }
    }
}

/// Build the `control_status` frame for a session from arbiter status.
pub fn control_status_frame(session_id: &str, status: &ControlStatus) -> ServerMessage {
    ServerMessage::ControlStatus {
        session_id: session_id.to_string(),
        state: status.state.to_string(),
        active_client: status.active_client.clone(),
        exclusive_expires: status.exclusive_expires_ms,
        last_pc_activity: status.last_pc_activity_ms,
    }
}

#[derive(Debug, Deserialize)]
struct RootQuery {
    token: Option<String>,
    #[serde(rename = "clientType")]
    client_type: Option<String>,
    #[allow(dead_code)]
    v: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PairQuery {
    code: Option<String>,
}

/// Build the hub router.
///
/// The preflight middleware sits outermost so `OPTIONS *` short-circuits
/// with 204 before routing; the permissive CORS layer decorates everything
/// else.
pub fn router(state: SharedHub) -> Router {
    Router::new()
        .route("/api/pair", get(pair_handler))
        .route("/", get(root_handler))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(preflight))
        .with_state(state)
}

/// `OPTIONS *` always answers 204 with permissive CORS headers.
async fn preflight(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return preflight_response();
    }
    next.run(req).await
}

fn preflight_response() -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "*")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "*")
        .body(Body::empty())
        .unwrap_or_default()
}

/// Serve the router until the shutdown token fires.
pub async fn run_http_server(
    state: SharedHub,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<(), crate::errors::DaemonError> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

/// `GET /?token=…` — WebSocket upgrade, or the UI / pairing-entry page for
/// plain browser requests.
async fn root_handler(
    State(state): State<SharedHub>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<RootQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token_session = query
        .token
        .as_deref()
        .and_then(|t| state.tokens.session_for(t));

    if let Ok(ws) = ws {
        if !state.limiter.try_acquire(addr.ip(), unix_now_ms()) {
            warn!(event = "daemon.hub.connection_rate_limited", ip = %addr.ip());
            return (
                StatusCode::TOO_MANY_REQUESTS,
                axum::Json(serde_json::json!({"error": "rate_limited"})),
            )
                .into_response();
        }

        let Some(session_scope) = token_session else {
            return (
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({"error": "AUTH_FAILED"})),
            )
                .into_response();
        };

        let client_type = query
            .client_type
            .as_deref()
            .and_then(ClientType::parse)
            .unwrap_or(ClientType::Mobile);
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        return ws
            .on_upgrade(move |socket| {
                connection::handle_socket(state, socket, client_type, session_scope, user_agent)
            })
            .into_response();
    }

    // Plain GET: a valid token gets the UI shell, anything else the
    // pairing-entry page.
    let body = if token_session.is_some() {
        UI_PAGE
    } else {
        PAIRING_PAGE
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

/// `GET /api/pair?code=XXXXXX` — exchange a pairing code for the session's
/// bearer token.
async fn pair_handler(
    State(state): State<SharedHub>,
    Query(query): Query<PairQuery>,
) -> Response {
    let Some(code) = query.code else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({"error": "Invalid code"})),
        )
            .into_response();
    };

    match state.pairing.validate_code(&code, unix_now_ms()) {
        ValidateOutcome::Valid { token, session_id } => (
            StatusCode::OK,
            axum::Json(serde_json::json!({"token": token, "sessionId": session_id})),
        )
            .into_response(),
        ValidateOutcome::Expired => (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({"error": "code_expired"})),
        )
            .into_response(),
        ValidateOutcome::Invalid => (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({"error": "Invalid code"})),
        )
            .into_response(),
    }
}

/// Minimal shell served for authenticated browser GETs; the real terminal
/// UI is an external collaborator.
const UI_PAGE: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>MConnect</title></head>
<body><p>MConnect daemon is running. Connect a terminal client over the WebSocket endpoint.</p></body></html>
"#;

/// Pairing-entry page: asks for a code, calls /api/pair, reloads with the
/// returned token.
const PAIRING_PAGE: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>MConnect — Pair</title></head>
<body>
<h1>Pair this device</h1>
<p>Enter the 6-character code shown on your computer.</p>
<form id="pair"><input id="code" maxlength="6" autocomplete="off" autofocus>
<button type="submit">Pair</button></form>
<p id="err" style="color:red"></p>
<script>
document.getElementById('pair').addEventListener('submit', async (e) => {
  e.preventDefault();
  const code = document.getElementById('code').value.trim().toUpperCase();
  const res = await fetch('/api/pair?code=' + encodeURIComponent(code));
  const body = await res.json();
  if (res.ok) {
    window.location = '/?token=' + encodeURIComponent(body.token);
  } else {
    document.getElementById('err').textContent = body.error || 'Pairing failed';
  }
});
</script>
</body></html>
"#;
