use std::collections::HashMap;

use bytes::Bytes;
use mconnect_protocol::{ClientType, Priority, SessionState, SessionSummary};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::errors::DaemonError;
use crate::pty::{ProcessManager, PtyEvent, PtySpawnOptions};
use crate::registry::unix_now_ms;
use crate::scrollback::ScrollbackBuffer;
use crate::session::state::{ActiveSession, COMPLETED_RETAIN_MS};
use crate::store::{ClientRecord, ScrollbackLine, SessionStore, now_rfc3339};

/// Orchestrates session lifecycle within the daemon.
///
/// Composes the store, per-session scrollback buffers, and the process
/// manager; enforces the `running` ⇄ `paused` → `completed` state machine;
/// restores persisted sessions at startup. All mutations of session state
/// are serialized through this manager.
pub struct SessionManager {
    store: SessionStore,
    process_manager: ProcessManager,
    sessions: HashMap<String, ActiveSession>,
    config: DaemonConfig,
}

impl SessionManager {
    pub fn new(
        store: SessionStore,
        config: DaemonConfig,
        pty_event_tx: mpsc::UnboundedSender<PtyEvent>,
    ) -> Self {
        Self {
            store,
            process_manager: ProcessManager::new(pty_event_tx),
            sessions: HashMap::new(),
            config,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Load persisted non-completed sessions and rebuild their live views.
    ///
    /// Scrollback already persisted is recovered; PTY children are gone and
    /// are only re-spawned when `respawn_on_restore` is set. Returns the
    /// number of restored sessions.
    pub fn initialize(&mut self) -> Result<usize, DaemonError> {
        let records = self.store.get_all_sessions(false)?;
        let mut restored = 0;
        for record in records {
            let id = record.id.clone();
            let state = record.state;
            let working_directory = record.working_directory.clone();

            let mut buffer =
                ScrollbackBuffer::new(id.clone(), self.store.clone(), self.config.scrollback());
            buffer.restore()?;
            self.sessions
                .insert(id.clone(), ActiveSession::new(record, buffer));
            restored += 1;

            info!(
                event = "daemon.session.restored",
                session_id = %id,
                state = %state,
            );

            if state == SessionState::Running && self.config.respawn_on_restore {
                let opts = PtySpawnOptions::new(working_directory.into());
                match self.process_manager.spawn(&id, &opts) {
                    Ok(pty_info) => {
                        if let Some(session) = self.sessions.get_mut(&id) {
                            session.pty_pid = pty_info.pid;
                        }
                    }
                    Err(e) => {
                        warn!(
                            event = "daemon.session.respawn_failed",
                            session_id = %id,
                            error = %e,
                        );
                    }
                }
            }
        }
        info!(event = "daemon.session.initialize_completed", restored = restored);
        Ok(restored)
    }

    /// Create a new session: persist the row, build its scrollback buffer,
    /// and spawn the PTY child.
    ///
    /// A spawn failure is reported to the caller and not retried; the
    /// session row remains `running` until the caller demotes it.
    pub fn create(
        &mut self,
        agent_config: serde_json::Value,
        working_directory: String,
    ) -> Result<String, DaemonError> {
        let live = self
            .sessions
            .values()
            .filter(|s| s.state != SessionState::Completed)
            .count();
        if live >= self.config.max_concurrent_sessions {
            return Err(DaemonError::MaxSessionsReached(
                self.config.max_concurrent_sessions,
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        info!(
            event = "daemon.session.create_started",
            session_id = %id,
            working_directory = %working_directory,
        );

        let record = self.store.create_session(
            &id,
            SessionState::Running,
            &agent_config,
            &working_directory,
        )?;
        let buffer =
            ScrollbackBuffer::new(id.clone(), self.store.clone(), self.config.scrollback());
        self.sessions
            .insert(id.clone(), ActiveSession::new(record, buffer));

        let opts = PtySpawnOptions::new(working_directory.into());
        let pty_info = self.process_manager.spawn(&id, &opts)?;
        if let Some(session) = self.sessions.get_mut(&id) {
            session.pty_pid = pty_info.pid;
        }

        info!(
            event = "daemon.session.create_completed",
            session_id = %id,
            pid = ?pty_info.pid,
        );
        Ok(id)
    }

    /// Insert a client record for a session. Returns `None` when the session
    /// is unknown; attaching to a completed session is refused.
    pub fn attach_client(
        &mut self,
        session_id: &str,
        client_id: &str,
        client_type: ClientType,
        user_agent: Option<String>,
    ) -> Result<Option<ClientRecord>, DaemonError> {
        let Some(session) = self.store.get_session(session_id)? else {
            return Ok(None);
        };
        if session.state == SessionState::Completed {
            return Err(DaemonError::SessionCompleted(session_id.to_string()));
        }
        let now = now_rfc3339();
        let record = ClientRecord {
            id: client_id.to_string(),
            session_id: Some(session_id.to_string()),
            client_type,
            priority: Priority::default_for(client_type),
            connected_at: now.clone(),
            last_heartbeat: now,
            user_agent,
        };
        // A re-attach replaces the previous record.
        self.store.remove_client(client_id)?;
        self.store.add_client(&record)?;
        self.touch(session_id);
        info!(
            event = "daemon.session.client_attached",
            session_id = session_id,
            client_id = client_id,
            client_type = %client_type,
        );
        Ok(Some(record))
    }

    /// Remove a client record regardless of which session it was attached to.
    pub fn detach_client(&mut self, client_id: &str) -> Result<(), DaemonError> {
        self.store.remove_client(client_id)?;
        info!(
            event = "daemon.session.client_detached",
            client_id = client_id,
        );
        Ok(())
    }

    /// Route PTY bytes into scrollback, refresh activity, and fan out to
    /// subscribers.
    pub fn append_output(&mut self, session_id: &str, data: &[u8]) -> Result<(), DaemonError> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Ok(());
        };
        {
            let scrollback = session.scrollback();
            let mut buffer = match scrollback.lock() {
                Ok(b) => b,
                Err(poisoned) => poisoned.into_inner(),
            };
            buffer.append(&String::from_utf8_lossy(data))?;
        }
        session.broadcast_output(Bytes::copy_from_slice(data));
        self.touch(session_id);
        Ok(())
    }

    /// Validate and apply a lifecycle transition.
    ///
    /// Transitioning to `completed` flushes the scrollback and terminates
    /// the PTY; the live view is retained for a grace window so detach and
    /// export can still read from memory.
    pub fn transition_state(
        &mut self,
        session_id: &str,
        new_state: SessionState,
    ) -> Result<(), DaemonError> {
        let current = match self.sessions.get(session_id) {
            Some(s) => s.state,
            None => self
                .store
                .get_session(session_id)?
                .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?
                .state,
        };

        if !current.can_transition_to(new_state) {
            return Err(DaemonError::InvalidStateTransition {
                from: current.to_string(),
                to: new_state.to_string(),
            });
        }

        if new_state == SessionState::Completed {
            if let Some(session) = self.sessions.get(session_id) {
                let scrollback = session.scrollback();
                let mut buffer = match scrollback.lock() {
                    Ok(b) => b,
                    Err(poisoned) => poisoned.into_inner(),
                };
                buffer.flush()?;
            }
            if self.process_manager.has_process(session_id) {
                if let Err(e) = self.process_manager.kill(session_id, false) {
                    warn!(
                        event = "daemon.session.complete_kill_failed",
                        session_id = session_id,
                        error = %e,
                    );
                }
            }
        }

        self.store.update_session_state(session_id, new_state)?;
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.state = new_state;
            session.last_activity = now_rfc3339();
            if new_state == SessionState::Completed {
                session.completed_at_ms = Some(unix_now_ms());
            }
        }

        info!(
            event = "daemon.session.state_changed",
            session_id = session_id,
            from = %current,
            to = %new_state,
        );
        Ok(())
    }

    /// Mark a session completed and drop its live view.
    ///
    /// Returns `false` when the session is unknown. `force` skips the
    /// graceful SIGTERM and kills the child outright.
    pub fn terminate_session(&mut self, session_id: &str, force: bool) -> Result<bool, DaemonError> {
        let known = self.store.get_session(session_id)?.is_some();
        if !known {
            return Ok(false);
        }

        if force && self.process_manager.has_process(session_id) {
            if let Err(e) = self.process_manager.kill(session_id, true) {
                warn!(
                    event = "daemon.session.force_kill_failed",
                    session_id = session_id,
                    error = %e,
                );
            }
        }

        match self.transition_state(session_id, SessionState::Completed) {
            Ok(()) => {}
            // Killing an already-completed session is a no-op, not an error.
            Err(DaemonError::InvalidStateTransition { .. }) => {}
            Err(e) => return Err(e),
        }
        self.sessions.remove(session_id);

        info!(
            event = "daemon.session.terminate_completed",
            session_id = session_id,
            force = force,
        );
        Ok(true)
    }

    /// Handle a PTY child exit: the session moves to `completed`, the
    /// process record is dropped. Returns the new state for broadcasting.
    pub fn handle_pty_exit(
        &mut self,
        session_id: &str,
        exit_code: Option<u32>,
    ) -> Option<SessionState> {
        info!(
            event = "daemon.session.pty_exited",
            session_id = session_id,
            exit_code = ?exit_code,
        );
        self.process_manager.remove(session_id);
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.pty_pid = None;
        }
        match self.transition_state(session_id, SessionState::Completed) {
            Ok(()) => Some(SessionState::Completed),
            Err(e) => {
                // Already completed (terminate path) or unknown.
                warn!(
                    event = "daemon.session.exit_transition_skipped",
                    session_id = session_id,
                    error = %e,
                );
                None
            }
        }
    }

    /// Write input bytes to a session's PTY. Never forwards to a completed
    /// session. The `false` sentinel means no live process.
    pub fn write_input(&self, session_id: &str, data: &[u8]) -> Result<bool, DaemonError> {
        if let Some(session) = self.sessions.get(session_id) {
            if session.state == SessionState::Completed {
                return Err(DaemonError::SessionCompleted(session_id.to_string()));
            }
        }
        self.process_manager.write(session_id, data)
    }

    pub fn resize(&mut self, session_id: &str, cols: u16, rows: u16) -> Result<(), DaemonError> {
        self.process_manager.resize(session_id, cols, rows)
    }

    /// Subscribe to a session's live output stream.
    pub fn subscribe_output(&self, session_id: &str) -> Option<broadcast::Receiver<Bytes>> {
        self.sessions.get(session_id).map(|s| s.subscribe_output())
    }

    /// Range query against a session's scrollback (live buffer when present,
    /// store otherwise).
    pub fn scrollback_range(
        &self,
        session_id: &str,
        from_line: u64,
        count: usize,
    ) -> Result<(Vec<ScrollbackLine>, u64), DaemonError> {
        if let Some(session) = self.sessions.get(session_id) {
            let scrollback = session.scrollback();
            let buffer = match scrollback.lock() {
                Ok(b) => b,
                Err(poisoned) => poisoned.into_inner(),
            };
            let lines = buffer.get_range(from_line, count)?;
            return Ok((lines, buffer.total_lines()));
        }
        let lines = self.store.get_scrollback(session_id, from_line, count)?;
        let total = self.store.get_scrollback_line_count(session_id)?;
        Ok((lines, total))
    }

    /// The newest `count` scrollback lines.
    pub fn scrollback_recent(
        &self,
        session_id: &str,
        count: usize,
    ) -> Result<(Vec<ScrollbackLine>, u64), DaemonError> {
        if let Some(session) = self.sessions.get(session_id) {
            let scrollback = session.scrollback();
            let buffer = match scrollback.lock() {
                Ok(b) => b,
                Err(poisoned) => poisoned.into_inner(),
            };
            let lines = buffer.get_recent(count)?;
            return Ok((lines, buffer.total_lines()));
        }
        let lines = self.store.get_latest_scrollback(session_id, count)?;
        let total = self.store.get_scrollback_line_count(session_id)?;
        Ok((lines, total))
    }

    /// Flush and export a session's full retained scrollback.
    pub fn export_session(
        &mut self,
        session_id: &str,
    ) -> Result<(Vec<String>, u64), DaemonError> {
        if self.store.get_session(session_id)?.is_none() {
            return Err(DaemonError::SessionNotFound(session_id.to_string()));
        }
        if let Some(session) = self.sessions.get(session_id) {
            let scrollback = session.scrollback();
            let mut buffer = match scrollback.lock() {
                Ok(b) => b,
                Err(poisoned) => poisoned.into_inner(),
            };
            buffer.flush()?;
        }
        let total = self.store.get_scrollback_line_count(session_id)?;
        let lines = self
            .store
            .get_latest_scrollback(session_id, total as usize)?
            .into_iter()
            .map(|l| l.content)
            .collect();
        Ok((lines, total))
    }

    /// Delete completed sessions past the retention window. Runs hourly.
    pub fn cleanup_completed_sessions(&mut self) -> Result<Vec<String>, DaemonError> {
        let cutoff_ms = self.config.cleanup_after_hours * 60 * 60 * 1_000;
        let removed = self.store.delete_completed_sessions(cutoff_ms)?;
        for id in &removed {
            self.sessions.remove(id);
        }
        if !removed.is_empty() {
            info!(
                event = "daemon.session.cleanup_completed",
                removed = removed.len(),
            );
        }
        Ok(removed)
    }

    /// Drop live views of completed sessions past the in-memory grace
    /// window.
    pub fn drop_expired_views(&mut self, now_ms: u64) {
        self.sessions.retain(|_, s| {
            s.completed_at_ms
                .is_none_or(|t| now_ms.saturating_sub(t) < COMPLETED_RETAIN_MS)
        });
    }

    pub fn get_summary(&self, session_id: &str) -> Result<Option<SessionSummary>, DaemonError> {
        if let Some(session) = self.sessions.get(session_id) {
            let clients = self.store.get_clients_for_session(session_id)?.len();
            return Ok(Some(session.to_summary(Some(clients))));
        }
        let Some(record) = self.store.get_session(session_id)? else {
            return Ok(None);
        };
        let clients = self.store.get_clients_for_session(session_id)?.len();
        Ok(Some(SessionSummary {
            id: mconnect_protocol::SessionId::new(record.id),
            state: record.state,
            working_directory: record.working_directory,
            agent_config: record.agent_config,
            created_at: record.created_at,
            last_activity: record.last_activity,
            client_count: Some(clients),
            pty_pid: None,
        }))
    }

    /// All known sessions, completed ones included until the sweep removes
    /// them.
    pub fn list_summaries(&self) -> Result<Vec<SessionSummary>, DaemonError> {
        let records = self.store.get_all_sessions(true)?;
        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            let clients = self.store.get_clients_for_session(&record.id)?.len();
            let pty_pid = self
                .sessions
                .get(&record.id)
                .and_then(|s| s.pty_pid)
                .filter(|_| self.process_manager.has_process(&record.id));
            summaries.push(SessionSummary {
                id: mconnect_protocol::SessionId::new(record.id.clone()),
                state: record.state,
                working_directory: record.working_directory,
                agent_config: record.agent_config,
                created_at: record.created_at,
                last_activity: record.last_activity,
                client_count: Some(clients),
                pty_pid,
            });
        }
        Ok(summaries)
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).map(|s| s.state)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn running_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Running)
            .count()
    }

    pub fn active_pty_count(&self) -> usize {
        self.process_manager.count()
    }

    /// Flush all buffers and SIGTERM all children (shutdown path).
    pub fn shutdown_all(&mut self) {
        for session in self.sessions.values() {
            let scrollback = session.scrollback();
            let mut buffer = match scrollback.lock() {
                Ok(b) => b,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = buffer.flush() {
                warn!(
                    event = "daemon.session.shutdown_flush_failed",
                    session_id = %session.id,
                    error = %e,
                );
            }
        }
        self.process_manager.kill_all();
    }

    fn touch(&mut self, session_id: &str) {
        let now = now_rfc3339();
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_activity = now;
        }
        if let Err(e) = self.store.update_session_activity(session_id) {
            warn!(
                event = "daemon.session.activity_update_failed",
                session_id = session_id,
                error = %e,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> (
        tempfile::TempDir,
        SessionManager,
        mpsc::UnboundedReceiver<PtyEvent>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("sessions.db")).unwrap();
        let mut config = DaemonConfig::default();
        config.db_path = dir.path().join("sessions.db");
        let (tx, rx) = mpsc::unbounded_channel();
        (dir, SessionManager::new(store, config, tx), rx)
    }

    /// Seed a session row + live view without spawning a real PTY.
    fn seed_live_session(mgr: &mut SessionManager, id: &str) {
        let record = mgr
            .store
            .create_session(id, SessionState::Running, &serde_json::Value::Null, "/tmp")
            .unwrap();
        let buffer =
            ScrollbackBuffer::new(id.to_string(), mgr.store.clone(), mgr.config.scrollback());
        mgr.sessions
            .insert(id.to_string(), ActiveSession::new(record, buffer));
    }

    #[tokio::test]
    async fn test_create_spawns_and_persists() {
        let (dir, mut mgr, _rx) = test_manager();
        let id = mgr
            .create(
                serde_json::json!({"preset": "shell"}),
                dir.path().to_string_lossy().to_string(),
            )
            .unwrap();

        let summary = mgr.get_summary(&id).unwrap().unwrap();
        assert_eq!(summary.state, SessionState::Running);
        assert!(mgr.process_manager.has_process(&id));

        mgr.terminate_session(&id, true).unwrap();
    }

    #[tokio::test]
    async fn test_max_concurrent_sessions_enforced() {
        let (dir, mut mgr, _rx) = test_manager();
        mgr.config.max_concurrent_sessions = 1;
        let wd = dir.path().to_string_lossy().to_string();
        let id = mgr.create(serde_json::Value::Null, wd.clone()).unwrap();

        let err = mgr.create(serde_json::Value::Null, wd).unwrap_err();
        assert_eq!(err.error_code(), "max_sessions_reached");

        mgr.terminate_session(&id, true).unwrap();
    }

    #[test]
    fn test_append_output_feeds_scrollback_and_broadcast() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");

        let mut output_rx = mgr.subscribe_output("s1").unwrap();
        mgr.append_output("s1", b"hello\nworld\n").unwrap();

        let (lines, total) = mgr.scrollback_recent("s1", 10).unwrap();
        assert_eq!(total, 2);
        let contents: Vec<&str> = lines.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "world"]);

        assert_eq!(
            output_rx.try_recv().unwrap(),
            Bytes::from_static(b"hello\nworld\n")
        );
    }

    #[test]
    fn test_attach_unknown_session_returns_none() {
        let (_dir, mut mgr, _rx) = test_manager();
        let result = mgr
            .attach_client("ghost", "c1", ClientType::Mobile, None)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_attach_completed_session_refused() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");
        mgr.transition_state("s1", SessionState::Completed).unwrap();

        let err = mgr
            .attach_client("s1", "c1", ClientType::Mobile, None)
            .unwrap_err();
        assert_eq!(err.error_code(), "session_completed");
    }

    #[test]
    fn test_attach_and_detach_client() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");

        let record = mgr
            .attach_client("s1", "c1", ClientType::Pc, Some("ua".into()))
            .unwrap()
            .unwrap();
        assert_eq!(record.priority, Priority::High);

        let clients = mgr.store.get_clients_for_session("s1").unwrap();
        assert_eq!(clients.len(), 1);

        mgr.detach_client("c1").unwrap();
        assert!(mgr.store.get_clients_for_session("s1").unwrap().is_empty());
    }

    #[test]
    fn test_state_machine_transitions() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");

        mgr.transition_state("s1", SessionState::Paused).unwrap();
        mgr.transition_state("s1", SessionState::Running).unwrap();
        mgr.transition_state("s1", SessionState::Completed).unwrap();

        // Completed is terminal.
        let err = mgr
            .transition_state("s1", SessionState::Running)
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_state_transition");
    }

    #[test]
    fn test_completed_session_rejects_input() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");
        mgr.transition_state("s1", SessionState::Completed).unwrap();

        let err = mgr.write_input("s1", b"x").unwrap_err();
        assert_eq!(err.error_code(), "session_completed");
    }

    #[test]
    fn test_completion_flushes_partial_line() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");
        mgr.append_output("s1", b"no newline yet").unwrap();

        mgr.transition_state("s1", SessionState::Completed).unwrap();

        assert_eq!(mgr.store.get_scrollback_line_count("s1").unwrap(), 1);
        let lines = mgr.store.get_latest_scrollback("s1", 10).unwrap();
        assert_eq!(lines[0].content, "no newline yet");
    }

    #[test]
    fn test_terminate_unknown_session_is_false() {
        let (_dir, mut mgr, _rx) = test_manager();
        assert!(!mgr.terminate_session("ghost", false).unwrap());
    }

    #[test]
    fn test_terminate_drops_live_view() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");
        assert!(mgr.terminate_session("s1", false).unwrap());
        assert_eq!(mgr.session_count(), 0);
        // Row survives until the cleanup sweep.
        assert!(mgr.store.get_session("s1").unwrap().is_some());
    }

    #[test]
    fn test_pty_exit_completes_session() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");

        let new_state = mgr.handle_pty_exit("s1", Some(0));
        assert_eq!(new_state, Some(SessionState::Completed));
        assert_eq!(
            mgr.store.get_session("s1").unwrap().unwrap().state,
            SessionState::Completed
        );
        // Live view retained for the grace window.
        assert_eq!(mgr.session_count(), 1);

        // Second exit report is a no-op.
        assert_eq!(mgr.handle_pty_exit("s1", None), None);
    }

    #[test]
    fn test_drop_expired_views() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");
        mgr.transition_state("s1", SessionState::Completed).unwrap();
        assert_eq!(mgr.session_count(), 1);

        let completed_at = mgr.sessions.get("s1").unwrap().completed_at_ms.unwrap();
        mgr.drop_expired_views(completed_at + COMPLETED_RETAIN_MS + 1);
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_initialize_restores_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("sessions.db");
        {
            let store = SessionStore::open(&db).unwrap();
            store
                .create_session("s1", SessionState::Running, &serde_json::Value::Null, "/tmp")
                .unwrap();
            store.append_scrollback("s1", "recovered").unwrap();
            store
                .create_session("done", SessionState::Running, &serde_json::Value::Null, "/tmp")
                .unwrap();
            store
                .update_session_state("done", SessionState::Completed)
                .unwrap();
        }

        let store = SessionStore::open(&db).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mgr = SessionManager::new(store, DaemonConfig::default(), tx);
        let restored = mgr.initialize().unwrap();

        // Only the non-completed session is restored.
        assert_eq!(restored, 1);
        let (lines, total) = mgr.scrollback_recent("s1", 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(lines[0].content, "recovered");
        // No PTY without respawn_on_restore.
        assert_eq!(mgr.active_pty_count(), 0);
    }

    #[test]
    fn test_cleanup_removes_old_completed() {
        let (_dir, mut mgr, _rx) = test_manager();
        mgr.config.cleanup_after_hours = 0;
        seed_live_session(&mut mgr, "s1");
        mgr.transition_state("s1", SessionState::Completed).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        let removed = mgr.cleanup_completed_sessions().unwrap();
        assert_eq!(removed, vec!["s1".to_string()]);
        assert!(mgr.store.get_session("s1").unwrap().is_none());
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_export_includes_partial_line() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");
        mgr.append_output("s1", b"line one\ntrailing").unwrap();

        let (lines, total) = mgr.export_session("s1").unwrap();
        assert_eq!(total, 2);
        assert_eq!(lines, vec!["line one".to_string(), "trailing".to_string()]);
    }

    #[test]
    fn test_export_unknown_session() {
        let (_dir, mut mgr, _rx) = test_manager();
        let err = mgr.export_session("ghost").unwrap_err();
        assert_eq!(err.error_code(), "session_not_found");
    }

    #[test]
    fn test_scrollback_range_for_dropped_session_reads_store() {
        let (_dir, mut mgr, _rx) = test_manager();
        seed_live_session(&mut mgr, "s1");
        mgr.append_output("s1", b"a\nb\n").unwrap();
        mgr.terminate_session("s1", false).unwrap();

        // Live view is gone; the store still answers.
        let (lines, total) = mgr.scrollback_range("s1", 0, 10).unwrap();
        assert_eq!(total, 2);
        assert_eq!(lines.len(), 2);
    }
}
