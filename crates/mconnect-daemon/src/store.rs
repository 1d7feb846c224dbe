//! SQLite session store: WAL mode, foreign keys on, all tables created on
//! open.
//!
//! Four tables: `sessions`, `scrollback`, `connected_clients`, `input_log`.
//! Deleting a session cascades to its scrollback, clients, and input log.
//! The connection is shared behind a mutex; batch appends run inside a real
//! transaction so read-after-write within a sequence is guaranteed.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration, SecondsFormat, Utc};
use mconnect_protocol::{ClientType, Priority, SessionState};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::errors::DaemonError;

/// Wall-clock timestamp in the fixed store format (UTC, millisecond
/// precision). The format sorts lexicographically, which the stale sweeps
/// rely on.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn cutoff_rfc3339(older_than_ms: u64) -> String {
    (Utc::now() - Duration::milliseconds(older_than_ms as i64))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A persisted session row.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub state: SessionState,
    pub agent_config: serde_json::Value,
    pub working_directory: String,
    pub created_at: String,
    pub last_activity: String,
}

/// A persisted scrollback line. `line_number` is absolute and monotonic per
/// session; lines carry no terminating newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollbackLine {
    pub line_number: u64,
    pub content: String,
    pub timestamp: String,
}

/// A persisted connected-client row.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: String,
    pub session_id: Option<String>,
    pub client_type: ClientType,
    pub priority: Priority,
    pub connected_at: String,
    pub last_heartbeat: String,
    pub user_agent: Option<String>,
}

/// A persisted input-log row (append-only audit trail).
#[derive(Debug, Clone)]
pub struct InputLogEntry {
    pub auto_id: i64,
    pub session_id: String,
    pub client_id: String,
    pub input: String,
    pub timestamp: String,
    pub accepted: bool,
    pub reject_reason: Option<String>,
}

/// Handle to the SQLite store. Cheap to clone; all clones share one
/// serialized connection.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open (or create) the store at `path` and ensure all tables exist.
    pub fn open(path: &Path) -> Result<Self, DaemonError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        create_tables(&conn)?;
        debug!(event = "daemon.store.opened", path = %path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --- Sessions ---

    pub fn create_session(
        &self,
        id: &str,
        state: SessionState,
        agent_config: &serde_json::Value,
        working_directory: &str,
    ) -> Result<SessionRecord, DaemonError> {
        let now = now_rfc3339();
        let config_json = serde_json::to_string(agent_config)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (id, state, agent_config, working_directory, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, state.as_str(), config_json, working_directory, now],
        )?;
        Ok(SessionRecord {
            id: id.to_string(),
            state,
            agent_config: agent_config.clone(),
            working_directory: working_directory.to_string(),
            created_at: now.clone(),
            last_activity: now,
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, DaemonError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, state, agent_config, working_directory, created_at, last_activity
                 FROM sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_all_sessions(
        &self,
        include_completed: bool,
    ) -> Result<Vec<SessionRecord>, DaemonError> {
        let conn = self.lock();
        let sql = if include_completed {
            "SELECT id, state, agent_config, working_directory, created_at, last_activity
             FROM sessions ORDER BY created_at"
        } else {
            "SELECT id, state, agent_config, working_directory, created_at, last_activity
             FROM sessions WHERE state != 'completed' ORDER BY created_at"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_sessions_by_state(
        &self,
        state: SessionState,
    ) -> Result<Vec<SessionRecord>, DaemonError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, state, agent_config, working_directory, created_at, last_activity
             FROM sessions WHERE state = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![state.as_str()], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Update a session's state, bumping `last_activity`.
    pub fn update_session_state(&self, id: &str, state: SessionState) -> Result<(), DaemonError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET state = ?2, last_activity = ?3 WHERE id = ?1",
            params![id, state.as_str(), now_rfc3339()],
        )?;
        if changed == 0 {
            return Err(DaemonError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Bump `last_activity` to now.
    pub fn update_session_activity(&self, id: &str) -> Result<(), DaemonError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET last_activity = ?2 WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        if changed == 0 {
            return Err(DaemonError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a session. Cascades to scrollback, clients, and input log.
    pub fn delete_session(&self, id: &str) -> Result<bool, DaemonError> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Delete completed sessions whose `last_activity` is older than the
    /// cutoff. Returns the ids removed.
    pub fn delete_completed_sessions(
        &self,
        older_than_ms: u64,
    ) -> Result<Vec<String>, DaemonError> {
        let cutoff = cutoff_rfc3339(older_than_ms);
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM sessions WHERE state = 'completed' AND last_activity < ?1",
            )?;
            stmt.query_map(params![cutoff], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            "DELETE FROM sessions WHERE state = 'completed' AND last_activity < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    // --- Scrollback ---

    /// Append one line, allocating the next line number atomically.
    pub fn append_scrollback(&self, session_id: &str, content: &str) -> Result<u64, DaemonError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let next: u64 = tx.query_row(
            "SELECT COALESCE(MAX(line_number) + 1, 0) FROM scrollback WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO scrollback (session_id, line_number, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, next, content, now_rfc3339()],
        )?;
        tx.commit()?;
        Ok(next)
    }

    /// Append a batch of lines in a single transaction. Returns the line
    /// number assigned to the first line.
    pub fn append_scrollback_batch(
        &self,
        session_id: &str,
        lines: &[(String, String)],
    ) -> Result<u64, DaemonError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let first: u64 = tx.query_row(
            "SELECT COALESCE(MAX(line_number) + 1, 0) FROM scrollback WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO scrollback (session_id, line_number, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (offset, (content, timestamp)) in lines.iter().enumerate() {
                stmt.execute(params![session_id, first + offset as u64, content, timestamp])?;
            }
        }
        tx.commit()?;
        Ok(first)
    }

    /// Lines with `line_number >= from_line`, ascending, at most `count`.
    pub fn get_scrollback(
        &self,
        session_id: &str,
        from_line: u64,
        count: usize,
    ) -> Result<Vec<ScrollbackLine>, DaemonError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT line_number, content, timestamp FROM scrollback
             WHERE session_id = ?1 AND line_number >= ?2
             ORDER BY line_number LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![session_id, from_line, count as u64], line_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The newest `count` lines, returned in ascending line order.
    pub fn get_latest_scrollback(
        &self,
        session_id: &str,
        count: usize,
    ) -> Result<Vec<ScrollbackLine>, DaemonError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT line_number, content, timestamp FROM scrollback
             WHERE session_id = ?1 ORDER BY line_number DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![session_id, count as u64], line_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    pub fn get_scrollback_line_count(&self, session_id: &str) -> Result<u64, DaemonError> {
        let conn = self.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM scrollback WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// The line number the next append would receive (max + 1, or 0).
    pub fn next_scrollback_line(&self, session_id: &str) -> Result<u64, DaemonError> {
        let conn = self.lock();
        let next: u64 = conn.query_row(
            "SELECT COALESCE(MAX(line_number) + 1, 0) FROM scrollback WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    /// Remove oldest rows so that exactly `keep_lines` newest remain.
    /// Returns the number of rows removed.
    pub fn trim_scrollback(&self, session_id: &str, keep_lines: u64) -> Result<u64, DaemonError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let next: u64 = tx.query_row(
            "SELECT COALESCE(MAX(line_number) + 1, 0) FROM scrollback WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let cutoff = next.saturating_sub(keep_lines);
        let removed = tx.execute(
            "DELETE FROM scrollback WHERE session_id = ?1 AND line_number < ?2",
            params![session_id, cutoff],
        )?;
        tx.commit()?;
        Ok(removed as u64)
    }

    // --- Connected clients ---

    pub fn add_client(&self, client: &ClientRecord) -> Result<(), DaemonError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO connected_clients
             (id, session_id, client_type, priority, connected_at, last_heartbeat, user_agent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                client.id,
                client.session_id,
                client.client_type.as_str(),
                client.priority.as_str(),
                client.connected_at,
                client.last_heartbeat,
                client.user_agent,
            ],
        )?;
        Ok(())
    }

    pub fn get_client(&self, id: &str) -> Result<Option<ClientRecord>, DaemonError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, session_id, client_type, priority, connected_at, last_heartbeat, user_agent
                 FROM connected_clients WHERE id = ?1",
                params![id],
                client_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_clients_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ClientRecord>, DaemonError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, client_type, priority, connected_at, last_heartbeat, user_agent
             FROM connected_clients WHERE session_id = ?1 ORDER BY connected_at",
        )?;
        let rows = stmt
            .query_map(params![session_id], client_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn remove_client(&self, id: &str) -> Result<bool, DaemonError> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM connected_clients WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn update_client_heartbeat(&self, id: &str) -> Result<(), DaemonError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE connected_clients SET last_heartbeat = ?2 WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn update_client_priority(&self, id: &str, priority: Priority) -> Result<(), DaemonError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE connected_clients SET priority = ?2 WHERE id = ?1",
            params![id, priority.as_str()],
        )?;
        Ok(())
    }

    pub fn update_client_session(
        &self,
        id: &str,
        session_id: Option<&str>,
    ) -> Result<(), DaemonError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE connected_clients SET session_id = ?2 WHERE id = ?1",
            params![id, session_id],
        )?;
        Ok(())
    }

    /// Remove clients whose `last_heartbeat` is older than the cutoff.
    pub fn remove_stale_clients(&self, older_than_ms: u64) -> Result<u64, DaemonError> {
        let cutoff = cutoff_rfc3339(older_than_ms);
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM connected_clients WHERE last_heartbeat < ?1",
            params![cutoff],
        )?;
        Ok(removed as u64)
    }

    // --- Input log ---

    pub fn log_input(
        &self,
        session_id: &str,
        client_id: &str,
        input: &str,
        accepted: bool,
        reject_reason: Option<&str>,
    ) -> Result<(), DaemonError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO input_log (session_id, client_id, input, timestamp, accepted, reject_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                client_id,
                input,
                now_rfc3339(),
                accepted,
                reject_reason,
            ],
        )?;
        Ok(())
    }

    /// The latest `limit` input-log entries for a session, ascending by id.
    pub fn get_input_log(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<InputLogEntry>, DaemonError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT auto_id, session_id, client_id, input, timestamp, accepted, reject_reason
             FROM input_log WHERE session_id = ?1 ORDER BY auto_id DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![session_id, limit as u64], |row| {
                Ok(InputLogEntry {
                    auto_id: row.get(0)?,
                    session_id: row.get(1)?,
                    client_id: row.get(2)?,
                    input: row.get(3)?,
                    timestamp: row.get(4)?,
                    accepted: row.get(5)?,
                    reject_reason: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            id                 TEXT PRIMARY KEY,
            state              TEXT NOT NULL,
            agent_config       TEXT NOT NULL,
            working_directory  TEXT NOT NULL,
            created_at         TEXT NOT NULL,
            last_activity      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scrollback (
            session_id   TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            line_number  INTEGER NOT NULL,
            content      TEXT NOT NULL,
            timestamp    TEXT NOT NULL,
            PRIMARY KEY (session_id, line_number)
        );

        CREATE TABLE IF NOT EXISTS connected_clients (
            id              TEXT PRIMARY KEY,
            session_id      TEXT REFERENCES sessions(id) ON DELETE CASCADE,
            client_type     TEXT NOT NULL,
            priority        TEXT NOT NULL,
            connected_at    TEXT NOT NULL,
            last_heartbeat  TEXT NOT NULL,
            user_agent      TEXT
        );

        CREATE TABLE IF NOT EXISTS input_log (
            auto_id        INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id     TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            client_id      TEXT NOT NULL,
            input          TEXT NOT NULL,
            timestamp      TEXT NOT NULL,
            accepted       INTEGER NOT NULL,
            reject_reason  TEXT
        );
        ",
    )
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let state_str: String = row.get(1)?;
    let config_str: String = row.get(2)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        state: SessionState::parse(&state_str).unwrap_or(SessionState::Completed),
        agent_config: serde_json::from_str(&config_str).unwrap_or(serde_json::Value::Null),
        working_directory: row.get(3)?,
        created_at: row.get(4)?,
        last_activity: row.get(5)?,
    })
}

fn line_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScrollbackLine> {
    Ok(ScrollbackLine {
        line_number: row.get(0)?,
        content: row.get(1)?,
        timestamp: row.get(2)?,
    })
}

fn client_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClientRecord> {
    let type_str: String = row.get(2)?;
    let priority_str: String = row.get(3)?;
    Ok(ClientRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        client_type: ClientType::parse(&type_str).unwrap_or(ClientType::Mobile),
        priority: match priority_str.as_str() {
            "exclusive" => Priority::Exclusive,
            "high" => Priority::High,
            "normal" => Priority::Normal,
            "low" => Priority::Low,
            _ => Priority::Observer,
        },
        connected_at: row.get(4)?,
        last_heartbeat: row.get(5)?,
        user_agent: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("sessions.db")).unwrap();
        (dir, store)
    }

    fn seed_session(store: &SessionStore, id: &str) -> SessionRecord {
        store
            .create_session(
                id,
                SessionState::Running,
                &serde_json::json!({"preset": "shell"}),
                "/tmp",
            )
            .unwrap()
    }

    #[test]
    fn test_create_and_get_session() {
        let (_dir, store) = test_store();
        let created = seed_session(&store, "s1");
        assert_eq!(created.created_at, created.last_activity);

        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.id, "s1");
        assert_eq!(loaded.state, SessionState::Running);
        assert_eq!(loaded.working_directory, "/tmp");
        assert_eq!(loaded.agent_config["preset"], "shell");
    }

    #[test]
    fn test_get_missing_session() {
        let (_dir, store) = test_store();
        assert!(store.get_session("nope").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_session_id_fails_fast() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        let result = store.create_session(
            "s1",
            SessionState::Running,
            &serde_json::Value::Null,
            "/tmp",
        );
        assert!(matches!(result, Err(DaemonError::Storage(_))));
    }

    #[test]
    fn test_update_state_bumps_activity() {
        let (_dir, store) = test_store();
        let created = seed_session(&store, "s1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .update_session_state("s1", SessionState::Paused)
            .unwrap();
        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Paused);
        assert!(loaded.last_activity > created.last_activity);
    }

    #[test]
    fn test_update_state_unknown_session() {
        let (_dir, store) = test_store();
        let err = store
            .update_session_state("ghost", SessionState::Completed)
            .unwrap_err();
        assert_eq!(err.error_code(), "session_not_found");
    }

    #[test]
    fn test_sessions_by_state_and_filtering() {
        let (_dir, store) = test_store();
        seed_session(&store, "a");
        seed_session(&store, "b");
        store
            .update_session_state("b", SessionState::Completed)
            .unwrap();

        assert_eq!(store.get_all_sessions(true).unwrap().len(), 2);
        assert_eq!(store.get_all_sessions(false).unwrap().len(), 1);
        let running = store.get_sessions_by_state(SessionState::Running).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "a");
    }

    #[test]
    fn test_delete_session_cascades() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        store.append_scrollback("s1", "hello").unwrap();
        store
            .log_input("s1", "c1", "ls", true, None)
            .unwrap();

        assert!(store.delete_session("s1").unwrap());
        assert_eq!(store.get_scrollback_line_count("s1").unwrap(), 0);
        assert!(store.get_input_log("s1", 10).unwrap().is_empty());
        // Deleting again reports nothing removed
        assert!(!store.delete_session("s1").unwrap());
    }

    #[test]
    fn test_delete_completed_sessions_respects_cutoff() {
        let (_dir, store) = test_store();
        seed_session(&store, "old");
        store
            .update_session_state("old", SessionState::Completed)
            .unwrap();
        seed_session(&store, "fresh");
        store
            .update_session_state("fresh", SessionState::Completed)
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(30));
        // Anything idle for 10ms+ is stale; both qualify except we then
        // refresh "fresh".
        store.update_session_activity("fresh").unwrap();

        let removed = store.delete_completed_sessions(10).unwrap();
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(store.get_session("fresh").unwrap().is_some());
    }

    #[test]
    fn test_scrollback_numbering_starts_at_zero() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        assert_eq!(store.append_scrollback("s1", "first").unwrap(), 0);
        assert_eq!(store.append_scrollback("s1", "second").unwrap(), 1);
        assert_eq!(store.next_scrollback_line("s1").unwrap(), 2);
        assert_eq!(store.get_scrollback_line_count("s1").unwrap(), 2);
    }

    #[test]
    fn test_scrollback_requires_session() {
        let (_dir, store) = test_store();
        // Foreign keys are on: appending to an unknown session fails fast.
        assert!(store.append_scrollback("ghost", "line").is_err());
    }

    #[test]
    fn test_scrollback_batch_is_contiguous() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        store.append_scrollback("s1", "l0").unwrap();
        let ts = now_rfc3339();
        let batch: Vec<(String, String)> = (1..4).map(|i| (format!("l{i}"), ts.clone())).collect();
        let first = store.append_scrollback_batch("s1", &batch).unwrap();
        assert_eq!(first, 1);

        let lines = store.get_scrollback("s1", 0, 100).unwrap();
        let numbers: Vec<u64> = lines.iter().map(|l| l.line_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert_eq!(lines[3].content, "l3");
    }

    #[test]
    fn test_get_latest_scrollback_ascending() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        for i in 0..5 {
            store.append_scrollback("s1", &format!("l{i}")).unwrap();
        }
        let latest = store.get_latest_scrollback("s1", 2).unwrap();
        let contents: Vec<&str> = latest.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents, vec!["l3", "l4"]);
    }

    #[test]
    fn test_trim_scrollback_keeps_newest() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        for i in 0..10 {
            store.append_scrollback("s1", &format!("l{i}")).unwrap();
        }
        let removed = store.trim_scrollback("s1", 4).unwrap();
        assert_eq!(removed, 6);

        let lines = store.get_scrollback("s1", 0, 100).unwrap();
        let numbers: Vec<u64> = lines.iter().map(|l| l.line_number).collect();
        // Absolute numbering survives the trim.
        assert_eq!(numbers, vec![6, 7, 8, 9]);
        // Next append continues the sequence.
        assert_eq!(store.append_scrollback("s1", "l10").unwrap(), 10);
    }

    #[test]
    fn test_get_scrollback_from_line() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        for i in 0..5 {
            store.append_scrollback("s1", &format!("l{i}")).unwrap();
        }
        let lines = store.get_scrollback("s1", 3, 10).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_number, 3);
    }

    fn test_client(id: &str, session_id: Option<&str>) -> ClientRecord {
        let now = now_rfc3339();
        ClientRecord {
            id: id.to_string(),
            session_id: session_id.map(|s| s.to_string()),
            client_type: ClientType::Mobile,
            priority: Priority::Normal,
            connected_at: now.clone(),
            last_heartbeat: now,
            user_agent: Some("test-agent".to_string()),
        }
    }

    #[test]
    fn test_client_crud() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        store.add_client(&test_client("c1", Some("s1"))).unwrap();

        let loaded = store.get_client("c1").unwrap().unwrap();
        assert_eq!(loaded.session_id.as_deref(), Some("s1"));
        assert_eq!(loaded.client_type, ClientType::Mobile);
        assert_eq!(loaded.priority, Priority::Normal);

        store
            .update_client_priority("c1", Priority::Exclusive)
            .unwrap();
        let loaded = store.get_client("c1").unwrap().unwrap();
        assert_eq!(loaded.priority, Priority::Exclusive);

        store.update_client_session("c1", None).unwrap();
        let loaded = store.get_client("c1").unwrap().unwrap();
        assert!(loaded.session_id.is_none());

        assert!(store.remove_client("c1").unwrap());
        assert!(store.get_client("c1").unwrap().is_none());
    }

    #[test]
    fn test_clients_for_session() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        store.add_client(&test_client("c1", Some("s1"))).unwrap();
        store.add_client(&test_client("c2", Some("s1"))).unwrap();
        store.add_client(&test_client("c3", None)).unwrap();

        let clients = store.get_clients_for_session("s1").unwrap();
        assert_eq!(clients.len(), 2);
    }

    #[test]
    fn test_remove_stale_clients() {
        let (_dir, store) = test_store();
        store.add_client(&test_client("stale", None)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        store.add_client(&test_client("live", None)).unwrap();
        store.update_client_heartbeat("live").unwrap();

        let removed = store.remove_stale_clients(20).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_client("stale").unwrap().is_none());
        assert!(store.get_client("live").unwrap().is_some());
    }

    #[test]
    fn test_input_log_roundtrip() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        store.log_input("s1", "c1", "ls\n", true, None).unwrap();
        store
            .log_input("s1", "c2", "rm -rf /\n", false, Some("pc_typing"))
            .unwrap();

        let entries = store.get_input_log("s1", 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].accepted);
        assert!(entries[0].reject_reason.is_none());
        assert!(!entries[1].accepted);
        assert_eq!(entries[1].reject_reason.as_deref(), Some("pc_typing"));
        assert!(entries[0].auto_id < entries[1].auto_id);
    }

    #[test]
    fn test_input_log_limit_returns_latest() {
        let (_dir, store) = test_store();
        seed_session(&store, "s1");
        for i in 0..5 {
            store
                .log_input("s1", "c1", &format!("cmd{i}"), true, None)
                .unwrap();
        }
        let entries = store.get_input_log("s1", 2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].input, "cmd3");
        assert_eq!(entries[1].input, "cmd4");
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("sessions.db");
        {
            let store = SessionStore::open(&db).unwrap();
            seed_session(&store, "s1");
            store.append_scrollback("s1", "persisted").unwrap();
        }
        let store = SessionStore::open(&db).unwrap();
        assert!(store.get_session("s1").unwrap().is_some());
        assert_eq!(store.get_scrollback_line_count("s1").unwrap(), 1);
    }
}
