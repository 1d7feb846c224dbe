//! Process-wide registry of connected clients.
//!
//! Tracks each socket's identity, session attachment, priority, and
//! heartbeat stamps, plus the outbound frame sender the hub uses for
//! broadcast fan-out. Mutations are serialized behind one lock; reads hand
//! out snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use mconnect_protocol::{ClientType, Priority};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::hub::protocol::ServerMessage;

/// Unix timestamp for "now" in milliseconds.
pub fn unix_now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// A connected client as tracked by the registry.
#[derive(Clone)]
pub struct ConnectedClient {
    pub id: String,
    /// Null between attaches.
    pub session_id: Option<String>,
    pub client_type: ClientType,
    pub priority: Priority,
    pub connected_at_ms: u64,
    pub last_heartbeat_ms: u64,
    pub user_agent: Option<String>,
    /// Outbound frame queue for WS clients; `None` for IPC attaches.
    pub sender: Option<UnboundedSender<ServerMessage>>,
}

#[derive(Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<Mutex<HashMap<String, ConnectedClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ConnectedClient>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, client: ConnectedClient) {
        debug!(
            event = "daemon.registry.client_registered",
            client_id = %client.id,
            client_type = %client.client_type,
        );
        self.lock().insert(client.id.clone(), client);
    }

    pub fn remove(&self, client_id: &str) -> Option<ConnectedClient> {
        let removed = self.lock().remove(client_id);
        if removed.is_some() {
            debug!(
                event = "daemon.registry.client_removed",
                client_id = client_id,
            );
        }
        removed
    }

    pub fn get(&self, client_id: &str) -> Option<ConnectedClient> {
        self.lock().get(client_id).cloned()
    }

    /// Associate a client with a session. Returns the previous attachment.
    pub fn attach(&self, client_id: &str, session_id: &str) -> Option<String> {
        let mut guard = self.lock();
        let client = guard.get_mut(client_id)?;
        let previous = client.session_id.replace(session_id.to_string());
        previous
    }

    /// Clear a client's session association. Returns the session it left.
    pub fn detach(&self, client_id: &str) -> Option<String> {
        let mut guard = self.lock();
        guard.get_mut(client_id)?.session_id.take()
    }

    pub fn session_of(&self, client_id: &str) -> Option<String> {
        self.lock().get(client_id)?.session_id.clone()
    }

    pub fn clients_for_session(&self, session_id: &str) -> Vec<ConnectedClient> {
        self.lock()
            .values()
            .filter(|c| c.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect()
    }

    pub fn heartbeat(&self, client_id: &str, now_ms: u64) {
        if let Some(client) = self.lock().get_mut(client_id) {
            client.last_heartbeat_ms = now_ms;
        }
    }

    pub fn set_priority(&self, client_id: &str, priority: Priority) {
        if let Some(client) = self.lock().get_mut(client_id) {
            client.priority = priority;
        }
    }

    /// Clients whose last heartbeat is older than `timeout_ms`.
    pub fn stale_ids(&self, timeout_ms: u64, now_ms: u64) -> Vec<String> {
        self.lock()
            .values()
            .filter(|c| now_ms.saturating_sub(c.last_heartbeat_ms) >= timeout_ms)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Queue a frame for one client. Silently drops if the client is gone or
    /// has no socket.
    pub fn send_to(&self, client_id: &str, msg: ServerMessage) {
        if let Some(client) = self.lock().get(client_id) {
            if let Some(sender) = &client.sender {
                let _ = sender.send(msg);
            }
        }
    }

    /// Queue a frame for every client attached to a session. A congested or
    /// closed client only loses its own copy.
    pub fn broadcast_to_session(&self, session_id: &str, msg: &ServerMessage) {
        for client in self.lock().values() {
            if client.session_id.as_deref() == Some(session_id) {
                if let Some(sender) = &client.sender {
                    let _ = sender.send(msg.clone());
                }
            }
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(id: &str, client_type: ClientType) -> ConnectedClient {
        ConnectedClient {
            id: id.to_string(),
            session_id: None,
            client_type,
            priority: Priority::default_for(client_type),
            connected_at_ms: 1_000,
            last_heartbeat_ms: 1_000,
            user_agent: None,
            sender: None,
        }
    }

    #[test]
    fn test_register_get_remove() {
        let registry = ClientRegistry::new();
        registry.register(test_client("c1", ClientType::Pc));
        assert_eq!(registry.count(), 1);

        let loaded = registry.get("c1").unwrap();
        assert_eq!(loaded.priority, Priority::High);

        assert!(registry.remove("c1").is_some());
        assert!(registry.get("c1").is_none());
        assert!(registry.remove("c1").is_none());
    }

    #[test]
    fn test_attach_detach() {
        let registry = ClientRegistry::new();
        registry.register(test_client("c1", ClientType::Mobile));

        assert_eq!(registry.attach("c1", "s1"), None);
        assert_eq!(registry.session_of("c1").as_deref(), Some("s1"));

        // Re-attach replaces the association.
        assert_eq!(registry.attach("c1", "s2").as_deref(), Some("s1"));

        assert_eq!(registry.detach("c1").as_deref(), Some("s2"));
        assert!(registry.session_of("c1").is_none());
    }

    #[test]
    fn test_clients_for_session() {
        let registry = ClientRegistry::new();
        registry.register(test_client("c1", ClientType::Pc));
        registry.register(test_client("c2", ClientType::Mobile));
        registry.register(test_client("c3", ClientType::Mobile));
        registry.attach("c1", "s1");
        registry.attach("c2", "s1");
        registry.attach("c3", "s2");

        let attached = registry.clients_for_session("s1");
        assert_eq!(attached.len(), 2);
    }

    #[test]
    fn test_stale_ids() {
        let registry = ClientRegistry::new();
        registry.register(test_client("old", ClientType::Mobile));
        registry.register(test_client("fresh", ClientType::Mobile));
        registry.heartbeat("fresh", 80_000);

        let stale = registry.stale_ids(90_000, 91_001);
        assert_eq!(stale, vec!["old".to_string()]);
    }

    #[test]
    fn test_broadcast_scoped_to_session() {
        let registry = ClientRegistry::new();
        let (tx1, mut rx1) = tokio::sync::mpsc::unbounded_channel();
        let (tx2, mut rx2) = tokio::sync::mpsc::unbounded_channel();

        let mut c1 = test_client("c1", ClientType::Mobile);
        c1.sender = Some(tx1);
        let mut c2 = test_client("c2", ClientType::Mobile);
        c2.sender = Some(tx2);
        registry.register(c1);
        registry.register(c2);
        registry.attach("c1", "s1");
        registry.attach("c2", "s2");

        registry.broadcast_to_session("s1", &ServerMessage::Pong);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_set_priority() {
        let registry = ClientRegistry::new();
        registry.register(test_client("c1", ClientType::Mobile));
        registry.set_priority("c1", Priority::Exclusive);
        assert_eq!(registry.get("c1").unwrap().priority, Priority::Exclusive);
    }
}
