//! Connection Registry (spec.md §4.2).
//!
//! Tracks every live [`Connection`], indexed by its own id and, for
//! `SERVER`-mode (inbound) connections, by the peer uid presented in its
//! handshake. Both indices live behind one `std::sync::Mutex` rather than
//! one lock per index: registration and unregistration touch both maps
//! together and must appear atomic to readers, and lock-splitting here
//! would only buy parallelism the registry never needs (its critical
//! sections are all O(1) map operations).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::identity::Identity;
use crate::rpc::{Connection, ConnectionMode};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection '{0}' is not found")]
    ConnectionNotFound(String),
    #[error("no connected agent with uid '{0}'")]
    NoSuchPeer(String),
    #[error("connection '{0}' is already registered")]
    AlreadyRegistered(Uuid),
    #[error("incoming connection from peer '{0}' is already registered")]
    PeerAlreadyRegistered(String),
}

struct Indices {
    by_id: HashMap<Uuid, Arc<dyn Connection>>,
    by_peer_uid: HashMap<String, Arc<dyn Connection>>,
}

/// Registers, looks up, lists, and closes every connection this router
/// holds, for both the agent listener (inbound) and address-locator dials
/// (outbound).
pub struct ConnectionRegistry {
    indices: Mutex<Indices>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            indices: Mutex::new(Indices {
                by_id: HashMap::new(),
                by_peer_uid: HashMap::new(),
            }),
        }
    }

    /// All currently registered connections, in no particular order
    /// (spec.md §4.7 `/connections` admin endpoint, §4.6 idle watcher scan).
    pub fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.indices.lock().unwrap().by_id.values().cloned().collect()
    }

    pub fn by_id(&self, id: Uuid) -> Result<Arc<dyn Connection>, RegistryError> {
        self.indices
            .lock()
            .unwrap()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.to_string()))
    }

    /// Look up an inbound agent by the uid it presented at handshake time.
    /// Unrelated to the connection's own id (spec.md §4.1 invariant).
    pub fn by_peer_uid(&self, peer_uid: &str) -> Result<Arc<dyn Connection>, RegistryError> {
        self.indices
            .lock()
            .unwrap()
            .by_peer_uid
            .get(peer_uid)
            .cloned()
            .ok_or_else(|| RegistryError::NoSuchPeer(peer_uid.to_string()))
    }

    /// Register a freshly handshaken connection. For `SERVER`-mode
    /// connections, also indexes it by peer uid, rejecting a second
    /// simultaneous connection from the same peer uid, and wires an
    /// `on_close` callback that deregisters it automatically — mirrors
    /// `ConnectionManager.register`/`_unregister`.
    pub fn register(self: &Arc<Self>, connection: Arc<dyn Connection>) -> Result<(), RegistryError> {
        let id = connection.id();
        let peer_uid = Identity::get_uid(&connection.handshake_data()).map(str::to_string);

        {
            let mut indices = self.indices.lock().unwrap();
            if indices.by_id.contains_key(&id) {
                return Err(RegistryError::AlreadyRegistered(id));
            }
            if connection.mode() == ConnectionMode::Server {
                if let Some(peer_uid) = &peer_uid {
                    if indices.by_peer_uid.contains_key(peer_uid) {
                        return Err(RegistryError::PeerAlreadyRegistered(peer_uid.clone()));
                    }
                    indices.by_peer_uid.insert(peer_uid.clone(), connection.clone());
                }
            }
            indices.by_id.insert(id, connection.clone());
        }

        tracing::info!(
            connection_id = %id,
            mode = connection.mode().name(),
            peer_uid = peer_uid.as_deref().unwrap_or(""),
            "new connection"
        );

        let registry = self.clone();
        connection.on_close(Arc::new(move |connection| {
            registry.unregister(&connection);
        }));

        Ok(())
    }

    fn unregister(&self, connection: &Arc<dyn Connection>) {
        let mut indices = self.indices.lock().unwrap();
        indices.by_id.remove(&connection.id());
        let peer_uid = Identity::get_uid(&connection.handshake_data()).map(str::to_string);
        if connection.mode() == ConnectionMode::Server {
            if let Some(peer_uid) = &peer_uid {
                indices.by_peer_uid.remove(peer_uid);
            }
        }
        drop(indices);
        tracing::info!(
            connection_id = %connection.id(),
            mode = connection.mode().name(),
            peer_uid = peer_uid.as_deref().unwrap_or(""),
            "dropped connection"
        );
    }

    /// Close every registered connection, in preparation for process exit
    /// (spec.md §4.7 graceful shutdown drain).
    pub async fn close_all(&self) {
        let connections = self.snapshot();
        for connection in connections {
            connection.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.indices.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MockConnection;
    use serde_json::json;

    fn server_connection(uid: &str) -> Arc<dyn Connection> {
        Arc::new(
            MockConnection::new(ConnectionMode::Server)
                .with_handshake(json!({"auth": {"uid": uid, "name": "agent"}})),
        )
    }

    #[test]
    fn register_then_lookup_by_id_and_peer_uid() {
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = server_connection("agent-1");
        registry.register(conn.clone()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_id(conn.id()).unwrap().id(), conn.id());
        assert_eq!(registry.by_peer_uid("agent-1").unwrap().id(), conn.id());
    }

    #[test]
    fn register_rejects_duplicate_peer_uid() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.register(server_connection("agent-1")).unwrap();
        let err = registry.register(server_connection("agent-1")).unwrap_err();
        assert!(matches!(err, RegistryError::PeerAlreadyRegistered(_)));
    }

    #[test]
    fn lookup_missing_connection_errors() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(
            registry.by_id(Uuid::new_v4()),
            Err(RegistryError::ConnectionNotFound(_))
        ));
        assert!(matches!(
            registry.by_peer_uid("ghost"),
            Err(RegistryError::NoSuchPeer(_))
        ));
    }

    #[tokio::test]
    async fn closing_connection_deregisters_it() {
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = server_connection("agent-1");
        registry.register(conn.clone()).unwrap();
        assert_eq!(registry.len(), 1);

        conn.close().await;

        assert_eq!(registry.len(), 0);
        assert!(registry.by_peer_uid("agent-1").is_err());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.register(server_connection("a")).unwrap();
        registry.register(server_connection("b")).unwrap();
        assert_eq!(registry.len(), 2);

        registry.close_all().await;

        assert_eq!(registry.len(), 0);
    }
}
