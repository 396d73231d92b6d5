//! Control-plane admin routes (spec.md §6.1 `/info`, `/connections`,
//! `/shutdown`). Grounded on `original_source/prouter/handlers/admin.py`.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

/// `GET /info`: this router's own server handshake envelope.
pub async fn info(State(state): State<AppState>) -> Json<Value> {
    Json(state.identity.server_handshake())
}

/// `GET /connections`: uid/mode/peer for every currently registered
/// connection.
pub async fn connections(State(state): State<AppState>) -> Json<Value> {
    let connections: Vec<Value> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|conn| {
            json!({
                "uid": conn.id().to_string(),
                "mode": conn.mode().name(),
                "peer": conn.handshake_data(),
            })
        })
        .collect();
    Json(json!({ "connections": connections }))
}

/// `POST /shutdown`: schedules the graceful-exit sequence and returns
/// immediately (spec.md §4.7); the actual drain runs on
/// [`crate::lifecycle::ShutdownHandle::trigger`].
pub async fn shutdown(State(state): State<AppState>) -> axum::http::StatusCode {
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move { shutdown.trigger().await });
    axum::http::StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::lifecycle::ShutdownHandle;
    use crate::registry::ConnectionRegistry;
    use crate::rpc::{Connection, ConnectionMode, MockConnection};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> AppState {
        let registry = Arc::new(ConnectionRegistry::new());
        let identity = Arc::new(Identity::new(Some("router-1".into()), "test-router", vec!["secret".into()]));
        let shutdown = ShutdownHandle::new(registry.clone());
        AppState { registry, identity, polling_delay: Duration::from_millis(10), shutdown }
    }

    #[tokio::test]
    async fn info_returns_server_handshake() {
        let state = test_state();
        let Json(body) = info(State(state)).await;
        assert_eq!(body["auth"]["uid"], json!("router-1"));
        assert!(body["auth"].get("token").is_none());
    }

    #[tokio::test]
    async fn connections_lists_registered_peers() {
        let state = test_state();
        let conn: Arc<dyn Connection> = Arc::new(
            MockConnection::new(ConnectionMode::Server)
                .with_handshake(json!({"auth": {"uid": "agent-1", "name": "agent"}})),
        );
        state.registry.register(conn).unwrap();

        let Json(body) = connections(State(state)).await;
        let list = body["connections"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["mode"], json!("SERVER"));
        assert_eq!(list[0]["peer"]["auth"]["uid"], json!("agent-1"));
    }
}
