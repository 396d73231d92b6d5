//! Route tables for both listeners (spec.md §4.7, §6.1).
//!
//! Grounded on `original_source/prouter/router_app.py`'s single-route `ROUTES`
//! list for the agent listener and `control_app.py`'s `ROUTES`/`MIDDLEWARES`
//! for the control listener; composition style follows
//! `orchestrator/api.rs::router()`'s `Router::route` chaining.

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderValue, header};
use axum::response::Response;
use axum::routing::{any, get, post};
use tower_http::compression::CompressionLayer;
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::admin;
use crate::dispatcher;
use crate::proxy;
use crate::rpc::ws::{self, axum_transport};
use crate::rpc::{Connection, ConnectionMode, WsConnection};
use crate::state::AppState;

/// `GET /rpc/v1`: the agent listener's one route (spec.md §4.7). Accepts the
/// WS upgrade unconditionally, then runs the handshake and registration on
/// the upgraded socket itself, since there is no way to reject an already-101
/// response with a different status code.
pub async fn accept_agent(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (mut sink, mut stream) = axum_transport::split(socket);
        let local = state.identity.server_handshake();

        let remote = match ws::accept_handshake(&mut sink, &mut stream, &local).await {
            Ok(remote) => remote,
            Err(err) => {
                tracing::warn!(error = %err, "agent handshake failed");
                return;
            }
        };

        if let Err(err) = state.identity.validate_incoming(&remote) {
            tracing::warn!(error = %err, "agent handshake rejected");
            return;
        }

        let connection = WsConnection::spawn(Box::new(sink), Box::new(stream), ConnectionMode::Server, remote);
        if let Err(err) = state.registry.register(connection.clone()) {
            tracing::warn!(error = %err, "failed to register agent connection");
            connection.close().await;
        }
    })
}

/// The Agent listener's router (spec.md §4.7): one route, no path
/// normalization or cache-control header (those are control-listener-only
/// concerns per `control_app.py`'s `MIDDLEWARES` and response hook).
pub fn agent_router(state: AppState) -> Router {
    Router::new()
        .route("/rpc/v1", get(accept_agent))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

const JOBS_PREFIX: &str = "/jobs/{conn_uid}/{job_uid}";

/// The Control listener's router (spec.md §6.1): admin, job dispatch, and
/// proxy/file routes, wrapped with path normalization and a cache-disabling
/// response header, mirroring `control_app.py`'s `MIDDLEWARES` list and its
/// `app.on_response_prepare.append(pagent.handlers.signals.disable_cache)`
/// hook — translated here as a `tower_http::set_header` layer rather than an
/// aiohttp response-prepare callback, since axum has no equivalent signal
/// and a layer is the idiomatic way to apply a header to every response.
///
/// Also negotiates gzip response compression (`compression-gzip`), matching
/// aiohttp's built-in `Content-Encoding: gzip` support for the admin/job JSON
/// payloads and archive downloads this listener serves.
pub fn control_router(state: AppState) -> Router {
    Router::new()
        .route("/info", get(admin::info))
        .route("/connections", get(admin::connections))
        .route("/shutdown", post(admin::shutdown))
        .route("/jobs/create", post(dispatcher::job_create))
        .route(&format!("{JOBS_PREFIX}/remove"), post(dispatcher::job_remove))
        .route(&format!("{JOBS_PREFIX}/wait"), post(dispatcher::job_wait))
        .route(&format!("{JOBS_PREFIX}/info"), get(dispatcher::job_info))
        .route(&format!("{JOBS_PREFIX}/start"), post(dispatcher::job_start))
        .route(&format!("{JOBS_PREFIX}/http/{{*path}}"), any(proxy::websocket::handle))
        .route(&format!("{JOBS_PREFIX}/wsconnect/{{*path}}"), post(proxy::websocket::active))
        .route(&format!("{JOBS_PREFIX}/file/{{*fspath}}"), any(proxy::files::single_file))
        .route(&format!("{JOBS_PREFIX}/archive"), any(proxy::files::archive))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(CompressionLayer::new())
        .layer(NormalizePathLayer::trim_trailing_slash())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::lifecycle::ShutdownHandle;
    use crate::registry::ConnectionRegistry;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let registry = Arc::new(ConnectionRegistry::new());
        let identity = Arc::new(Identity::new(Some("router-1".into()), "test-router", vec!["secret".into()]));
        let shutdown = ShutdownHandle::new(registry.clone());
        AppState { registry, identity, polling_delay: Duration::from_millis(10), shutdown }
    }

    #[tokio::test]
    async fn control_router_serves_info() {
        let app = control_router(test_state());
        let response = app
            .oneshot(Request::builder().method(Method::GET).uri("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
    }

    #[tokio::test]
    async fn control_router_normalizes_trailing_slash() {
        let app = control_router(test_state());
        let response = app
            .oneshot(Request::builder().method(Method::GET).uri("/info/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn control_router_404s_unknown_connection() {
        let app = control_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/jobs/not-a-uuid/job-1/info")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
