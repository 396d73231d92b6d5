//! HTTP passive proxy (spec.md §4.5.1).
//!
//! Tunnels an external HTTP request to whatever server the job runs, over a
//! bidirectional RPC stream rather than a real outbound HTTP client — there
//! is no `reqwest` in this crate's dependency tree, because the far side of
//! this proxy is always an agent-hosted `http_request` RPC method, never a
//! third-party origin (that case is `proxy::websocket`'s active bridge).
//!
//! Two pumps run concurrently within the request's scope: a request pump
//! forwards the incoming body, and a response pump (spawned so it can keep
//! draining the call after this handler returns a streaming `Response`)
//! reads back status, headers, then body chunks, in that fixed order.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::dispatcher::resolve_connection;
use crate::error::RouterError;
use crate::proxy::error_page;
use crate::rpc::{CallHandle, Frame};
use crate::state::AppState;

/// Headers the agent's response carries that this router always strips:
/// the agent's cache directives don't apply across the tunnel, and the
/// agent has already decompressed its own `Content-Encoding` before framing
/// chunks onto the RPC stream.
const STRIPPED_RESPONSE_HEADERS: [&str; 3] = ["cache-control", "expires", "content-encoding"];

pub async fn handle(
    State(state): State<AppState>,
    Path((conn_id, job_uid, path)): Path<(String, String, String)>,
    Query(query_items): Query<Vec<(String, String)>>,
    method: Method,
    headers: HeaderMap,
    request: Request,
) -> Response {
    match run(state, conn_id, job_uid, path, query_items, method, headers, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn run(
    state: AppState,
    conn_id: String,
    job_uid: String,
    path: String,
    query_items: Vec<(String, String)>,
    method: Method,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, RouterError> {
    let connection = resolve_connection(&state.registry, &conn_id)?;

    let header_items: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let handle = Arc::new(
        connection
            .call_bistream(
                "http_request",
                vec![
                    json!(job_uid),
                    json!(method.as_str()),
                    json!(format!("/{path}")),
                    json!(query_items),
                    json!(header_items),
                ],
                json!({}),
            )
            .await,
    );

    let request_pump = spawn_request_pump(handle.clone(), request.into_body());

    let status = match handle.recv().await {
        Some(Frame::Json(value)) => value.as_u64().and_then(|n| u16::try_from(n).ok()),
        _ => None,
    };
    let response_headers = match handle.recv().await {
        Some(Frame::Json(Value::Array(items))) => Some(items),
        _ => None,
    };

    let (status, response_headers) = match (status, response_headers) {
        (Some(status), Some(headers)) => (status, headers),
        _ => {
            request_pump.abort();
            let _ = request_pump.await;
            return Ok(error_page::render_incomplete_response(&handle).await);
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for item in &response_headers {
        if let Some((name, value)) = item.as_array().and_then(pair_of_strings) {
            if STRIPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) =
                (HeaderName::try_from(name), HeaderValue::from_str(&value))
            {
                builder = builder.header(name, value);
            }
        }
    }

    let body = Body::from_stream(spawn_response_pump(handle, request_pump));
    builder.body(body).map_err(|e| RouterError::Other(e.into()))
}

fn pair_of_strings(items: &[Value]) -> Option<(String, String)> {
    match items {
        [name, value] => Some((name.as_str()?.to_string(), value.as_str()?.to_string())),
        _ => None,
    }
}

/// Forward the request body to the stream in arrival order, then an empty
/// chunk for EOF; stops early once the agent has closed its receiving half.
fn spawn_request_pump(
    handle: Arc<CallHandle>,
    body: Body,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { break };
            if handle.send(Frame::Bytes(chunk)).await.is_err() {
                return;
            }
        }
        let _ = handle.send(Frame::Bytes(Bytes::new())).await;
    })
}

/// Drain body chunks from the call until the agent closes the stream, and
/// once it has, cancel (and always await) the request pump — it must never
/// outlive the response it was feeding.
fn spawn_response_pump(
    handle: Arc<CallHandle>,
    request_pump: tokio::task::JoinHandle<()>,
) -> ReceiverStream<Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            match handle.recv().await {
                Some(Frame::Bytes(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Some(Frame::Json(_)) | None => break,
            }
        }
        request_pump.abort();
        let _ = request_pump.await;
    });
    ReceiverStream::new(rx)
}
