//! Proxy error rendering (spec.md §4.5.4).
//!
//! Turns an `RpcError` (or a call that never produced enough messages to
//! answer the protocol) into the plain-text `502` body
//! `original_source/prouter/handlers/proxy.py::_proxy_error_response`
//! renders, rather than the generic `RouterError` → 500 path: a proxy
//! failure is a fault on the far side of the tunnel, not the router's own.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::rpc::{CallHandle, RpcError, RpcMethodError};

const RESULT_TIMEOUT: Duration = Duration::from_secs(5);
const RULE: &str = "----------------------------------------";

/// Render a `502 Bad Gateway` for an `RpcError` observed directly.
pub fn render_rpc_error(err: &RpcError) -> Response {
    let body = match err {
        RpcError::Method(method_err) => format_method_error(method_err),
        other => format!("Proxy error:\n{RULE}\n{other}"),
    };
    (StatusCode::BAD_GATEWAY, body).into_response()
}

/// A proxy call produced fewer messages than the protocol requires (e.g.
/// the HTTP response pump saw neither a status code nor a header list, or
/// the WS passive proxy never got its "connected" sentinel). Await the
/// call's result, bounded by a 5s timeout, on the chance an
/// `RpcMethodError` explains why; otherwise fall back to the generic
/// malformed-response message.
pub async fn render_incomplete_response(handle: &CallHandle) -> Response {
    match tokio::time::timeout(RESULT_TIMEOUT, handle.result()).await {
        Ok(Err(err)) => render_rpc_error(&err),
        _ => (StatusCode::BAD_GATEWAY, "Malformed response from agent.").into_response(),
    }
}

fn format_method_error(err: &RpcMethodError) -> String {
    format!("Proxy error:\n{RULE}\n{}\n{}\n{}", err.cause_type, err.cause_message, err.remote_traceback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::Value;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn renders_method_error_with_type_message_and_traceback() {
        let err = RpcError::Method(RpcMethodError {
            cause_type: "ValueError".into(),
            cause_message: "bad path".into(),
            remote_traceback: "Traceback (most recent call last): ...".into(),
        });
        let response = render_rpc_error(&err);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn incomplete_response_without_a_surfaced_error_is_malformed() {
        let (outbound, _outbound_rx) = mpsc::channel(1);
        let (_inbound_tx, inbound_rx) = mpsc::channel(1);
        let result = futures::future::ready(Ok(Value::Null)).boxed().shared();
        let handle = CallHandle::new(outbound, inbound_rx, result);

        let response = render_incomplete_response(&handle).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
