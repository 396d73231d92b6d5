//! The RPC `Connection` abstraction (spec.md §1, §3).
//!
//! Treated by the specification as "assumed provided": a connection offers
//! one unary call shape (`call_simple`) and three streaming call shapes
//! (`call_istream`, `call_ostream`, `call_bistream`), all carried over a
//! single underlying transport. This module defines that abstraction as an
//! object-safe trait plus one concrete realization (`ws::WsConnection`, over
//! a `tokio-tungstenite` socket) so the rest of the crate — Registry,
//! Selector, Dispatcher, Proxy Engine, Watcher — can be built and tested
//! against the trait without depending on the WebSocket specifics.
//!
//! Streaming calls return a concrete [`CallHandle`] rather than a trait
//! object: the caller (proxy/file handlers) sends and receives frames on the
//! handle the same way regardless of which `Connection` produced it, and a
//! concrete struct lets it be `send`/`recv`/`result`-polled without further
//! dynamic dispatch.

pub mod mock;
pub mod ws;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

pub use mock::MockConnection;
pub use ws::WsConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Inbound: the agent dialed the router.
    Server,
    /// Outbound: the router dialed the agent.
    Client,
}

impl ConnectionMode {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionMode::Server => "SERVER",
            ConnectionMode::Client => "CLIENT",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for remote result")]
    Timeout,
    #[error(transparent)]
    Method(#[from] RpcMethodError),
    #[error("transport error: {0}")]
    Transport(String),
}

/// A structured failure reported *by the agent* for a specific RPC method
/// call, as opposed to a transport-level failure. Mirrors the
/// `prpc.RpcError` shape the original source formats in
/// `_proxy_error_response` (type + message + remote traceback).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{cause_type}: {cause_message}")]
pub struct RpcMethodError {
    pub cause_type: String,
    pub cause_message: String,
    pub remote_traceback: String,
}

/// One frame exchanged over a streaming RPC call. Unary-looking control
/// values (status codes, header lists, upload/download headers) travel as
/// `Json`; request/response/file payload chunks travel as `Bytes`.
#[derive(Debug, Clone)]
pub enum Frame {
    Json(Value),
    Bytes(Bytes),
}

impl Frame {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Frame::Bytes(b) => Some(b),
            Frame::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Frame::Json(v) => Some(v),
            Frame::Bytes(_) => None,
        }
    }
}

type ResultFuture = Shared<BoxFuture<'static, Result<Value, RpcError>>>;

/// A handle to one in-flight streaming RPC call (istream/ostream/bistream).
///
/// `send`/`recv` drive the stream's two directions independently; `result`
/// resolves once the remote side has finished and reported its outcome
/// (mirrors Python `await call.result`).
pub struct CallHandle {
    outbound: mpsc::Sender<Frame>,
    inbound: Mutex<mpsc::Receiver<Frame>>,
    result: ResultFuture,
}

impl CallHandle {
    pub fn new(
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<Frame>,
        result: ResultFuture,
    ) -> Self {
        Self {
            outbound,
            inbound: Mutex::new(inbound),
            result,
        }
    }

    /// Send one frame toward the remote side. Returns `Err` if the remote
    /// has already closed its receiving half (`stream.is_closed` in Python).
    pub async fn send(&self, frame: Frame) -> Result<(), RpcError> {
        self.outbound.send(frame).await.map_err(|_| RpcError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Receive the next frame from the remote side, or `None` at stream end.
    pub async fn recv(&self) -> Option<Frame> {
        self.inbound.lock().await.recv().await
    }

    /// Await the call's final result (success value or `RpcMethodError`).
    pub async fn result(&self) -> Result<Value, RpcError> {
        self.result.clone().await
    }
}

pub type CloseCallback = Arc<dyn Fn(Arc<dyn Connection>) + Send + Sync>;

/// The abstraction every component above the transport layer programs
/// against. Object-safe via `async_trait` (which boxes the futures for
/// the unary/lifecycle methods); streaming methods return the concrete
/// [`CallHandle`] directly.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> Uuid;
    fn mode(&self) -> ConnectionMode;
    fn handshake_data(&self) -> Value;
    fn connected(&self) -> bool;
    fn active(&self) -> bool;

    async fn call_simple(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;
    async fn call_istream(&self, method: &str, args: Vec<Value>, kwargs: Value) -> CallHandle;
    async fn call_ostream(&self, method: &str, args: Vec<Value>, kwargs: Value) -> CallHandle;
    async fn call_bistream(&self, method: &str, args: Vec<Value>, kwargs: Value) -> CallHandle;

    /// Register a callback to run exactly once, in registration order, when
    /// this connection closes (spec.md §3: "all close callbacks fire exactly
    /// once in registration order").
    fn on_close(&self, callback: CloseCallback);

    async fn close(self: Arc<Self>);
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("mode", &self.mode().name())
            .field("connected", &self.connected())
            .finish()
    }
}

/// Shared close-callback bookkeeping used by both `WsConnection` and
/// `MockConnection`: fires each registered callback exactly once, guarded
/// by an `AtomicBool` so repeated `close()` calls are idempotent. Plain
/// `std::sync::Mutex` rather than `tokio::sync::Mutex` since registration
/// and firing are synchronous, non-blocking operations (the callbacks
/// themselves spawn async work if they need to).
pub(crate) struct CloseCallbacks {
    callbacks: std::sync::Mutex<Vec<CloseCallback>>,
    fired: AtomicBool,
}

impl CloseCallbacks {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: std::sync::Mutex::new(Vec::new()),
            fired: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, callback: CloseCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Run all callbacks in order, exactly once across the lifetime of this
    /// connection, even if called concurrently from multiple close paths.
    pub(crate) fn fire_once(&self, connection: Arc<dyn Connection>) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = self.callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            callback(connection.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn close_callbacks_fire_once_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let callbacks = CloseCallbacks::new();

        for i in 0..3 {
            let order = order.clone();
            let calls = calls.clone();
            callbacks.push(Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                order.lock().unwrap().push(i);
            }));
        }

        let conn: Arc<dyn Connection> = Arc::new(MockConnection::new(ConnectionMode::Server));
        callbacks.fire_once(conn.clone());
        callbacks.fire_once(conn);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
