//! A scripted, in-process `Connection` for exercising the Dispatcher and
//! Proxy Engine without a real WebSocket, mirroring the `StubLlm` test
//! double in `orchestrator/api.rs`'s test module: a fixture whose behavior
//! is configured per-test rather than hard-coded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use super::{CallHandle, CloseCallback, CloseCallbacks, Connection, ConnectionMode, RpcError};

/// A script run against the "agent side" of a streaming call: receives the
/// caller's frames and sends its own, then returns the call's final result.
pub type StreamScript =
    Arc<dyn Fn(CallHandle) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

pub struct MockConnection {
    id: Uuid,
    mode: ConnectionMode,
    handshake: std::sync::Mutex<Value>,
    connected: AtomicBool,
    active: AtomicBool,
    simple: Mutex<HashMap<String, VecDeque<Result<Value, RpcError>>>>,
    streams: Mutex<HashMap<String, StreamScript>>,
    close_callbacks: CloseCallbacks,
}

impl MockConnection {
    pub fn new(mode: ConnectionMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            handshake: std::sync::Mutex::new(Value::Object(Default::default())),
            connected: AtomicBool::new(true),
            active: AtomicBool::new(false),
            simple: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            close_callbacks: CloseCallbacks::new(),
        }
    }

    pub fn with_handshake(self, handshake: Value) -> Self {
        *self.handshake.lock().unwrap() = handshake;
        self
    }

    pub async fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Queue a canned reply for the next `call_simple` with this method name.
    pub async fn push_simple_response(&self, method: &str, response: Result<Value, RpcError>) {
        self.simple
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push_back(response);
    }

    /// Install the agent-side behavior for a streaming call.
    pub async fn set_stream_script(&self, method: &str, script: StreamScript) {
        self.streams.lock().await.insert(method.to_string(), script);
    }

    async fn run_stream(&self, method: &str) -> CallHandle {
        let (caller_tx, script_rx) = mpsc::channel(32);
        let (script_tx, caller_rx) = mpsc::channel(32);
        let dummy_result = futures::future::ready(Err(RpcError::Closed)).boxed().shared();
        let script_side = CallHandle::new(script_tx, script_rx, dummy_result);

        let script = self.streams.lock().await.get(method).cloned();
        let method = method.to_string();

        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let outcome = match script {
                Some(script) => script(script_side).await,
                None => Err(RpcError::Transport(format!(
                    "no stream script configured for '{method}'"
                ))),
            };
            let _ = result_tx.send(outcome);
        });

        let result = async move { result_rx.await.unwrap_or(Err(RpcError::Closed)) }
            .boxed()
            .shared();
        CallHandle::new(caller_tx, caller_rx, result)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    fn mode(&self) -> ConnectionMode {
        self.mode
    }

    fn handshake_data(&self) -> Value {
        self.handshake.lock().unwrap().clone()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn call_simple(&self, method: &str, _args: Vec<Value>) -> Result<Value, RpcError> {
        let mut simple = self.simple.lock().await;
        match simple.get_mut(method).and_then(VecDeque::pop_front) {
            Some(result) => result,
            None => Ok(Value::Null),
        }
    }

    async fn call_istream(&self, method: &str, _args: Vec<Value>, _kwargs: Value) -> CallHandle {
        self.run_stream(method).await
    }

    async fn call_ostream(&self, method: &str, _args: Vec<Value>, _kwargs: Value) -> CallHandle {
        self.run_stream(method).await
    }

    async fn call_bistream(&self, method: &str, _args: Vec<Value>, _kwargs: Value) -> CallHandle {
        self.run_stream(method).await
    }

    fn on_close(&self, callback: CloseCallback) {
        self.close_callbacks.push(callback);
    }

    async fn close(self: Arc<Self>) {
        self.connected.store(false, Ordering::SeqCst);
        let this: Arc<dyn Connection> = self.clone();
        self.close_callbacks.fire_once(this);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn call_simple_returns_queued_response() {
        let conn = MockConnection::new(ConnectionMode::Server);
        conn.push_simple_response("job_count_current_connection", Ok(Value::from(0)))
            .await;
        let result = conn
            .call_simple("job_count_current_connection", vec![])
            .await
            .unwrap();
        assert_eq!(result, Value::from(0));
    }

    #[tokio::test]
    async fn call_simple_defaults_to_null() {
        let conn = MockConnection::new(ConnectionMode::Server);
        let result = conn.call_simple("whatever", vec![]).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn stream_script_echoes_frames() {
        let conn = MockConnection::new(ConnectionMode::Server);
        conn.set_stream_script(
            "http_request",
            Arc::new(|handle: CallHandle| {
                async move {
                    let frame = handle.recv().await;
                    if let Some(frame) = frame {
                        handle.send(frame).await.ok();
                    }
                    Ok(Value::Null)
                }
                .boxed()
            }),
        )
        .await;

        let handle = conn.call_bistream("http_request", vec![], Value::Null).await;
        handle
            .send(super::super::Frame::Json(Value::from(200)))
            .await
            .unwrap();
        let echoed = handle.recv().await.unwrap();
        assert_eq!(echoed.as_json(), Some(&Value::from(200)));
    }
}
