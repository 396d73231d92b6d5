//! `Connection` over a WebSocket transport.
//!
//! A single background actor owns the socket (one reader task draining
//! incoming frames and demultiplexing them onto whichever call they belong
//! to, one writer task serializing outgoing frames in the order callers
//! produced them), following the `tokio::select!`-driven actor shape of
//! `sandbox/proxy/http.rs::HttpProxy::start`. Multiple concurrent
//! `call_istream`/`call_ostream`/`call_bistream` calls share the one socket,
//! tagged by a per-call numeric id.
//!
//! The wire format is intentionally simple (JSON envelopes, base64 for byte
//! payloads) since the spec treats the RPC codec as "assumed provided" —
//! this is one faithful realization of the `Connection` contract, not a
//! mandated wire protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use super::{CallHandle, CloseCallback, CloseCallbacks, Connection, ConnectionMode, RpcError, RpcMethodError};

/// Transport-agnostic message, bridging `tokio_tungstenite::Message` (used
/// for outbound/active-bridge connections) and `axum::extract::ws::Message`
/// (used for the inbound agent listener) onto one shape the actor drives.
#[derive(Debug, Clone)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// The writing half of a socket, owned exclusively by the writer actor task
/// so outgoing frames from concurrent calls are never interleaved mid-write.
#[async_trait]
pub trait WsSink: Send {
    async fn send(&mut self, msg: WsMessage) -> Result<(), RpcError>;
}

/// The reading half of a socket, owned exclusively by the reader actor task.
#[async_trait]
pub trait WsStream: Send {
    async fn recv(&mut self) -> Option<WsMessage>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
enum CallShape {
    Simple,
    IStream,
    OStream,
    BiStream,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
enum WireFrame {
    Json(Value),
    Bytes(String), // base64
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireEnvelope {
    Invoke {
        call_id: u64,
        method: String,
        args: Vec<Value>,
        kwargs: Value,
        shape: CallShape,
    },
    Frame {
        call_id: u64,
        frame: WireFrame,
    },
    End {
        call_id: u64,
    },
    Result {
        call_id: u64,
        value: Value,
    },
    Error {
        call_id: u64,
        cause_type: String,
        cause_message: String,
        remote_traceback: String,
    },
}

fn encode_frame(frame: &super::Frame) -> WireFrame {
    match frame {
        super::Frame::Json(v) => WireFrame::Json(v.clone()),
        super::Frame::Bytes(b) => WireFrame::Bytes(BASE64.encode(b)),
    }
}

fn decode_frame(frame: WireFrame) -> super::Frame {
    match frame {
        WireFrame::Json(v) => super::Frame::Json(v),
        WireFrame::Bytes(s) => {
            super::Frame::Bytes(Bytes::from(BASE64.decode(s).unwrap_or_default()))
        }
    }
}

struct PendingCall {
    frames: Option<mpsc::Sender<super::Frame>>,
    result: Option<oneshot::Sender<Result<Value, RpcError>>>,
}

struct Shared {
    id: Uuid,
    mode: ConnectionMode,
    handshake: Value,
    connected: AtomicBool,
    active_calls: AtomicI64,
    next_call_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    writer: mpsc::UnboundedSender<WsMessage>,
    close_callbacks: CloseCallbacks,
}

/// A `Connection` realized over a WebSocket-carried framing protocol.
pub struct WsConnection {
    shared: Arc<Shared>,
}

impl WsConnection {
    /// Take ownership of the socket's `sink`/`stream` halves, spawn the
    /// reader/writer actor tasks, and return a `Connection` ready to make
    /// and receive calls. The two halves are split by the caller (e.g.
    /// `tokio_tungstenite`'s `StreamExt::split` or `axum`'s `WebSocket::split`)
    /// so the writer task can hold the sink independently of the reader
    /// task's ownership of the stream — a single combined trait object would
    /// force one of the two actors to go without socket access entirely.
    pub fn spawn(
        mut sink: Box<dyn WsSink>,
        mut stream: Box<dyn WsStream>,
        mode: ConnectionMode,
        handshake: Value,
    ) -> Arc<dyn Connection> {
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WsMessage>();

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            mode,
            handshake,
            connected: AtomicBool::new(true),
            active_calls: AtomicI64::new(0),
            next_call_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: writer_tx,
            close_callbacks: CloseCallbacks::new(),
        });

        // Writer: the only task that ever writes to the socket, so frames
        // from concurrent calls are never interleaved mid-message.
        let writer_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                let is_close = matches!(msg, WsMessage::Close);
                let _ = sink.send(msg).await;
                if is_close {
                    break;
                }
            }
            writer_shared.connected.store(false, Ordering::SeqCst);
        });

        // Reader: demultiplexes incoming envelopes onto pending calls.
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Some(WsMessage::Text(text)) => {
                        if let Ok(envelope) = serde_json::from_str::<WireEnvelope>(&text) {
                            dispatch_envelope(&reader_shared, envelope).await;
                        }
                    }
                    Some(WsMessage::Binary(_)) | Some(WsMessage::Close) | None => break,
                }
            }
            reader_shared.connected.store(false, Ordering::SeqCst);
            fail_all_pending(&reader_shared, RpcError::Closed).await;
        });

        Arc::new(WsConnection { shared })
    }

    fn send_envelope(&self, envelope: WireEnvelope) -> Result<(), RpcError> {
        let text = serde_json::to_string(&envelope)
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        self.shared
            .writer
            .send(WsMessage::Text(text))
            .map_err(|_| RpcError::Closed)
    }

    async fn start_call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Value,
        shape: CallShape,
    ) -> (u64, oneshot::Receiver<Result<Value, RpcError>>, Option<mpsc::Receiver<super::Frame>>) {
        let call_id = self.shared.next_call_id.fetch_add(1, Ordering::SeqCst);
        self.shared.active_calls.fetch_add(1, Ordering::SeqCst);

        let (result_tx, result_rx) = oneshot::channel();
        let frame_rx = if matches!(shape, CallShape::Simple) {
            None
        } else {
            let (tx, rx) = mpsc::channel(32);
            self.shared
                .pending
                .lock()
                .await
                .entry(call_id)
                .or_insert(PendingCall { frames: None, result: None })
                .frames = Some(tx);
            Some(rx)
        };

        self.shared
            .pending
            .lock()
            .await
            .entry(call_id)
            .or_insert(PendingCall { frames: None, result: None })
            .result = Some(result_tx);

        let _ = self.send_envelope(WireEnvelope::Invoke {
            call_id,
            method: method.to_string(),
            args,
            kwargs,
            shape,
        });

        (call_id, result_rx, frame_rx)
    }
}

async fn dispatch_envelope(shared: &Arc<Shared>, envelope: WireEnvelope) {
    match envelope {
        WireEnvelope::Frame { call_id, frame } => {
            let pending = shared.pending.lock().await;
            if let Some(call) = pending.get(&call_id) {
                if let Some(tx) = &call.frames {
                    let _ = tx.send(decode_frame(frame)).await;
                }
            }
        }
        WireEnvelope::End { call_id } => {
            let mut pending = shared.pending.lock().await;
            if let Some(call) = pending.get_mut(&call_id) {
                call.frames = None; // dropping the sender closes the receiver
            }
        }
        WireEnvelope::Result { call_id, value } => {
            complete_call(shared, call_id, Ok(value)).await;
        }
        WireEnvelope::Error {
            call_id,
            cause_type,
            cause_message,
            remote_traceback,
        } => {
            complete_call(
                shared,
                call_id,
                Err(RpcError::Method(RpcMethodError {
                    cause_type,
                    cause_message,
                    remote_traceback,
                })),
            )
            .await;
        }
        WireEnvelope::Invoke { .. } => {
            // Inbound invocations (agent calling back into the router) are
            // not part of this crate's surface: the router only ever
            // initiates calls. Silently ignored.
        }
    }
}

async fn complete_call(shared: &Arc<Shared>, call_id: u64, outcome: Result<Value, RpcError>) {
    shared.active_calls.fetch_sub(1, Ordering::SeqCst);
    let mut pending = shared.pending.lock().await;
    if let Some(mut call) = pending.remove(&call_id) {
        if let Some(tx) = call.result.take() {
            let _ = tx.send(outcome);
        }
    }
}

async fn fail_all_pending(shared: &Arc<Shared>, err: RpcError) {
    let mut pending = shared.pending.lock().await;
    for (_, mut call) in pending.drain() {
        if let Some(tx) = call.result.take() {
            let _ = tx.send(Err(match &err {
                RpcError::Closed => RpcError::Closed,
                other => RpcError::Transport(other.to_string()),
            }));
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> Uuid {
        self.shared.id
    }

    fn mode(&self) -> ConnectionMode {
        self.shared.mode
    }

    fn handshake_data(&self) -> Value {
        self.shared.handshake.clone()
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn active(&self) -> bool {
        self.shared.active_calls.load(Ordering::SeqCst) > 0
    }

    async fn call_simple(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let (_, result_rx, _) = self.start_call(method, args, Value::Null, CallShape::Simple).await;
        result_rx.await.map_err(|_| RpcError::Closed)?
    }

    async fn call_istream(&self, method: &str, args: Vec<Value>, kwargs: Value) -> CallHandle {
        self.open_stream(method, args, kwargs, CallShape::IStream).await
    }

    async fn call_ostream(&self, method: &str, args: Vec<Value>, kwargs: Value) -> CallHandle {
        self.open_stream(method, args, kwargs, CallShape::OStream).await
    }

    async fn call_bistream(&self, method: &str, args: Vec<Value>, kwargs: Value) -> CallHandle {
        self.open_stream(method, args, kwargs, CallShape::BiStream).await
    }

    fn on_close(&self, callback: CloseCallback) {
        self.shared.close_callbacks.push(callback);
    }

    async fn close(self: Arc<Self>) {
        let _ = self.shared.writer.send(WsMessage::Close);
        self.shared.connected.store(false, Ordering::SeqCst);
        let this: Arc<dyn Connection> = self.clone();
        self.shared.close_callbacks.fire_once(this);
    }
}

impl WsConnection {
    async fn open_stream(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Value,
        shape: CallShape,
    ) -> CallHandle {
        let (call_id, result_rx, frame_rx) =
            self.start_call(method, args, kwargs, shape).await;
        let frame_rx = frame_rx.expect("stream shapes always allocate a frame channel");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<super::Frame>(32);
        let writer = self.shared.writer.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let envelope = WireEnvelope::Frame {
                    call_id,
                    frame: encode_frame(&frame),
                };
                if let Ok(text) = serde_json::to_string(&envelope) {
                    if writer.send(WsMessage::Text(text)).is_err() {
                        break;
                    }
                }
            }
            let _ = writer.send(WsMessage::Text(
                serde_json::to_string(&WireEnvelope::End { call_id }).unwrap_or_default(),
            ));
        });

        let result = async move { result_rx.await.unwrap_or(Err(RpcError::Closed)) }
            .boxed()
            .shared();
        CallHandle::new(outbound_tx, frame_rx, result)
    }
}

/// Outbound (router-dials-agent) transport, over `tokio-tungstenite`'s
/// client socket (spec.md §4.4 `address` locator, `ws://<address>/rpc/v1`).
pub mod tungstenite_transport {
    use super::*;
    use futures::stream::{SplitSink, SplitStream};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message as TtMessage};

    type TtSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    pub struct Sink(SplitSink<TtSocket, TtMessage>);
    pub struct Stream(SplitStream<TtSocket>);

    /// Connect to `ws://{address}/rpc/v1` and split it into actor halves.
    pub async fn connect(address: &str) -> Result<(Sink, Stream), RpcError> {
        let url = format!("ws://{address}/rpc/v1");
        let (socket, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let (sink, stream) = socket.split();
        Ok((Sink(sink), Stream(stream)))
    }

    #[async_trait]
    impl WsSink for Sink {
        async fn send(&mut self, msg: WsMessage) -> Result<(), RpcError> {
            let wire = match msg {
                WsMessage::Text(t) => TtMessage::Text(t.into()),
                WsMessage::Binary(b) => TtMessage::Binary(b.into()),
                WsMessage::Close => TtMessage::Close(None),
            };
            self.0.send(wire).await.map_err(|e| RpcError::Transport(e.to_string()))
        }
    }

    #[async_trait]
    impl WsStream for Stream {
        async fn recv(&mut self) -> Option<WsMessage> {
            loop {
                match self.0.next().await? {
                    Ok(TtMessage::Text(t)) => return Some(WsMessage::Text(t.to_string())),
                    Ok(TtMessage::Binary(b)) => return Some(WsMessage::Binary(b.to_vec())),
                    Ok(TtMessage::Close(_)) => return Some(WsMessage::Close),
                    Ok(TtMessage::Ping(_)) | Ok(TtMessage::Pong(_)) | Ok(TtMessage::Frame(_)) => {
                        continue;
                    }
                    Err(_) => return Some(WsMessage::Close),
                }
            }
        }
    }
}

/// Inbound (agent-dials-router) transport, over `axum`'s upgraded socket
/// (spec.md §4.7 Agent listener, `GET /rpc/v1`).
pub mod axum_transport {
    use super::*;
    use axum::extract::ws::{Message as AxMessage, WebSocket};
    use futures::stream::{SplitSink, SplitStream};

    pub struct Sink(SplitSink<WebSocket, AxMessage>);
    pub struct Stream(SplitStream<WebSocket>);

    pub fn split(socket: WebSocket) -> (Sink, Stream) {
        let (sink, stream) = socket.split();
        (Sink(sink), Stream(stream))
    }

    #[async_trait]
    impl WsSink for Sink {
        async fn send(&mut self, msg: WsMessage) -> Result<(), RpcError> {
            let wire = match msg {
                WsMessage::Text(t) => AxMessage::Text(t.into()),
                WsMessage::Binary(b) => AxMessage::Binary(b.into()),
                WsMessage::Close => AxMessage::Close(None),
            };
            self.0.send(wire).await.map_err(|e| RpcError::Transport(e.to_string()))
        }
    }

    #[async_trait]
    impl WsStream for Stream {
        async fn recv(&mut self) -> Option<WsMessage> {
            loop {
                match self.0.next().await? {
                    Ok(AxMessage::Text(t)) => return Some(WsMessage::Text(t.to_string())),
                    Ok(AxMessage::Binary(b)) => return Some(WsMessage::Binary(b.to_vec())),
                    Ok(AxMessage::Close(_)) => return Some(WsMessage::Close),
                    Ok(AxMessage::Ping(_)) | Ok(AxMessage::Pong(_)) => continue,
                    Err(_) => return Some(WsMessage::Close),
                }
            }
        }
    }
}

/// One-shot handshake exchange performed on the raw sink/stream halves
/// *before* handing them off to [`WsConnection::spawn`]: the actor's own
/// read/write loops only understand [`WireEnvelope`], so the handshake
/// (a plain, untagged JSON envelope per `identity::Identity`) has to be
/// done first, synchronously, by whoever is establishing the connection.
///
/// `dial_handshake` is for the outbound (router dials agent) direction,
/// where the router speaks first; `accept_handshake` is for the inbound
/// (agent dials router) direction, where the agent speaks first.
pub async fn dial_handshake<S, T>(
    sink: &mut S,
    stream: &mut T,
    local: &Value,
) -> Result<Value, RpcError>
where
    S: WsSink + ?Sized,
    T: WsStream + ?Sized,
{
    send_envelope_raw(sink, local).await?;
    recv_envelope_raw(stream).await
}

pub async fn accept_handshake<S, T>(
    sink: &mut S,
    stream: &mut T,
    local: &Value,
) -> Result<Value, RpcError>
where
    S: WsSink + ?Sized,
    T: WsStream + ?Sized,
{
    let remote = recv_envelope_raw(stream).await?;
    send_envelope_raw(sink, local).await?;
    Ok(remote)
}

async fn send_envelope_raw<S: WsSink + ?Sized>(sink: &mut S, value: &Value) -> Result<(), RpcError> {
    let text = serde_json::to_string(value).map_err(|e| RpcError::Transport(e.to_string()))?;
    sink.send(WsMessage::Text(text)).await
}

async fn recv_envelope_raw<T: WsStream + ?Sized>(stream: &mut T) -> Result<Value, RpcError> {
    match stream.recv().await {
        Some(WsMessage::Text(text)) => {
            serde_json::from_str(&text).map_err(|e| RpcError::Transport(e.to_string()))
        }
        _ => Err(RpcError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An in-memory sink/stream pair for testing the actor without a real
    /// socket: frames sent on one side would appear as reads on the other
    /// if anyone were listening.
    struct ChannelSink(mpsc::UnboundedSender<WsMessage>);

    #[async_trait]
    impl WsSink for ChannelSink {
        async fn send(&mut self, msg: WsMessage) -> Result<(), RpcError> {
            self.0.send(msg).map_err(|_| RpcError::Closed)
        }
    }

    struct ChannelStream(mpsc::UnboundedReceiver<WsMessage>);

    #[async_trait]
    impl WsStream for ChannelStream {
        async fn recv(&mut self) -> Option<WsMessage> {
            self.0.recv().await
        }
    }

    #[tokio::test]
    async fn call_simple_without_a_responder_times_out_on_close() {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (_tx_b, rx_a) = mpsc::unbounded_channel::<WsMessage>();
        drop(rx_b);

        let conn = WsConnection::spawn(
            Box::new(ChannelSink(tx_a)),
            Box::new(ChannelStream(rx_a)),
            ConnectionMode::Client,
            Value::Null,
        );
        // No peer ever responds and the inbound channel is immediately
        // exhausted, so the reader loop observes `None` and closes.
        let result = conn.call_simple("job_create", vec![]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dial_and_accept_handshake_exchange_envelopes() {
        let (tx_dialer, rx_acceptor) = mpsc::unbounded_channel();
        let (tx_acceptor, rx_dialer) = mpsc::unbounded_channel();

        let mut dialer_sink = ChannelSink(tx_dialer);
        let mut dialer_stream = ChannelStream(rx_dialer);
        let mut acceptor_sink = ChannelSink(tx_acceptor);
        let mut acceptor_stream = ChannelStream(rx_acceptor);

        let dialer_local = serde_json::json!({"auth": {"uid": "router", "name": "r", "token": "t"}});
        let acceptor_local = serde_json::json!({"auth": {"uid": "router", "name": "r"}});

        let (dial_result, accept_result) = tokio::join!(
            dial_handshake(&mut dialer_sink, &mut dialer_stream, &dialer_local),
            accept_handshake(&mut acceptor_sink, &mut acceptor_stream, &acceptor_local),
        );

        assert_eq!(accept_result.unwrap(), dialer_local);
        assert_eq!(dial_result.unwrap(), acceptor_local);
    }
}
