//! Lifecycle Controller (spec.md §4.7).
//!
//! Starts the Control and (optional) Agent listeners and owns graceful
//! shutdown: on `SIGINT` or `POST /shutdown`, it closes every registered
//! connection, stops accepting new connections on each listener in reverse
//! startup order, sweeps any connection that raced in during that window,
//! and lets in-flight handler tasks drain before the process exits.
//!
//! Grounded on `channels/webhook_server.rs`'s oneshot-`shutdown_tx` +
//! `JoinHandle` per-listener shape, generalized to more than one listener and
//! to the "servers list filled after construction" cyclic-dependency fix
//! described in spec.md §9 (`original_source/prouter/__main__.py`'s
//! `ExitHandler`): the handle is constructed first, the control router is
//! wired against a clone of it for the `/shutdown` route, and only once both
//! listeners are actually bound are their per-listener handles pushed in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;

use crate::registry::ConnectionRegistry;

/// One bound-and-serving listener: the oneshot trigger stops it from
/// accepting new connections, and the `JoinHandle` resolves once axum's
/// graceful-shutdown drain (in-flight requests finish) completes.
pub struct ListenerHandle {
    name: &'static str,
    trigger: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Bind `addr`, serve `app` on it, and return a handle the
/// [`ShutdownHandle`] can later use to stop it gracefully.
pub async fn serve(name: &'static str, addr: SocketAddr, app: Router) -> std::io::Result<(ListenerHandle, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let (trigger, shutdown_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        tracing::info!(listener = name, addr = %bound_addr, "listening");
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        {
            tracing::error!(listener = name, error = %e, "listener exited with error");
        }
        tracing::info!(listener = name, "listener stopped");
    });

    Ok((ListenerHandle { name, trigger, join }, bound_addr))
}

/// Shared by the `/shutdown` route handler and the `SIGINT` signal task;
/// idempotent (spec.md §4.2 "closing is idempotent" extends here: a second
/// trigger is a no-op).
pub struct ShutdownHandle {
    registry: Arc<ConnectionRegistry>,
    listeners: Mutex<Vec<ListenerHandle>>,
    triggered: AtomicBool,
    done: Notify,
}

impl ShutdownHandle {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            listeners: Mutex::new(Vec::new()),
            triggered: AtomicBool::new(false),
            done: Notify::new(),
        })
    }

    /// Register a listener started after this handle was constructed, per
    /// the cyclic-dependency fix above.
    pub async fn push_listener(&self, handle: ListenerHandle) {
        self.listeners.lock().await.push(handle);
    }

    /// Run the full shutdown sequence exactly once. Safe to call
    /// concurrently (from both the signal task and a `/shutdown` request).
    pub async fn trigger(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            self.done.notified().await;
            return;
        }

        tracing::info!("shutdown requested: closing all connections");
        self.registry.close_all().await;

        let mut listeners = self.listeners.lock().await;
        while let Some(handle) = listeners.pop() {
            tracing::info!(listener = handle.name, "stopping listener");
            let _ = handle.trigger.send(());
            let _ = handle.join.await;
        }
        drop(listeners);

        // Sweep any connection that registered between the first close_all
        // and the listeners actually stopping accepting.
        self.registry.close_all().await;

        self.done.notify_waiters();
    }

    /// Block until [`Self::trigger`] has completed, for `main`'s final await.
    pub async fn wait(&self) {
        if self.triggered.load(Ordering::SeqCst) {
            return;
        }
        self.done.notified().await;
    }
}

/// Spawn a task that calls `shutdown.trigger()` on `SIGINT`.
pub fn install_signal_handler(shutdown: Arc<ShutdownHandle>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT");
            shutdown.trigger().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn trigger_is_idempotent_and_drains_listeners() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = ShutdownHandle::new(registry);

        let app = Router::new().route("/ping", get(|| async { "pong" }));
        let (handle, _addr) = serve("test", "127.0.0.1:0".parse().unwrap(), app).await.unwrap();
        shutdown.push_listener(handle).await;

        shutdown.trigger().await;
        shutdown.trigger().await; // second call must not hang or panic
        shutdown.wait().await;
    }
}
