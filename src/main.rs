//! pRouter: control-plane HTTP/WebSocket router that aggregates remote agent
//! hosts behind a single facade (spec.md §1, §2).
//!
//! Grounded on `original_source/prouter/__main__.py::main()`: load config,
//! apply `--set` overrides, set up logging, construct the long-lived
//! collaborators, bind whichever listeners are enabled, install the signal
//! handler, and block until shutdown drains.

mod admin;
mod cli;
mod config;
mod dispatcher;
mod error;
mod identity;
mod lifecycle;
mod proxy;
mod registry;
mod routes;
mod rpc;
mod selector;
mod state;
mod watcher;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::cli::Cli;
use crate::config::RouterConfig;
use crate::identity::Identity;
use crate::lifecycle::ShutdownHandle;
use crate::registry::ConnectionRegistry;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli);

    let mut config = match &cli.config {
        Some(path) => RouterConfig::load(path)?,
        None => RouterConfig::default(),
    };
    for set in &cli.set {
        config.apply_set(&set.path, &set.literal)?;
    }
    config.validate()?;

    let registry = Arc::new(ConnectionRegistry::new());
    let identity = Arc::new(Identity::new(
        config.identity.uid.clone(),
        config.identity.name.clone(),
        config.server.accept_tokens.clone(),
    ));
    let shutdown = ShutdownHandle::new(registry.clone());
    let state = AppState {
        registry,
        identity,
        polling_delay: Duration::from_secs_f64(config.client.polling_delay),
        shutdown: shutdown.clone(),
    };

    if config.server.enabled {
        let addr = bind_addr(config.server.interface.as_deref(), config.server.port);
        let (handle, bound) = lifecycle::serve("agent", addr, routes::agent_router(state.clone())).await?;
        tracing::info!(addr = %bound, "agent listener ready");
        shutdown.push_listener(handle).await;
    }

    let control_addr = bind_addr(config.control.interface.as_deref(), config.control.port);
    let (control_handle, control_bound) =
        lifecycle::serve("control", control_addr, routes::control_router(state.clone())).await?;
    tracing::info!(addr = %control_bound, "control listener ready");
    shutdown.push_listener(control_handle).await;

    lifecycle::install_signal_handler(shutdown.clone());
    shutdown.wait().await;

    Ok(())
}

fn bind_addr(interface: Option<&str>, port: u16) -> SocketAddr {
    let ip: IpAddr = interface
        .and_then(|s| s.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    SocketAddr::new(ip, port)
}

fn setup_logging(cli: &Cli) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_tracing_level().to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    if cli.connection_debug {
        tracing::debug!("connection_debug enabled: every inbound/outbound RPC frame will be traced");
    }
}
