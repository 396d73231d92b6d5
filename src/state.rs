//! Shared application state handed to every axum handler (control and agent
//! listeners alike). Bundles the long-lived collaborators the spec calls out
//! as components in their own right (§2): the Connection Registry, this
//! router's own Identity, the idle-watcher's `polling_delay`, and the
//! shutdown handle the Lifecycle Controller wires in.

use std::sync::Arc;
use std::time::Duration;

use crate::identity::Identity;
use crate::lifecycle::ShutdownHandle;
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub identity: Arc<Identity>,
    pub polling_delay: Duration,
    pub shutdown: Arc<ShutdownHandle>,
}
