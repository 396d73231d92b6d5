//! Job Dispatcher (spec.md §4.4).
//!
//! The dispatcher owns no job state of its own — every operation below
//! resolves a target `Connection` (by uid, by selection, or by freshly
//! dialing an address), forwards one RPC unary call onto it, and extends
//! whatever the agent returns with routing metadata the agent has no way
//! to know: the router-relative `path`, the `agent` block (platform +
//! properties from the connection's handshake), and — for `select` —
//! which `runtime` requirement was matched.
//!
//! Ported from `original_source/prouter/handlers/jobs.py` line-for-line for
//! the three locator branches and `_extend_job_info`; handler shape follows
//! `orchestrator/api.rs`'s bundled-state + `Result<Json<T>, ...>` idiom.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::RouterError;
use crate::identity::Identity;
use crate::registry::RegistryError;
use crate::rpc::ws::{self, tungstenite_transport};
use crate::rpc::{Connection, ConnectionMode, WsConnection};
use crate::selector::{self, Host};
use crate::state::AppState;
use crate::watcher;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobCreateRequest {
    pub name: String,
    pub agent: AgentLocator,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AgentLocator {
    Uid { uid: String },
    Address { address: String, token: String },
    Select { #[serde(default)] runtimes: Vec<RuntimeSpec> },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSpec {
    pub uid: String,
    #[serde(default)]
    pub platform: Vec<HashMap<String, Value>>,
    #[serde(default)]
    pub jobenv: Vec<JobEnvSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobEnvSpec {
    pub guid: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobStartRequest {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub port_expected_count: Option<i64>,
    #[serde(default)]
    pub forward_stdout: Option<bool>,
}

fn parse_body<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RouterError> {
    serde_json::from_value(value).map_err(|e| RouterError::SchemaError(e.to_string()))
}

/// Look up a connection by the `{c}` path segment. A segment that doesn't
/// even parse as a uuid is reported the same way as one that does but
/// isn't registered (spec.md §8 S5: body must contain "connection" and
/// "not found" either way).
pub(crate) fn resolve_connection(
    registry: &crate::registry::ConnectionRegistry,
    conn_id: &str,
) -> Result<Arc<dyn Connection>, RouterError> {
    match Uuid::parse_str(conn_id) {
        Ok(id) => Ok(registry.by_id(id)?),
        Err(_) => Err(RouterError::ConnectionNotFound(RegistryError::ConnectionNotFound(
            conn_id.to_string(),
        ))),
    }
}

fn validate_start_request(request: &JobStartRequest) -> Result<(), RouterError> {
    if request.args.is_empty() {
        return Err(RouterError::InvalidRequestData(
            "'args' must be a non-empty array".to_string(),
        ));
    }
    if let Some(count) = request.port_expected_count {
        if count < 0 {
            return Err(RouterError::InvalidRequestData(
                "'port_expected_count' must be >= 0".to_string(),
            ));
        }
    }
    Ok(())
}

/// Build a `Host` descriptor from a SERVER-mode connection's handshake, for
/// feeding into the Selector. `None` for a connection with no usable
/// handshake uid (shouldn't happen for a registered SERVER connection, but
/// the registry doesn't guarantee it at this layer).
fn host_from_connection(connection: &Arc<dyn Connection>) -> Option<Host> {
    let handshake = connection.handshake_data();
    let uid = Identity::get_uid(&handshake)?.to_string();
    let platform: HashMap<String, Value> = Identity::get_platform(&handshake)
        .as_object()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let properties: HashMap<String, String> = handshake
        .get("properties")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let jobenvs = selector::search_properties(&properties);
    Some(Host { uid, platform, jobenvs })
}

fn build_runtime(spec: RuntimeSpec) -> selector::Runtime {
    selector::Runtime {
        uid: spec.uid,
        platforms: spec.platform,
        jobenvs: spec
            .jobenv
            .into_iter()
            .map(|j| selector::JobEnv {
                guid: j.guid,
                version: selector::parse_version(&j.version),
                activate: None,
            })
            .collect(),
    }
}

/// Which connection a locator resolved to, and whatever bookkeeping the
/// `job_create` caller needs afterward: the matched runtime (for `select`)
/// and whether this connection was just dialed (so a later failure must
/// close it, per spec.md §4.4).
struct Resolved {
    connection: Arc<dyn Connection>,
    runtime: Option<(String, Option<String>)>,
    freshly_dialed: bool,
}

async fn resolve_locator(state: &AppState, locator: AgentLocator) -> Result<Resolved, RouterError> {
    match locator {
        AgentLocator::Uid { uid } => {
            let connection = state.registry.by_peer_uid(&uid)?;
            Ok(Resolved { connection, runtime: None, freshly_dialed: false })
        }
        AgentLocator::Select { runtimes } => {
            let candidates: Vec<(Host, Arc<dyn Connection>)> = state
                .registry
                .snapshot()
                .into_iter()
                .filter(|c| c.mode() == ConnectionMode::Server)
                .filter_map(|c| host_from_connection(&c).map(|h| (h, c)))
                .collect();
            let hosts: Vec<Host> = candidates.iter().map(|(h, _)| h.clone()).collect();
            let runtimes: Vec<selector::Runtime> = runtimes.into_iter().map(build_runtime).collect();

            let (picked, jobenv, runtime_uid) = selector::select(&hosts, &runtimes)?;
            let connection = candidates
                .iter()
                .find(|(h, _)| h.uid == picked.uid)
                .map(|(_, c)| c.clone())
                .expect("selector only returns a host drawn from `hosts`");

            Ok(Resolved {
                connection,
                runtime: runtime_uid.map(|uid| (uid, jobenv.and_then(|j| j.activate.clone()))),
                freshly_dialed: false,
            })
        }
        AgentLocator::Address { address, token } => dial_address(state, &address, &token).await,
    }
}

/// Open a new outbound `CLIENT`-mode connection to `address`, handshake, and
/// register it. Any failure along the way closes the connection before
/// propagating (spec.md §4.4). The idle watcher isn't started here: it's
/// installed once `job_create` itself succeeds, so a slow/failing
/// `job_create` call can't race the watcher into closing a connection that
/// has no job on it yet.
async fn dial_address(state: &AppState, address: &str, token: &str) -> Result<Resolved, RouterError> {
    let (mut sink, mut stream) = tungstenite_transport::connect(address).await?;
    let local = state.identity.client_handshake(token);
    let remote = ws::dial_handshake(&mut sink, &mut stream, &local).await?;

    let connection = WsConnection::spawn(Box::new(sink), Box::new(stream), ConnectionMode::Client, remote);

    if let Err(err) = state.registry.register(connection.clone()) {
        connection.close().await;
        return Err(err.into());
    }

    Ok(Resolved { connection, runtime: None, freshly_dialed: true })
}

/// Add `path`, `agent`, and (when known) `runtime` to an agent's reply.
/// Mirrors `original_source/prouter/handlers/jobs.py::_extend_job_info`.
fn extend_job_info(
    connection: &Arc<dyn Connection>,
    mut info: Value,
    runtime: Option<(&str, Option<&str>)>,
) -> Value {
    let handshake = connection.handshake_data();
    let platform = Identity::get_platform(&handshake);
    let properties = handshake.get("properties").cloned().unwrap_or_else(|| json!({}));

    if let Some(obj) = info.as_object_mut() {
        let job_uid = obj.get("uid").and_then(Value::as_str).unwrap_or("").to_string();
        obj.insert("path".to_string(), json!(format!("/jobs/{}/{}", connection.id(), job_uid)));
        obj.insert("agent".to_string(), json!({ "platform": platform, "properties": properties }));
        if let Some((runtime_uid, activate)) = runtime {
            let mut runtime_info = json!({ "uid": runtime_uid });
            if let Some(activate) = activate {
                runtime_info["activate"] = json!(activate);
            }
            obj.insert("runtime".to_string(), runtime_info);
        }
    }
    info
}

pub async fn job_create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, RouterError> {
    let request: JobCreateRequest = parse_body(body)?;
    let resolved = resolve_locator(&state, request.agent).await?;

    let result = resolved.connection.call_simple("job_create", vec![json!(request.name)]).await;
    let info = match result {
        Ok(info) => info,
        Err(err) => {
            if resolved.freshly_dialed {
                resolved.connection.clone().close().await;
            }
            return Err(err.into());
        }
    };

    if resolved.freshly_dialed {
        watcher::spawn(resolved.connection.clone(), state.polling_delay);
    }

    let runtime_ref = resolved.runtime.as_ref().map(|(uid, activate)| (uid.as_str(), activate.as_deref()));
    Ok(Json(extend_job_info(&resolved.connection, info, runtime_ref)))
}

pub async fn job_remove(
    State(state): State<AppState>,
    Path((conn_id, job_uid)): Path<(String, String)>,
) -> Result<Json<Value>, RouterError> {
    let connection = resolve_connection(&state.registry, &conn_id)?;
    let info = connection.call_simple("job_remove", vec![json!(job_uid)]).await?;
    Ok(Json(extend_job_info(&connection, info, None)))
}

pub async fn job_wait(
    State(state): State<AppState>,
    Path((conn_id, job_uid)): Path<(String, String)>,
) -> Result<Json<Value>, RouterError> {
    let connection = resolve_connection(&state.registry, &conn_id)?;
    let info = connection.call_simple("job_wait", vec![json!(job_uid)]).await?;
    Ok(Json(extend_job_info(&connection, info, None)))
}

pub async fn job_info(
    State(state): State<AppState>,
    Path((conn_id, job_uid)): Path<(String, String)>,
) -> Result<Json<Value>, RouterError> {
    let connection = resolve_connection(&state.registry, &conn_id)?;
    let info = connection.call_simple("job_info", vec![json!(job_uid)]).await?;
    Ok(Json(extend_job_info(&connection, info, None)))
}

pub async fn job_start(
    State(state): State<AppState>,
    Path((conn_id, job_uid)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, RouterError> {
    let connection = resolve_connection(&state.registry, &conn_id)?;
    let request: JobStartRequest = parse_body(body)?;
    validate_start_request(&request)?;

    let args = json!({
        "args": request.args,
        "env": request.env,
        "cwd": request.cwd,
        "port_expected_count": request.port_expected_count.unwrap_or(1),
        "forward_stdout": request.forward_stdout.unwrap_or(false),
    });
    let info = connection.call_simple("job_start", vec![json!(job_uid), args]).await?;
    Ok(Json(extend_job_info(&connection, info, None)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ShutdownHandle;
    use crate::registry::ConnectionRegistry;
    use crate::rpc::MockConnection;
    use std::time::Duration;

    fn test_state() -> AppState {
        let registry = Arc::new(ConnectionRegistry::new());
        let identity = Arc::new(Identity::new(Some("router-1".into()), "test-router", vec!["secret".into()]));
        let shutdown = ShutdownHandle::new(registry.clone());
        AppState { registry, identity, polling_delay: Duration::from_millis(10), shutdown }
    }

    fn server_connection(uid: &str) -> Arc<dyn Connection> {
        Arc::new(
            MockConnection::new(ConnectionMode::Server)
                .with_handshake(json!({"auth": {"uid": uid, "name": "agent"}, "platform": {"os": "linux"}})),
        )
    }

    #[test]
    fn extend_job_info_adds_path_and_agent_block() {
        let conn = server_connection("agent-1");
        let extended = extend_job_info(&conn, json!({"uid": "job-1"}), None);
        assert_eq!(extended["path"], json!(format!("/jobs/{}/job-1", conn.id())));
        assert_eq!(extended["agent"]["platform"]["os"], json!("linux"));
    }

    #[test]
    fn extend_job_info_adds_runtime_block_for_select_locator() {
        let conn = server_connection("agent-1");
        let extended = extend_job_info(&conn, json!({"uid": "job-1"}), Some(("rt-1", Some("activate.sh"))));
        assert_eq!(extended["runtime"]["uid"], json!("rt-1"));
        assert_eq!(extended["runtime"]["activate"], json!("activate.sh"));
    }

    #[test]
    fn validate_start_request_rejects_empty_args() {
        let request = JobStartRequest {
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            port_expected_count: None,
            forward_stdout: None,
        };
        assert!(matches!(validate_start_request(&request), Err(RouterError::InvalidRequestData(_))));
    }

    #[test]
    fn validate_start_request_rejects_negative_port_count() {
        let request = JobStartRequest {
            args: vec!["echo".into()],
            env: HashMap::new(),
            cwd: None,
            port_expected_count: Some(-1),
            forward_stdout: None,
        };
        assert!(matches!(validate_start_request(&request), Err(RouterError::InvalidRequestData(_))));
    }

    #[test]
    fn resolve_connection_on_malformed_id_reports_not_found() {
        let registry = ConnectionRegistry::new();
        let err = resolve_connection(&registry, "wrong_connection_id").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("connection"));
        assert!(message.contains("not found"));
    }

    #[tokio::test]
    async fn job_remove_extends_agent_reply() {
        let state = test_state();
        let mock = Arc::new(
            MockConnection::new(ConnectionMode::Server)
                .with_handshake(json!({"auth": {"uid": "agent-1", "name": "agent"}})),
        );
        mock.push_simple_response("job_remove", Ok(json!({"uid": "job-1"}))).await;
        let conn_id = mock.id();
        let connection: Arc<dyn Connection> = mock;
        state.registry.register(connection).unwrap();

        let result = job_remove(State(state), Path((conn_id.to_string(), "job-1".to_string()))).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn job_create_by_uid_resolves_registered_peer() {
        let state = test_state();
        let conn = Arc::new(
            MockConnection::new(ConnectionMode::Server)
                .with_handshake(json!({"auth": {"uid": "agent-1", "name": "agent"}})),
        );
        conn.push_simple_response("job_create", Ok(json!({"uid": "job-1"}))).await;
        state.registry.register(conn.clone()).unwrap();

        let body = json!({"name": "build", "agent": {"type": "uid", "uid": "agent-1"}});
        let result = job_create(State(state), Json(body)).await.unwrap();
        assert_eq!(result.0["uid"], json!("job-1"));
        assert!(result.0["path"].as_str().unwrap().contains("job-1"));
    }

    #[tokio::test]
    async fn job_create_rejects_unknown_locator_shape() {
        let state = test_state();
        let body = json!({"name": "x", "agent": {"wrong": "x"}});
        let result = job_create(State(state), Json(body)).await;
        assert!(matches!(result, Err(RouterError::SchemaError(_))));
    }
}
