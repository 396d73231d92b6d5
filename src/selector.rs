//! Agent Selector (spec.md §4.3): job-environment discovery and the
//! runtime/platform matching used to pick a host for a new job.
//!
//! Ported from `original_source/prouter/api/jobenv.py`. Two discovery forms
//! are supported, both reachable from a single agent-reported manifest
//! source: a flat map of `JOBENV__<guid>__<version>` environment-variable
//! style entries, or a directory of `*/manifest.yaml` files (spec.md's
//! "JobEnv discovery, both forms supported").

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
#[error("failed to select host for required runtimes")]
pub struct NoSuitableHost;

/// A dotted version, compared the way Python tuple comparison does:
/// lexicographic over components.
pub type Version = Vec<u32>;

pub fn parse_version(raw: &str) -> Version {
    raw.split('.').filter_map(|part| part.parse().ok()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobEnv {
    pub guid: String,
    pub version: Version,
    pub activate: Option<String>,
}

/// A host advertised to the router (agent's reported platform + installed
/// jobenvs), as distinct from the live `Connection` it arrived on.
#[derive(Debug, Clone)]
pub struct Host {
    pub uid: String,
    pub platform: HashMap<String, Value>,
    pub jobenvs: Vec<JobEnv>,
}

/// One runtime requirement attached to a job-create request: an optional
/// set of required platform constraints, and an optional set of acceptable
/// jobenvs (any one matching is sufficient).
#[derive(Debug, Clone)]
pub struct Runtime {
    pub uid: String,
    pub platforms: Vec<HashMap<String, Value>>,
    pub jobenvs: Vec<JobEnv>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    manifest_type: Option<String>,
    manifest_version: Option<String>,
    guid: Option<String>,
    version: Option<String>,
    activate: Option<String>,
}

const MANIFEST_FILE: &str = "manifest.yaml";
const MANIFEST_TYPE: &str = "jobenv";
const MANIFEST_VERSION: &str = "1.0.0";

/// Discover jobenvs from a flat `JOBENV__<guid>__<version>` properties map
/// (as reported by an agent in its handshake/platform data).
pub fn search_properties(properties: &HashMap<String, String>) -> Vec<JobEnv> {
    let mut result = Vec::new();
    for (key, value) in properties {
        if let Some((guid, version)) = parse_env_variable(key) {
            result.push(JobEnv {
                guid,
                version: parse_version(&version),
                activate: Some(value.clone()),
            });
        }
    }
    result
}

fn parse_env_variable(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix("JOBENV__")?;
    let (guid, version) = rest.rsplit_once("__")?;
    if guid.is_empty() || version.is_empty() {
        return None;
    }
    if !version.chars().next()?.is_ascii_digit() {
        return None;
    }
    Some((guid.to_string(), version.to_string()))
}

/// Discover jobenvs from a directory of `<name>/manifest.yaml` files,
/// skipping any manifest that doesn't declare itself as a `jobenv` of the
/// version this router understands, or whose `activate` script is missing.
pub fn search_manifests(root: &Path) -> std::io::Result<Vec<JobEnv>> {
    let mut result = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let manifest_path = entry.path().join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            continue;
        }
        let contents = std::fs::read_to_string(&manifest_path)?;
        let manifest: Manifest = match serde_yaml::from_str(&contents) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if manifest.manifest_type.as_deref() != Some(MANIFEST_TYPE) {
            continue;
        }
        if manifest.manifest_version.as_deref() != Some(MANIFEST_VERSION) {
            continue;
        }
        let (Some(guid), Some(version), Some(activate)) =
            (manifest.guid, manifest.version, manifest.activate)
        else {
            continue;
        };
        let activate_path: PathBuf = entry.path().join(&activate);
        if !activate_path.is_file() {
            continue;
        }
        result.push(JobEnv {
            guid,
            version: parse_version(&version),
            activate: Some(activate_path.to_string_lossy().into_owned()),
        });
    }
    Ok(result)
}

fn jobenv_matches(host_env: &JobEnv, required: &JobEnv) -> bool {
    host_env.guid == required.guid
        && host_env.version.first() == required.version.first()
        && host_env.version >= required.version
}

fn runtime_matches<'h>(runtime: &Runtime, host: &'h Host) -> Option<Option<&'h JobEnv>> {
    if !runtime.platforms.is_empty() {
        let platform_matched = runtime.platforms.iter().any(|platform| {
            platform
                .iter()
                .all(|(param, value)| host.platform.get(param) == Some(value))
        });
        if !platform_matched {
            return None;
        }
    }

    if runtime.jobenvs.is_empty() {
        return Some(None);
    }

    for required in &runtime.jobenvs {
        for host_env in &host.jobenvs {
            if jobenv_matches(host_env, required) {
                return Some(Some(host_env));
            }
        }
    }
    None
}

/// Pick a host able to satisfy every listed runtime requirement. With no
/// runtimes requested, any host is eligible and one is chosen uniformly at
/// random. Otherwise each host is checked against every runtime (first
/// matching runtime wins for that host); among hosts with at least one
/// match, one is again chosen uniformly at random — mirrors
/// `jobenv.py::select`'s `randint`-based tie-break exactly, just backed by
/// `rand` instead.
pub fn select<'h>(
    hosts: &'h [Host],
    runtimes: &[Runtime],
) -> Result<(&'h Host, Option<&'h JobEnv>, Option<String>), NoSuitableHost> {
    if hosts.is_empty() {
        return Err(NoSuitableHost);
    }

    if runtimes.is_empty() {
        let index = rand::thread_rng().gen_range(0..hosts.len());
        return Ok((&hosts[index], None, None));
    }

    let mut candidates: Vec<(&Host, Option<&JobEnv>, String)> = Vec::new();
    for host in hosts {
        for runtime in runtimes {
            if let Some(jobenv) = runtime_matches(runtime, host) {
                candidates.push((host, jobenv, runtime.uid.clone()));
                break;
            }
        }
    }

    if candidates.is_empty() {
        return Err(NoSuitableHost);
    }

    let index = rand::thread_rng().gen_range(0..candidates.len());
    let (host, jobenv, runtime_uid) = candidates.into_iter().nth(index).unwrap();
    Ok((host, jobenv, Some(runtime_uid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jobenv(guid: &str, version: &str) -> JobEnv {
        JobEnv { guid: guid.into(), version: parse_version(version), activate: None }
    }

    #[test]
    fn parses_compatible_dotted_version() {
        assert_eq!(parse_version("1.2.3"), vec![1, 2, 3]);
    }

    #[test]
    fn search_properties_extracts_jobenv_vars() {
        let mut props = HashMap::new();
        props.insert("JOBENV__python__3.10.0".to_string(), "/opt/py310/activate".to_string());
        props.insert("PATH".to_string(), "/usr/bin".to_string());

        let found = search_properties(&props);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].guid, "python");
        assert_eq!(found[0].version, vec![3, 10, 0]);
    }

    #[test]
    fn select_with_no_runtimes_returns_any_host() {
        let hosts = vec![
            Host { uid: "h1".into(), platform: HashMap::new(), jobenvs: vec![] },
        ];
        let (host, jobenv, runtime_uid) = select(&hosts, &[]).unwrap();
        assert_eq!(host.uid, "h1");
        assert!(jobenv.is_none());
        assert!(runtime_uid.is_none());
    }

    #[test]
    fn select_matches_on_platform_and_jobenv_version() {
        let mut platform = HashMap::new();
        platform.insert("os".to_string(), Value::from("linux"));
        let hosts = vec![Host {
            uid: "h1".into(),
            platform,
            jobenvs: vec![jobenv("python", "3.10.2")],
        }];

        let mut required_platform = HashMap::new();
        required_platform.insert("os".to_string(), Value::from("linux"));
        let runtimes = vec![Runtime {
            uid: "rt-1".into(),
            platforms: vec![required_platform],
            jobenvs: vec![jobenv("python", "3.10.0")],
        }];

        let (host, env, runtime_uid) = select(&hosts, &runtimes).unwrap();
        assert_eq!(host.uid, "h1");
        assert_eq!(env.unwrap().guid, "python");
        assert_eq!(runtime_uid, Some("rt-1".to_string()));
    }

    #[test]
    fn select_rejects_jobenv_with_older_minor_than_required() {
        let hosts = vec![Host {
            uid: "h1".into(),
            platform: HashMap::new(),
            jobenvs: vec![jobenv("python", "3.8.0")],
        }];
        let runtimes = vec![Runtime {
            uid: "rt-1".into(),
            platforms: vec![],
            jobenvs: vec![jobenv("python", "3.10.0")],
        }];
        assert!(matches!(select(&hosts, &runtimes), Err(NoSuitableHost)));
    }

    #[test]
    fn select_rejects_mismatched_platform() {
        let mut platform = HashMap::new();
        platform.insert("os".to_string(), Value::from("windows"));
        let hosts = vec![Host { uid: "h1".into(), platform, jobenvs: vec![] }];

        let mut required = HashMap::new();
        required.insert("os".to_string(), Value::from("linux"));
        let runtimes = vec![Runtime { uid: "rt-1".into(), platforms: vec![required], jobenvs: vec![] }];

        assert!(matches!(select(&hosts, &runtimes), Err(NoSuitableHost)));
    }

    #[test]
    fn select_on_empty_hosts_errors() {
        assert!(matches!(select(&[], &[]), Err(NoSuitableHost)));
    }
}
