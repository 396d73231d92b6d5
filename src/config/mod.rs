//! Configuration (spec.md §6.3), consumed by everything else but owned here.
//!
//! Structured the way the teacher's `sandbox/config.rs` structures
//! `SandboxConfig`: plain `serde`-deserializable structs with a hand-rolled
//! `validate()` rather than a JSON-schema crate. The file format is YAML
//! (`serde_yaml`), matching `original_source/prouter/config/__init__.py`'s
//! loader.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid --set override '{0}': {1}")]
    InvalidOverride(String, String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default = "default_identity_name")]
    pub name: String,
}

fn default_identity_name() -> String {
    "prouter".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { uid: None, name: default_identity_name() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub accept_tokens: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { enabled: false, interface: None, port: 0, accept_tokens: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { interface: None, port: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_polling_delay")]
    pub polling_delay: f64,
}

fn default_polling_delay() -> f64 {
    5.0
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { polling_delay: default_polling_delay() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl RouterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Validate this config, per spec.md §6.3. "Client mode" is always
    /// available (see DESIGN.md Open Question 1), so the only hard failures
    /// are malformed ports; an empty `accept_tokens` with `server.enabled`
    /// is a warning, matching the original's warn-only severity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.enabled && self.server.accept_tokens.is_empty() {
            tracing::warn!("server.enabled is true but accept_tokens is empty: no agent will be able to authenticate");
        }
        Ok(())
    }

    /// Apply a `--set key.path=<literal>` override (spec.md §6.4),
    /// mutating this config via a JSON round-trip so arbitrary nested paths
    /// can be set without per-field plumbing. Mirrors
    /// `original_source/prouter/config/__init__.py`'s dotted-path +
    /// `ast.literal_eval`-style override mechanism.
    pub fn apply_set(&mut self, path: &str, literal: &str) -> Result<(), ConfigError> {
        let mut value = serde_json::to_value(&*self)
            .map_err(|e| ConfigError::InvalidOverride(path.to_string(), e.to_string()))?;
        set_by_path(&mut value, path, parse_literal(literal))
            .map_err(|e| ConfigError::InvalidOverride(path.to_string(), e))?;
        *self = serde_json::from_value(value)
            .map_err(|e| ConfigError::InvalidOverride(path.to_string(), e.to_string()))?;
        Ok(())
    }
}

/// Parse a `--set` value the way Python's `ast.literal_eval` would for the
/// shapes this config actually uses: bools, numbers, or a bare string.
fn parse_literal(literal: &str) -> Value {
    match literal {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = literal.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = literal.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(literal.to_string())
}

fn set_by_path(root: &mut Value, path: &str, leaf: Value) -> Result<(), String> {
    let parts: Vec<&str> = path.split('.').collect();
    if parts.is_empty() {
        return Err("empty path".to_string());
    }
    let mut cursor = root;
    for part in &parts[..parts.len() - 1] {
        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        cursor = cursor
            .as_object_mut()
            .unwrap()
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Default::default());
    }
    cursor
        .as_object_mut()
        .unwrap()
        .insert(parts[parts.len() - 1].to_string(), leaf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RouterConfig::default().validate().is_ok());
    }

    #[test]
    fn set_override_mutates_nested_field() {
        let mut config = RouterConfig::default();
        config.apply_set("client.polling_delay", "0.1").unwrap();
        assert_eq!(config.client.polling_delay, 0.1);
    }

    #[test]
    fn set_override_parses_bool_literal() {
        let mut config = RouterConfig::default();
        config.apply_set("server.enabled", "true").unwrap();
        assert!(config.server.enabled);
    }

    #[test]
    fn set_override_parses_string_literal() {
        let mut config = RouterConfig::default();
        config.apply_set("identity.name", "my-router").unwrap();
        assert_eq!(config.identity.name, "my-router");
    }

    #[test]
    fn load_parses_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "identity:\n  name: test\nserver:\n  enabled: true\n  port: 9000\n  accept_tokens: [\"tok\"]\ncontrol:\n  port: 9001\n",
        )
        .unwrap();

        let config = RouterConfig::load(&path).unwrap();
        assert_eq!(config.identity.name, "test");
        assert!(config.server.enabled);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.control.port, 9001);
    }
}
