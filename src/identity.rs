//! Handshake envelope construction and validation (spec.md §4.1).
//!
//! A handshake is a nested JSON mapping:
//! `{"auth": {"uid": str, "name": str, ["token": str]}, "platform": {...}}`.
//! Server handshakes carry no token; client (outbound) handshakes carry
//! exactly one token drawn from the peer's accepted set.

use std::collections::HashSet;
use std::fmt;

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;

pub const KEY_AUTH: &str = "auth";
pub const KEY_UID: &str = "uid";
pub const KEY_NAME: &str = "name";
pub const KEY_TOKEN: &str = "token";
pub const KEY_PLATFORM: &str = "platform";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("handshake is not a mapping")]
    NotAMapping,
    #[error("handshake missing or malformed 'auth' section")]
    MissingAuth,
    #[error("handshake 'auth.uid' is empty or missing")]
    EmptyUid,
    #[error("handshake 'auth.name' is not a string")]
    InvalidName,
    #[error("handshake token is missing, empty, or not accepted")]
    InvalidToken,
}

/// Immutable identity of this router instance: its own uid/name, and the
/// set of tokens it accepts from inbound (SERVER-mode) peers.
///
/// Tokens are held as `SecretString` so a stray `{:?}` (log line, panic
/// message, error report) can't leak them; `Debug` below only ever prints
/// the count.
#[derive(Clone)]
pub struct Identity {
    uid: String,
    name: String,
    accept_tokens: HashSet<SecretTokenKey>,
}

/// Equality/hash wrapper around `SecretString` so the accepted-token set
/// can still be a `HashSet`, without exposing `Eq`/`Hash` on the secret
/// itself.
#[derive(Clone)]
struct SecretTokenKey(SecretString);

impl PartialEq for SecretTokenKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(
            self.0
                .expose_secret()
                .as_bytes()
                .ct_eq(other.0.expose_secret().as_bytes()),
        )
    }
}
impl Eq for SecretTokenKey {}
impl std::hash::Hash for SecretTokenKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.expose_secret().hash(state);
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("accept_tokens", &format!("<{} redacted>", self.accept_tokens.len()))
            .finish()
    }
}

impl Identity {
    pub fn new(uid: Option<String>, name: impl Into<String>, accept_tokens: Vec<String>) -> Self {
        Self {
            uid: uid.unwrap_or_else(generate_uid),
            name: name.into(),
            accept_tokens: accept_tokens
                .into_iter()
                .map(|t| SecretTokenKey(SecretString::from(t)))
                .collect(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Envelope this router presents to an inbound agent (no token).
    ///
    /// Mirrors `identity.py::get_server_handshake`'s
    /// `dict(platform.uname()._asdict())` platform block; Rust's stdlib has
    /// no `uname()` equivalent, so the same uname-shaped keys are populated
    /// from `std::env::consts` (no real-hostname lookup is wired, since no
    /// crate in this stack provides one).
    pub fn server_handshake(&self) -> Value {
        json!({
            KEY_AUTH: { KEY_UID: self.uid, KEY_NAME: self.name },
            KEY_PLATFORM: current_platform(),
        })
    }

    /// Envelope this router presents when it dials out to an agent by
    /// address (spec.md §4.4 `address` locator). Built on top of the server
    /// handshake so it inherits the same `platform` block, mirroring
    /// `identity.py::get_client_handshake`.
    pub fn client_handshake(&self, token: &str) -> Value {
        let mut handshake = self.server_handshake();
        handshake[KEY_AUTH][KEY_TOKEN] = json!(token);
        handshake
    }

    /// Validate a handshake received from an inbound agent connection.
    ///
    /// Mirrors `original_source/prouter/identity.py::validate_incoming_handshake`
    /// exactly: type-checks in order, then the token must be present,
    /// non-empty, a string, and a member of the allowlist, compared in
    /// constant time since the token is attacker-observable over the wire.
    pub fn validate_incoming(&self, envelope: &Value) -> Result<(), AuthError> {
        let obj = envelope.as_object().ok_or(AuthError::NotAMapping)?;
        let auth = obj
            .get(KEY_AUTH)
            .and_then(Value::as_object)
            .ok_or(AuthError::MissingAuth)?;

        let uid = auth.get(KEY_UID).and_then(Value::as_str).unwrap_or("");
        if uid.is_empty() {
            return Err(AuthError::EmptyUid);
        }

        if !matches!(auth.get(KEY_NAME), Some(Value::String(_))) {
            return Err(AuthError::InvalidName);
        }

        let token = auth
            .get(KEY_TOKEN)
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::InvalidToken)?;

        if !self.token_accepted(token) {
            return Err(AuthError::InvalidToken);
        }

        Ok(())
    }

    fn token_accepted(&self, token: &str) -> bool {
        self.accept_tokens.iter().any(|accepted| {
            bool::from(accepted.0.expose_secret().as_bytes().ct_eq(token.as_bytes()))
        })
    }

    /// Extract the peer uid from a validated handshake envelope.
    pub fn get_uid(envelope: &Value) -> Option<&str> {
        envelope.get(KEY_AUTH)?.get(KEY_UID)?.as_str()
    }

    /// Extract the token from a handshake envelope, if present.
    pub fn get_token(envelope: &Value) -> Option<&str> {
        envelope.get(KEY_AUTH)?.get(KEY_TOKEN)?.as_str()
    }

    /// Extract the platform (uname-like) mapping from a handshake envelope.
    pub fn get_platform(envelope: &Value) -> Value {
        envelope
            .get(KEY_PLATFORM)
            .cloned()
            .unwrap_or(Value::Object(Default::default()))
    }
}

/// Generate a random 128-bit uid, hex-encoded (32 chars), when none is
/// configured. Same construction as `orchestrator/auth.rs::generate_token`,
/// scaled down to 16 bytes.
fn generate_uid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Best-effort `uname()`-shaped map: `system`/`machine` come from
/// `std::env::consts`, and `node`/`release`/`version` fall back to empty
/// strings since nothing in this crate's dependency stack resolves a real
/// hostname or kernel release.
fn current_platform() -> Value {
    json!({
        "system": std::env::consts::OS,
        "node": "",
        "release": "",
        "version": "",
        "machine": std::env::consts::ARCH,
        "processor": "",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity::new(Some("router-1".into()), "test-router", vec!["secret".into()])
    }

    #[test]
    fn debug_redacts_tokens() {
        let id = identity();
        let rendered = format!("{id:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn generated_uid_is_32_hex_chars() {
        let id = Identity::new(None, "n", vec![]);
        assert_eq!(id.uid().len(), 32);
        assert!(id.uid().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn server_handshake_has_no_token() {
        let id = identity();
        let hs = id.server_handshake();
        assert!(hs[KEY_AUTH].get(KEY_TOKEN).is_none());
    }

    #[test]
    fn validate_accepts_correct_token() {
        let id = identity();
        let hs = json!({"auth": {"uid": "agent-1", "name": "a", "token": "secret"}});
        assert!(id.validate_incoming(&hs).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_token() {
        let id = identity();
        let hs = json!({"auth": {"uid": "agent-1", "name": "a", "token": "wrong"}});
        assert!(matches!(
            id.validate_incoming(&hs),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn validate_rejects_missing_auth() {
        let id = identity();
        let hs = json!({"platform": {}});
        assert!(matches!(id.validate_incoming(&hs), Err(AuthError::MissingAuth)));
    }

    #[test]
    fn validate_rejects_empty_uid() {
        let id = identity();
        let hs = json!({"auth": {"uid": "", "name": "a", "token": "secret"}});
        assert!(matches!(id.validate_incoming(&hs), Err(AuthError::EmptyUid)));
    }

    #[test]
    fn validate_rejects_non_string_name() {
        let id = identity();
        let hs = json!({"auth": {"uid": "x", "name": 5, "token": "secret"}});
        assert!(matches!(id.validate_incoming(&hs), Err(AuthError::InvalidName)));
    }

    #[test]
    fn validate_rejects_empty_token() {
        let id = identity();
        let hs = json!({"auth": {"uid": "x", "name": "a", "token": ""}});
        assert!(matches!(id.validate_incoming(&hs), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn get_uid_and_token_roundtrip() {
        let id = identity();
        let hs = id.client_handshake("secret");
        assert_eq!(Identity::get_uid(&hs), Some("router-1"));
        assert_eq!(Identity::get_token(&hs), Some("secret"));
    }
}
