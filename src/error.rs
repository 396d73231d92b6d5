//! Crate-wide error taxonomy.
//!
//! Each module owns a narrower `thiserror` enum for its own failure modes
//! (see `identity::AuthError`, `registry::RegistryError`, `rpc::RpcError`,
//! `config::ConfigError`); this type is the union consumed at the HTTP
//! handler boundary, where this type's `IntoResponse` impl maps it to a
//! status code (spec.md §4.8's Error Middleware, realized here rather than
//! as a separate middleware layer).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::config::ConfigError;
use crate::identity::AuthError;
use crate::registry::RegistryError;
use crate::rpc::{RpcError, RpcMethodError};
use crate::selector::NoSuitableHost;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid request data: {0}")]
    InvalidRequestData(String),

    #[error("Invalid request payload:\n{0}")]
    SchemaError(String),

    #[error(transparent)]
    ConnectionNotFound(#[from] RegistryError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    NoSuitableHost(#[from] NoSuitableHost),

    #[error(transparent)]
    Rpc(RpcError),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("upload size mismatch: declared {declared}, received {received}")]
    UploadSizeMismatch { declared: u64, received: u64 },

    #[error("upload failed: agent accepted {accepted} bytes, client sent {sent}")]
    UploadNotAccepted { accepted: u64, sent: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RpcMethodError> for RouterError {
    fn from(err: RpcMethodError) -> Self {
        if err.cause_type == "JobNotFoundError" {
            RouterError::JobNotFound(err.cause_message)
        } else {
            RouterError::Rpc(RpcError::Method(err))
        }
    }
}

/// Manual rather than `#[from]`-derived: an `RpcError::Method` carrying a
/// `JobNotFoundError` cause must surface as 404 (spec.md §4.8), which needs
/// inspecting the wrapped `RpcMethodError` before it's boxed into `Rpc`.
impl From<RpcError> for RouterError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Method(method_err) => RouterError::from(method_err),
            other => RouterError::Rpc(other),
        }
    }
}

/// The HTTP-facing half of the error middleware (spec.md §4.8).
///
/// Path normalization is wired separately via `tower_http::normalize_path`;
/// this impl only handles the internal-kind -> status-code mapping.
impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            RouterError::InvalidRequestData(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            RouterError::SchemaError(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            RouterError::ConnectionNotFound(e) => (StatusCode::NOT_FOUND, e.to_string()),
            RouterError::JobNotFound(msg) => {
                (StatusCode::NOT_FOUND, format!("job not found: {msg}"))
            }
            RouterError::NoSuitableHost(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            RouterError::UploadSizeMismatch { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            RouterError::Auth(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            other => {
                tracing::error!(error = %other, "unhandled router error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, body).into_response()
    }
}
