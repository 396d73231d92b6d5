//! File and archive streams (spec.md §4.5.5).
//!
//! Grounded on `original_source/prouter/handlers/files.py::single_file`/
//! `archive`/`_send_file`/`_accept_file` line-for-line: download opens a
//! `call_istream`, whose first message is either a `{size}` header or
//! `None` (no such file); upload opens a `call_ostream` and enforces the
//! declared `Content-Length` against bytes actually received. An explicit
//! empty `Bytes` frame signals upload EOF to the agent, the same wire
//! convention `proxy::http`'s request pump uses for this crate's concrete
//! `WsConnection` realization.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::dispatcher::resolve_connection;
use crate::error::RouterError;
use crate::proxy::error_page;
use crate::rpc::{CallHandle, Frame};
use crate::state::AppState;

const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

#[derive(Debug, Deserialize, Default)]
pub struct FileDownloadQuery {
    #[serde(default)]
    remove: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FileUploadQuery {
    #[serde(default)]
    executable: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ArchiveDownloadQuery {
    #[serde(default)]
    include: Option<String>,
    #[serde(default)]
    exclude: Option<String>,
    #[serde(default)]
    compress: Option<u8>,
}

fn query_flag(value: Option<u8>) -> bool {
    value.unwrap_or(0) != 0
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(header::CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}

fn is_octet_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == CONTENT_TYPE_BINARY)
        .unwrap_or(false)
}

/// `GET`/`POST /jobs/{c}/{j}/file/{path:.+}` (spec.md §4.5.5).
pub async fn single_file(
    State(state): State<AppState>,
    Path((conn_id, job_uid, fspath)): Path<(String, String, String)>,
    Query(download_query): Query<FileDownloadQuery>,
    Query(upload_query): Query<FileUploadQuery>,
    method: axum::http::Method,
    headers: HeaderMap,
    request: axum::extract::Request,
) -> Response {
    let result = match method {
        axum::http::Method::GET => {
            download_file(state, conn_id, job_uid, fspath, query_flag(download_query.remove)).await
        }
        axum::http::Method::POST => {
            upload_file(
                state,
                conn_id,
                job_uid,
                fspath,
                query_flag(upload_query.executable),
                headers,
                request,
            )
            .await
        }
        _ => Err(RouterError::InvalidRequestData("unsupported HTTP method".to_string())),
    };
    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// `GET`/`POST /jobs/{c}/{j}/archive` (spec.md §4.5.5).
pub async fn archive(
    State(state): State<AppState>,
    Path((conn_id, job_uid)): Path<(String, String)>,
    Query(download_query): Query<ArchiveDownloadQuery>,
    method: axum::http::Method,
    headers: HeaderMap,
    request: axum::extract::Request,
) -> Response {
    let result = match method {
        axum::http::Method::GET => download_archive(state, conn_id, job_uid, download_query).await,
        axum::http::Method::POST => upload_archive(state, conn_id, job_uid, headers, request).await,
        _ => Err(RouterError::InvalidRequestData("unsupported HTTP method".to_string())),
    };
    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn download_file(
    state: AppState,
    conn_id: String,
    job_uid: String,
    fspath: String,
    remove: bool,
) -> Result<Response, RouterError> {
    let connection = resolve_connection(&state.registry, &conn_id)?;
    let handle = connection
        .call_istream("file_download", vec![json!(job_uid), json!(fspath)], json!({ "remove": remove }))
        .await;
    send_file(handle).await
}

async fn download_archive(
    state: AppState,
    conn_id: String,
    job_uid: String,
    query: ArchiveDownloadQuery,
) -> Result<Response, RouterError> {
    let connection = resolve_connection(&state.registry, &conn_id)?;
    let handle = connection
        .call_istream(
            "archive_download",
            vec![json!(job_uid)],
            json!({
                "include_mask": query.include,
                "exclude_mask": query.exclude,
                "compress": query_flag(query.compress),
            }),
        )
        .await;
    send_file(handle).await
}

/// Common `_send_file` body: first message is a `{size}` header or `None`.
/// On header, stream every subsequent `Bytes` frame straight to the
/// response body; on `None`, await the call's result to surface the
/// agent-side failure (spec.md §4.5.5).
async fn send_file(handle: CallHandle) -> Result<Response, RouterError> {
    let header = match handle.recv().await {
        Some(Frame::Json(Value::Null)) | None => None,
        Some(Frame::Json(value)) => Some(value),
        Some(Frame::Bytes(_)) => None,
    };

    let Some(header) = header else {
        return Ok(error_page::render_incomplete_response(&handle).await);
    };

    let size = header.get("size").and_then(Value::as_u64).unwrap_or(0);
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(async move {
        while let Some(frame) = handle.recv().await {
            if let Frame::Bytes(chunk) = frame {
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, CONTENT_TYPE_BINARY)
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| RouterError::Other(e.into()))
}

async fn upload_file(
    state: AppState,
    conn_id: String,
    job_uid: String,
    fspath: String,
    executable: bool,
    headers: HeaderMap,
    request: axum::extract::Request,
) -> Result<Response, RouterError> {
    let connection = resolve_connection(&state.registry, &conn_id)?;
    let declared_length = require_upload_preconditions(&headers)?;
    let handle = connection
        .call_ostream(
            "file_upload",
            vec![json!(job_uid), json!(fspath)],
            json!({ "executable": executable }),
        )
        .await;
    accept_file(handle, declared_length, request).await
}

async fn upload_archive(
    state: AppState,
    conn_id: String,
    job_uid: String,
    headers: HeaderMap,
    request: axum::extract::Request,
) -> Result<Response, RouterError> {
    let connection = resolve_connection(&state.registry, &conn_id)?;
    let declared_length = require_upload_preconditions(&headers)?;
    let handle = connection.call_ostream("archive_upload", vec![json!(job_uid)], json!({})).await;
    accept_file(handle, declared_length, request).await
}

fn require_upload_preconditions(headers: &HeaderMap) -> Result<u64, RouterError> {
    if !is_octet_stream(headers) {
        return Err(RouterError::InvalidRequestData(
            "unsupported content type for HTTP upload".to_string(),
        ));
    }
    content_length(headers)
        .ok_or_else(|| RouterError::InvalidRequestData("no Content-Length provided".to_string()))
}

/// Common `_accept_file` body: stream request chunks to the agent, erroring
/// on overrun of the declared `Content-Length` (a client error, per spec.md
/// §4.5's "request-payload integrity rule"), then an empty frame for EOF
/// and a check of the agent's accepted size against what was actually sent.
async fn accept_file(
    handle: CallHandle,
    declared_length: u64,
    request: axum::extract::Request,
) -> Result<Response, RouterError> {
    let mut received: u64 = 0;
    let mut stream = request.into_body().into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RouterError::Other(e.into()))?;
        received += chunk.len() as u64;
        if received > declared_length {
            return Err(RouterError::UploadSizeMismatch { declared: declared_length, received });
        }
        handle.send(Frame::Bytes(chunk)).await.map_err(RouterError::from)?;
    }
    let _ = handle.send(Frame::Bytes(Bytes::new())).await;

    let accepted = handle.result().await?;
    let accepted = accepted.as_u64().unwrap_or(received);
    if accepted != received {
        return Err(RouterError::UploadNotAccepted { accepted, sent: received });
    }
    Ok(StatusCode::OK.into_response())
}
