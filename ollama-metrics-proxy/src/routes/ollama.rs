//! Ollama-native API routes.
//!
//! Bodies are forwarded to Ollama byte for byte. They are parsed only to
//! validate them and to read `model` and `stream`.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, response::Response};
use bytes::Bytes;
use tracing::info;

use super::{dispatch, reject, Generation, Render, RequestMeta, UNKNOWN_MODEL};
use crate::error::{Dialect, ProxyError};
use crate::state::AppState;
use crate::types::ollama::RequestHead;

pub const GENERATE: &str = "/api/generate";
pub const CHAT: &str = "/api/chat";

/// Generate completion
///
/// POST /api/generate
pub async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward_native(state, &headers, body, GENERATE).await
}

/// Chat completion
///
/// POST /api/chat
pub async fn chat(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    forward_native(state, &headers, body, CHAT).await
}

async fn forward_native(
    state: Arc<AppState>,
    headers: &HeaderMap,
    body: Bytes,
    path: &'static str,
) -> Response {
    let meta = RequestMeta::from_headers(headers);

    let head = match parse_head(&body) {
        Ok(head) => head,
        Err(e) => return reject(&state, path, UNKNOWN_MODEL, &meta, Dialect::Native, e),
    };

    info!(
        model = %head.model,
        stream = head.is_streaming(),
        priority = %meta.priority,
        request_id = %meta.request_id,
        "Handling POST {}",
        path
    );

    let generation = Generation {
        endpoint: path,
        backend_path: path,
        user: meta.user(None),
        request_bytes: body.len(),
        streaming: head.is_streaming(),
        model: head.model,
        body,
        render: Render::Native,
    };
    dispatch(state, meta, generation).await
}

fn parse_head(body: &[u8]) -> Result<RequestHead, ProxyError> {
    let head: RequestHead =
        serde_json::from_slice(body).map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    if head.model.trim().is_empty() {
        return Err(ProxyError::InvalidRequest("model is required".into()));
    }
    Ok(head)
}
