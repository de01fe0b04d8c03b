//! OpenAI-compatible API routes.
//!
//! These routes let existing OpenAI clients and SDKs talk to Ollama through
//! the proxy. Requests are translated to the native format before they are
//! queued; responses are translated back as they arrive.

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::info;

use super::{dispatch, reject, Generation, Render, RequestMeta, UNKNOWN_MODEL};
use crate::convert::{chat_request_to_native, completion_request_to_native, tags_to_models};
use crate::error::{Dialect, ProxyError};
use crate::metrics::RequestTimer;
use crate::state::AppState;
use crate::types::openai::{ChatCompletionRequest, CompletionRequest};

pub const CHAT_COMPLETIONS: &str = "/v1/chat/completions";
pub const COMPLETIONS: &str = "/v1/completions";
pub const MODELS: &str = "/v1/models";

/// Chat completions endpoint
///
/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let meta = RequestMeta::from_headers(&headers);

    let request: ChatCompletionRequest = match parse(&body) {
        Ok(request) => request,
        Err(e) => return reject(&state, CHAT_COMPLETIONS, UNKNOWN_MODEL, &meta, Dialect::Compatible, e),
    };
    if request.messages.is_empty() {
        let err = ProxyError::InvalidRequest("messages must not be empty".into());
        return reject(&state, CHAT_COMPLETIONS, &request.model, &meta, Dialect::Compatible, err);
    }

    info!(
        model = %request.model,
        messages = request.messages.len(),
        stream = request.stream,
        has_tools = request.tools.is_some(),
        priority = %meta.priority,
        request_id = %meta.request_id,
        "Handling POST /v1/chat/completions"
    );

    let requested = request.model.clone();
    let user = meta.user(request.user.as_deref());
    let streaming = request.stream;
    let native = chat_request_to_native(request, &state.aliases);
    let backend_body = match serde_json::to_vec(&native) {
        Ok(b) => Bytes::from(b),
        Err(e) => {
            let err = ProxyError::Internal(e.to_string());
            return reject(&state, CHAT_COMPLETIONS, &native.model, &meta, Dialect::Compatible, err);
        }
    };

    let generation = Generation {
        endpoint: CHAT_COMPLETIONS,
        backend_path: "/api/chat",
        model: native.model,
        user,
        body: backend_body,
        request_bytes: body.len(),
        streaming,
        render: Render::Chat { id: format!("chatcmpl-{}", meta.request_id), model: requested },
    };
    dispatch(state, meta, generation).await
}

/// Text completions endpoint
///
/// POST /v1/completions
pub async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let meta = RequestMeta::from_headers(&headers);

    let request: CompletionRequest = match parse(&body) {
        Ok(request) => request,
        Err(e) => return reject(&state, COMPLETIONS, UNKNOWN_MODEL, &meta, Dialect::Compatible, e),
    };

    info!(
        model = %request.model,
        stream = request.stream,
        priority = %meta.priority,
        request_id = %meta.request_id,
        "Handling POST /v1/completions"
    );

    let requested = request.model.clone();
    let user = meta.user(request.user.as_deref());
    let streaming = request.stream;
    let native = completion_request_to_native(request, &state.aliases);
    let backend_body = match serde_json::to_vec(&native) {
        Ok(b) => Bytes::from(b),
        Err(e) => {
            let err = ProxyError::Internal(e.to_string());
            return reject(&state, COMPLETIONS, &native.model, &meta, Dialect::Compatible, err);
        }
    };

    let generation = Generation {
        endpoint: COMPLETIONS,
        backend_path: "/api/generate",
        model: native.model,
        user,
        body: backend_body,
        request_bytes: body.len(),
        streaming,
        render: Render::Completion { id: format!("cmpl-{}", meta.request_id), model: requested },
    };
    dispatch(state, meta, generation).await
}

/// List models endpoint. Not queued.
///
/// GET /v1/models
pub async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let meta = RequestMeta::from_headers(&headers);
    let timer = RequestTimer::start(
        Arc::clone(&state.collector),
        MODELS,
        UNKNOWN_MODEL,
        meta.priority,
        meta.started_at,
    );

    match state.proxy.list_models().await {
        Ok(tags) => {
            timer.finish(200);
            Json(tags_to_models(tags)).into_response()
        }
        Err(e) => {
            state.collector.record_error(UNKNOWN_MODEL, e.reason());
            timer.finish(e.status().as_u16());
            e.into_dialect_response(Dialect::Compatible)
        }
    }
}

/// Parse a request body, mapping failures to a 400.
fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProxyError> {
    let request: T =
        serde_json::from_slice(body).map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    Ok(request)
}
