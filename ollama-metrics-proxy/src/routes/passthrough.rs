//! Transparent forwarding for every backend path the proxy does not translate.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    response::Response,
};
use tracing::debug;

use super::{reject, RequestMeta, UNKNOWN_MODEL};
use crate::error::{Dialect, ProxyError};
use crate::metrics::RequestTimer;
use crate::proxy::{forwardable_headers, into_byte_stream};
use crate::state::AppState;
use crate::MAX_BODY_BYTES;

/// Endpoint label shared by all forwarded paths.
pub const PASSTHROUGH: &str = "passthrough";

/// Forward the request unchanged and stream the answer back. Not queued.
pub async fn passthrough(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let meta = RequestMeta::from_headers(request.headers());
    let (parts, body) = request.into_parts();
    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    debug!(method = %parts.method, path = %path_and_query, request_id = %meta.request_id, "Forwarding to Ollama");

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            let err = ProxyError::InvalidRequest(format!("Failed to read request body: {}", e));
            return reject(&state, PASSTHROUGH, UNKNOWN_MODEL, &meta, Dialect::Native, err);
        }
    };

    let timer = RequestTimer::start(
        Arc::clone(&state.collector),
        PASSTHROUGH,
        UNKNOWN_MODEL,
        meta.priority,
        meta.started_at,
    );

    match state.proxy.forward(parts.method, path_and_query, &parts.headers, body).await {
        Ok(upstream) => {
            let status = upstream.status();
            let headers = forwardable_headers(upstream.headers());

            let mut response = Response::new(Body::from_stream(into_byte_stream(upstream)));
            *response.status_mut() = status;
            *response.headers_mut() = headers;

            timer.finish(status.as_u16());
            response
        }
        Err(e) => {
            state.collector.record_error(UNKNOWN_MODEL, e.reason());
            timer.finish(e.status().as_u16());
            e.into_dialect_response(Dialect::Native)
        }
    }
}
