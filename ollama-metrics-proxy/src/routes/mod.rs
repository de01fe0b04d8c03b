//! HTTP route handlers for the metrics proxy.
//!
//! - `ollama`: native `/api/generate` and `/api/chat`
//! - `openai`: `/v1/chat/completions`, `/v1/completions`, `/v1/models`
//! - `passthrough`: every other backend path
//! - `health`: the metrics listener
//!
//! Generation requests share one pipeline: the handler parses the body into
//! a [`Generation`], [`dispatch`] submits it to the admission queue, and a
//! worker runs [`execute`], which calls Ollama and hands the response head
//! back to the handler as soon as it exists. Streamed bodies keep flowing from
//! the worker after the handler has returned.

pub mod health;
pub mod ollama;
pub mod openai;
pub mod passthrough;

pub use health::{health, live, metrics, ready, stats};
pub use ollama::{chat, generate};
pub use openai::{chat_completions, completions, list_models};
pub use passthrough::passthrough;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures::channel::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::convert::{chat_response_to_compatible, generate_response_to_completion, unix_now};
use crate::error::{Dialect, ProxyError};
use crate::metrics::RequestTimer;
use crate::proxy::into_byte_stream;
use crate::queue::{CallerContext, Priority, QueueError};
use crate::state::AppState;
use crate::streaming::{
    record_eval_stats, relay, FrameEncoder, NativeFrames, RelayEnd, SseFrames, SseKind,
    StreamTelemetry,
};
use crate::types::ollama::{ChatResponse, GenerateResponse, StreamChunk};

/// Model label for requests that do not name one.
pub const UNKNOWN_MODEL: &str = "unknown";

/// Frames buffered between the relay and the client connection.
const STREAM_BUFFER: usize = 32;

/// Per-request data taken from the headers.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub priority: Priority,
    /// `X-User-ID` header
    pub user_header: Option<String>,
    pub started_at: Instant,
}

impl RequestMeta {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            request_id: header("x-request-id").unwrap_or_else(|| Uuid::new_v4().to_string()),
            priority: Priority::from_header(header("x-priority").as_deref()),
            user_header: header("x-user-id"),
            started_at: Instant::now(),
        }
    }

    /// The body's `user` field wins over the header.
    pub fn user(&self, body_user: Option<&str>) -> String {
        body_user
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| self.user_header.clone())
            .unwrap_or_else(|| "anonymous".to_string())
    }
}

/// How the backend response is turned into the caller's response.
#[derive(Debug, Clone)]
pub enum Render {
    /// Bytes pass through unchanged
    Native,
    /// OpenAI chat completion, echoing the requested model
    Chat { id: String, model: String },
    /// OpenAI text completion, echoing the requested model
    Completion { id: String, model: String },
}

impl Render {
    pub fn dialect(&self) -> Dialect {
        match self {
            Render::Native => Dialect::Native,
            Render::Chat { .. } | Render::Completion { .. } => Dialect::Compatible,
        }
    }

    fn encoder(&self) -> Box<dyn FrameEncoder> {
        match self {
            Render::Native => Box::new(NativeFrames),
            Render::Chat { id, model } => {
                Box::new(SseFrames::new(SseKind::Chat, id.as_str(), model.as_str(), unix_now()))
            }
            Render::Completion { id, model } => {
                Box::new(SseFrames::new(SseKind::Completion, id.as_str(), model.as_str(), unix_now()))
            }
        }
    }

    /// Caller-facing body of a buffered backend response.
    fn buffered(&self, body: &Bytes) -> Result<Bytes, ProxyError> {
        let parse_err = |e: serde_json::Error| ProxyError::ParseResponse(e.to_string());
        let encode_err = |e: serde_json::Error| ProxyError::Internal(e.to_string());

        match self {
            Render::Native => Ok(body.clone()),
            Render::Chat { id, model } => {
                let response: ChatResponse = serde_json::from_slice(body).map_err(parse_err)?;
                serde_json::to_vec(&chat_response_to_compatible(&response, id, model))
                    .map(Bytes::from)
                    .map_err(encode_err)
            }
            Render::Completion { id, model } => {
                let response: GenerateResponse = serde_json::from_slice(body).map_err(parse_err)?;
                serde_json::to_vec(&generate_response_to_completion(&response, id, model))
                    .map(Bytes::from)
                    .map_err(encode_err)
            }
        }
    }
}

/// A parsed generation request ready for the queue.
#[derive(Debug)]
pub struct Generation {
    /// Inbound path, used as the endpoint label
    pub endpoint: &'static str,
    /// Ollama path the body is posted to
    pub backend_path: &'static str,
    /// Backend model, used as the model label
    pub model: String,
    pub user: String,
    /// Body sent to Ollama
    pub body: Bytes,
    /// Size of the caller's body
    pub request_bytes: usize,
    pub streaming: bool,
    pub render: Render,
}

/// Reject a request before it reaches the queue.
pub fn reject(
    state: &AppState,
    endpoint: &str,
    model: &str,
    meta: &RequestMeta,
    dialect: Dialect,
    err: ProxyError,
) -> Response {
    debug!(request_id = %meta.request_id, endpoint, reason = err.reason(), error = %err, "Request rejected");
    record_failure(state, endpoint, model, meta, &err);
    err.into_dialect_response(dialect)
}

fn record_failure(state: &AppState, endpoint: &str, model: &str, meta: &RequestMeta, err: &ProxyError) {
    state.collector.record_error(model, err.reason());
    state.collector.record_request(
        endpoint,
        model,
        meta.priority,
        err.status().as_str(),
        meta.started_at.elapsed(),
    );
}

/// First of the two signals a handler waits on.
enum Head {
    Response(Result<Response, oneshot::error::RecvError>),
    Finished(Result<(), ProxyError>),
}

/// Queue `generation` and return the caller's response.
///
/// If the handler is dropped before a response head exists, the caller
/// context is cancelled, which withdraws the unit or aborts its backend call.
///
/// Each request is recorded once: by the work if it started, otherwise here.
pub async fn dispatch(state: Arc<AppState>, meta: RequestMeta, generation: Generation) -> Response {
    let dialect = generation.render.dialect();
    let endpoint = generation.endpoint;
    let model = generation.model.clone();

    let ctx = state.caller_context();
    let cancel_on_drop = ctx.token().clone().drop_guard();
    let (head_tx, mut head_rx) = oneshot::channel();
    let claimed = Arc::new(AtomicBool::new(false));

    let work = {
        let state = Arc::clone(&state);
        let meta = meta.clone();
        let ctx = ctx.clone();
        let claimed = Arc::clone(&claimed);
        move || async move {
            if claimed.swap(true, Ordering::SeqCst) {
                // The handler already answered and recorded this request
                return Err(ProxyError::from(QueueError::Cancelled));
            }
            execute(state, meta, generation, ctx, head_tx).await
        }
    };

    let submit = state.queue.submit(&ctx, &model, meta.priority, work);
    tokio::pin!(submit);

    let first = tokio::select! {
        biased;
        head = &mut head_rx => Head::Response(head),
        done = &mut submit => Head::Finished(done),
    };

    let outcome = match first {
        Head::Response(Ok(response)) => Ok(response),
        // The work ended without producing a head; its result says why
        Head::Response(Err(_)) => match submit.await {
            Ok(()) => Err(ProxyError::Internal("no response produced".into())),
            Err(e) => Err(e),
        },
        Head::Finished(Ok(())) => head_rx
            .try_recv()
            .map_err(|_| ProxyError::Internal("no response produced".into())),
        Head::Finished(Err(e)) => Err(e),
    };

    match outcome {
        Ok(response) => {
            cancel_on_drop.disarm();
            response
        }
        Err(err) => {
            if !claimed.swap(true, Ordering::SeqCst) {
                record_failure(&state, endpoint, &model, &meta, &err);
            }
            debug!(request_id = %meta.request_id, reason = err.reason(), "Request failed");
            err.into_dialect_response(dialect)
        }
    }
}

/// Unit of work run by a queue worker.
async fn execute(
    state: Arc<AppState>,
    meta: RequestMeta,
    generation: Generation,
    ctx: CallerContext,
    head_tx: oneshot::Sender<Response>,
) -> Result<(), ProxyError> {
    let collector = &state.collector;
    let model = generation.model.as_str();
    let timer = RequestTimer::start(
        Arc::clone(collector),
        generation.endpoint,
        model,
        meta.priority,
        meta.started_at,
    );

    let sent = tokio::select! {
        biased;
        cause = ctx.done() => {
            debug!(request_id = %meta.request_id, reason = cause.reason(), "Caller gave up before Ollama answered");
            return Err(fail(&state, timer, model, cause.into()));
        }
        sent = state.proxy.post(generation.backend_path, generation.body.clone()) => sent,
    };
    let response = match sent {
        Ok(response) => response,
        Err(e) => return Err(fail(&state, timer, model, e)),
    };

    if generation.streaming {
        let (mut tx, rx) = mpsc::channel(STREAM_BUFFER);
        let mut encoder = generation.render.encoder();
        if head_tx.send(streaming_response(encoder.content_type(), rx)).is_err() {
            return Err(fail(&state, timer, model, QueueError::Cancelled.into()));
        }

        let mut telemetry = StreamTelemetry::new(meta.started_at);
        let end = relay(into_byte_stream(response), encoder.as_mut(), &mut telemetry, &mut tx).await;
        drop(tx);

        telemetry.report(collector, model);
        collector.record_payload_sizes(
            model,
            generation.endpoint,
            generation.request_bytes,
            telemetry.approx_response_bytes(),
        );
        collector.record_attribution(&meta.request_id, model, &generation.user, generation.endpoint);

        match end {
            RelayEnd::Completed => timer.finish(200),
            RelayEnd::Truncated => {
                warn!(request_id = %meta.request_id, model = %model, "Ollama closed the stream early");
                collector.record_error(model, "stream_truncated");
                timer.finish(200);
            }
            RelayEnd::BackendFailed(reason) => {
                warn!(request_id = %meta.request_id, model = %model, error = %reason, "Ollama stream failed");
                collector.record_error(model, "stream_interrupted");
                timer.finish(200);
            }
            RelayEnd::ClientGone => {
                debug!(request_id = %meta.request_id, "Client stopped reading the stream");
                collector.record_error(model, "client_disconnected");
                // Timer drop records the request as aborted
            }
        }
        return Ok(());
    }

    let body = tokio::select! {
        biased;
        cause = ctx.done() => return Err(fail(&state, timer, model, cause.into())),
        body = response.bytes() => body,
    };
    let body = match body {
        Ok(body) => body,
        Err(e) => return Err(fail(&state, timer, model, e.into())),
    };
    let payload = match generation.render.buffered(&body) {
        Ok(payload) => payload,
        Err(e) => return Err(fail(&state, timer, model, e)),
    };

    if let Ok(chunk) = serde_json::from_slice::<StreamChunk>(&body) {
        record_eval_stats(collector, model, &chunk.timings.stats());
    }
    collector.record_payload_sizes(model, generation.endpoint, generation.request_bytes, payload.len());
    collector.record_attribution(&meta.request_id, model, &generation.user, generation.endpoint);
    timer.finish(200);

    let _ = head_tx.send(json_response(payload));
    Ok(())
}

fn fail(state: &AppState, timer: RequestTimer, model: &str, err: ProxyError) -> ProxyError {
    match err {
        ProxyError::Queue(_) => debug!(model = %model, reason = err.reason(), "Request abandoned"),
        _ => warn!(model = %model, reason = err.reason(), error = %err, "Ollama request failed"),
    }
    state.collector.record_error(model, err.reason());
    timer.finish(err.status().as_u16());
    err
}

fn json_response(body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn streaming_response(
    content_type: &'static str,
    frames: mpsc::Receiver<Result<Bytes, std::io::Error>>,
) -> Response {
    let mut response = Response::new(Body::from_stream(frames));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if content_type == "text/event-stream" {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    }
    response
}
