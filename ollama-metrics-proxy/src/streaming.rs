//! Streaming relay from Ollama to the caller.
//!
//! Ollama streams newline-delimited JSON. The relay reframes the byte stream
//! into lines, feeds each parsed line to [`StreamTelemetry`], and hands it to
//! a [`FrameEncoder`] that produces the bytes written to the caller: the
//! unchanged line for native clients, `data:` frames for OpenAI clients.

use std::fmt::Display;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use tracing::{debug, warn};

use crate::convert::{convert_tool_calls_to_openai, finish_reason};
use crate::metrics::Collector;
use crate::types::ollama::{EvalStats, StreamChunk, ToolCall};
use crate::types::openai;

/// Framing overhead added to streamed content when estimating response size.
const STREAM_OVERHEAD_BYTES: usize = 200;

/// Terminal frame of an OpenAI stream.
pub const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Body sender handed to axum through `Body::from_stream`.
pub type BodySender = mpsc::Sender<Result<Bytes, std::io::Error>>;

/// Splits a byte stream into lines regardless of how chunks are cut.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    /// Complete, non-blank lines in `chunk`, without their terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            if let Some(line) = non_blank(&self.buf[start..end]) {
                lines.push(Bytes::copy_from_slice(line));
            }
            start = end + 1;
        }
        self.buf.drain(..start);
        lines
    }

    /// Whatever followed the last newline.
    pub fn finish(&mut self) -> Option<Bytes> {
        let rest = std::mem::take(&mut self.buf);
        non_blank(&rest).map(Bytes::copy_from_slice)
    }
}

fn non_blank(line: &[u8]) -> Option<&[u8]> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    (!line.iter().all(u8::is_ascii_whitespace)).then_some(line)
}

/// Timing and token data gathered while a response passes through.
#[derive(Debug)]
pub struct StreamTelemetry {
    started_at: Instant,
    first_token: Option<Duration>,
    content_bytes: usize,
    stats: Option<EvalStats>,
    saw_tool_calls: bool,
}

impl StreamTelemetry {
    /// `started_at` is when the request arrived at the proxy.
    pub fn new(started_at: Instant) -> Self {
        Self { started_at, first_token: None, content_bytes: 0, stats: None, saw_tool_calls: false }
    }

    pub fn observe(&mut self, chunk: &StreamChunk) {
        let content = chunk.content();
        if !content.is_empty() {
            if self.first_token.is_none() {
                self.first_token = Some(self.started_at.elapsed());
            }
            self.content_bytes += content.len();
        }
        if chunk.tool_calls().is_some() {
            self.saw_tool_calls = true;
        }
        if chunk.done {
            self.stats = Some(chunk.timings.stats());
        }
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token
    }

    pub fn stats(&self) -> Option<&EvalStats> {
        self.stats.as_ref()
    }

    /// True once the terminal chunk has been seen.
    pub fn completed(&self) -> bool {
        self.stats.is_some()
    }

    pub fn content_bytes(&self) -> usize {
        self.content_bytes
    }

    /// Streamed responses are sized from their content, not the wire.
    pub fn approx_response_bytes(&self) -> usize {
        self.content_bytes + STREAM_OVERHEAD_BYTES
    }

    /// Push everything gathered into the collector.
    pub fn report(&self, collector: &Collector, model: &str) {
        if let Some(ttft) = self.first_token {
            collector.record_time_to_first_token(model, ttft);
        }
        if let Some(stats) = &self.stats {
            record_eval_stats(collector, model, stats);
        }
    }
}

/// Token counters, throughput and load time from a terminal chunk.
pub fn record_eval_stats(collector: &Collector, model: &str, stats: &EvalStats) {
    collector.record_tokens(model, u64::from(stats.prompt_tokens), u64::from(stats.completion_tokens));
    collector.record_throughput(model, stats.tokens_per_second());
    if let Some(load) = stats.load_duration {
        collector.record_model_load(model, load);
    }
}

/// Produces the bytes written to the caller for each backend line.
pub trait FrameEncoder: Send {
    /// `chunk` is `None` when the line is not valid JSON.
    fn encode(&mut self, raw: &[u8], chunk: Option<&StreamChunk>) -> Vec<Bytes>;

    /// Called once when the backend stream ends.
    fn finish(&mut self) -> Vec<Bytes>;

    fn content_type(&self) -> &'static str;
}

/// Native clients get every line unchanged.
#[derive(Debug, Default)]
pub struct NativeFrames;

impl FrameEncoder for NativeFrames {
    fn encode(&mut self, raw: &[u8], _chunk: Option<&StreamChunk>) -> Vec<Bytes> {
        let mut line = Vec::with_capacity(raw.len() + 1);
        line.extend_from_slice(raw);
        line.push(b'\n');
        vec![Bytes::from(line)]
    }

    fn finish(&mut self) -> Vec<Bytes> {
        Vec::new()
    }

    fn content_type(&self) -> &'static str {
        "application/x-ndjson"
    }
}

/// Which OpenAI object the SSE frames carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseKind {
    Chat,
    Completion,
}

#[derive(Debug, Default)]
struct PendingDelta {
    content: String,
    tool_calls: Option<Vec<ToolCall>>,
}

/// Translates native lines into OpenAI `data:` frames.
///
/// The latest translated chunk is held until the next line arrives, so the
/// terminal native chunk can set `finish_reason` on the last data frame
/// instead of adding a frame of its own.
///
/// Every delta, the first token included, therefore reaches the client one
/// backend line late. Time to first token is taken when the proxy receives
/// the line, so it does not include that delay.
pub struct SseFrames {
    kind: SseKind,
    id: String,
    model: String,
    created: u64,
    pending: Option<PendingDelta>,
    role_sent: bool,
    saw_tool_calls: bool,
    closed: bool,
}

impl SseFrames {
    pub fn new(kind: SseKind, id: impl Into<String>, model: impl Into<String>, created: u64) -> Self {
        Self {
            kind,
            id: id.into(),
            model: model.into(),
            created,
            pending: None,
            role_sent: false,
            saw_tool_calls: false,
            closed: false,
        }
    }

    fn frame(&mut self, delta: PendingDelta, finish: Option<&str>) -> Bytes {
        let payload = match self.kind {
            SseKind::Chat => {
                let role = (!self.role_sent).then_some(openai::Role::Assistant);
                self.role_sent = true;
                serde_json::to_vec(&openai::ChatCompletionChunk {
                    id: self.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: self.created,
                    model: self.model.clone(),
                    choices: vec![openai::ChunkChoice {
                        index: 0,
                        delta: openai::Delta {
                            role,
                            content: (!delta.content.is_empty()).then_some(delta.content),
                            tool_calls: delta
                                .tool_calls
                                .as_deref()
                                .map(convert_tool_calls_to_openai),
                        },
                        finish_reason: finish.map(str::to_string),
                    }],
                })
            }
            SseKind::Completion => serde_json::to_vec(&openai::CompletionResponse {
                id: self.id.clone(),
                object: "text_completion".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![openai::CompletionChoice {
                    text: delta.content,
                    index: 0,
                    logprobs: None,
                    finish_reason: finish.map(str::to_string),
                }],
                usage: None,
            }),
        };

        match payload {
            Ok(json) => sse_frame(&json),
            Err(e) => {
                warn!(error = %e, "Failed to encode stream chunk");
                Bytes::new()
            }
        }
    }
}

fn sse_frame(json: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(json.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(json);
    frame.extend_from_slice(b"\n\n");
    Bytes::from(frame)
}

impl FrameEncoder for SseFrames {
    fn encode(&mut self, raw: &[u8], chunk: Option<&StreamChunk>) -> Vec<Bytes> {
        if self.closed {
            return Vec::new();
        }
        let Some(chunk) = chunk else {
            debug!(line = %String::from_utf8_lossy(raw), "Skipping unparseable stream line");
            return Vec::new();
        };

        let mut out = Vec::new();

        if let Some(message) = &chunk.error {
            if let Some(prev) = self.pending.take() {
                out.push(self.frame(prev, None));
            }
            let body = serde_json::json!({ "error": { "message": message, "type": "api_error" } });
            out.push(sse_frame(body.to_string().as_bytes()));
            self.closed = true;
            return out;
        }

        let tool_calls = chunk.tool_calls().map(<[ToolCall]>::to_vec);
        if !chunk.content().is_empty() || tool_calls.is_some() {
            self.saw_tool_calls |= tool_calls.is_some();
            if let Some(prev) = self.pending.take() {
                out.push(self.frame(prev, None));
            }
            self.pending = Some(PendingDelta { content: chunk.content().to_string(), tool_calls });
        }

        if chunk.done {
            let reason = if self.saw_tool_calls && self.kind == SseKind::Chat {
                "tool_calls"
            } else {
                finish_reason(chunk.done_reason.as_deref())
            };
            let last = self.pending.take().unwrap_or_default();
            out.push(self.frame(last, Some(reason)));
            out.push(Bytes::from_static(SSE_DONE));
            self.closed = true;
        }

        out.retain(|b| !b.is_empty());
        out
    }

    /// A stream that ends without a terminal chunk is left without the
    /// sentinel so the caller can tell it was truncated.
    fn finish(&mut self) -> Vec<Bytes> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        match self.pending.take() {
            Some(prev) => vec![self.frame(prev, None)],
            None => Vec::new(),
        }
    }

    fn content_type(&self) -> &'static str {
        "text/event-stream"
    }
}

/// How a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    /// Terminal chunk seen and delivered
    Completed,
    /// Backend closed the stream before its terminal chunk
    Truncated,
    /// Backend stream returned an error
    BackendFailed(String),
    /// Caller stopped reading
    ClientGone,
}

/// Pump `upstream` through `encoder` into `sink` until either side ends.
pub async fn relay<S, E>(
    mut upstream: S,
    encoder: &mut dyn FrameEncoder,
    telemetry: &mut StreamTelemetry,
    sink: &mut BodySender,
) -> RelayEnd
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut splitter = LineSplitter::default();

    while let Some(item) = upstream.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = e.to_string();
                let _ = send_all(sink, encoder.finish()).await;
                return RelayEnd::BackendFailed(reason);
            }
        };

        for line in splitter.push(&bytes) {
            if !forward_line(&line, encoder, telemetry, sink).await {
                return RelayEnd::ClientGone;
            }
        }
    }

    if let Some(rest) = splitter.finish() {
        if !forward_line(&rest, encoder, telemetry, sink).await {
            return RelayEnd::ClientGone;
        }
    }

    if !send_all(sink, encoder.finish()).await {
        return RelayEnd::ClientGone;
    }

    if telemetry.completed() {
        RelayEnd::Completed
    } else {
        RelayEnd::Truncated
    }
}

async fn forward_line(
    line: &[u8],
    encoder: &mut dyn FrameEncoder,
    telemetry: &mut StreamTelemetry,
    sink: &mut BodySender,
) -> bool {
    let chunk = serde_json::from_slice::<StreamChunk>(line).ok();
    if let Some(chunk) = &chunk {
        telemetry.observe(chunk);
    }
    send_all(sink, encoder.encode(line, chunk.as_ref())).await
}

async fn send_all(sink: &mut BodySender, frames: Vec<Bytes>) -> bool {
    for frame in frames {
        if sink.send(Ok(frame)).await.is_err() {
            return false;
        }
    }
    true
}
