//! End-to-end tests against a fake Ollama server.
//!
//! The fake backend streams fixed NDJSON answers. Models whose name starts
//! with `slow` wait on a gate so tests can hold workers busy; chat models named
//! `status-<code>` fail with that HTTP status.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ollama_metrics_proxy::queue::QueueConfig;
use ollama_metrics_proxy::{build_router, serve, AppState, Collector, ProxyConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const TOKENS: [&str; 3] = ["Hello", " from", " Ollama"];

struct FakeOllama {
    /// Models in the order requests arrived
    arrivals: Mutex<Vec<String>>,
    /// Last generation body received
    last_body: Mutex<Option<Value>>,
    gate: Semaphore,
}

impl Default for FakeOllama {
    fn default() -> Self {
        Self {
            arrivals: Mutex::default(),
            last_body: Mutex::default(),
            // Closed until a test releases permits
            gate: Semaphore::new(0),
        }
    }
}

impl FakeOllama {
    async fn admit(&self, body: &Value) -> String {
        let model = body["model"].as_str().unwrap_or_default().to_string();
        self.arrivals.lock().push(model.clone());
        *self.last_body.lock() = Some(body.clone());
        if model.starts_with("slow") {
            self.gate.acquire().await.unwrap().forget();
        }
        model
    }

    fn hits(&self) -> usize {
        self.arrivals.lock().len()
    }
}

fn final_stats() -> Value {
    json!({
        "done": true,
        "done_reason": "stop",
        "prompt_eval_count": 8,
        "eval_count": 7,
        "eval_duration": 350_000_000u64,
        "load_duration": 1_000_000u64
    })
}

fn merge(mut base: Value, extra: Value) -> Value {
    if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    base
}

fn ndjson(lines: Vec<Value>) -> Response {
    let body: String = lines.iter().map(|l| format!("{}\n", l)).collect();
    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

async fn fake_chat(State(backend): State<Arc<FakeOllama>>, Json(body): Json<Value>) -> Response {
    let model = backend.admit(&body).await;

    if let Some(code) = model.strip_prefix("status-").and_then(|c| c.parse::<u16>().ok()) {
        let status = StatusCode::from_u16(code).unwrap();
        return (status, Json(json!({"error": "model runner failed"}))).into_response();
    }

    if body["stream"].as_bool().unwrap_or(true) {
        let mut lines: Vec<Value> = TOKENS
            .iter()
            .map(|t| json!({"model": model, "message": {"role": "assistant", "content": t}, "done": false}))
            .collect();
        lines.push(merge(
            json!({"model": model, "message": {"role": "assistant", "content": ""}}),
            final_stats(),
        ));
        ndjson(lines)
    } else {
        Json(merge(
            json!({"model": model, "message": {"role": "assistant", "content": TOKENS.concat()}}),
            final_stats(),
        ))
        .into_response()
    }
}

async fn fake_generate(State(backend): State<Arc<FakeOllama>>, Json(body): Json<Value>) -> Response {
    let model = backend.admit(&body).await;

    if body["stream"].as_bool().unwrap_or(true) {
        let mut lines: Vec<Value> = TOKENS
            .iter()
            .map(|t| json!({"model": model, "response": t, "done": false}))
            .collect();
        lines.push(merge(json!({"model": model, "response": ""}), final_stats()));
        ndjson(lines)
    } else {
        Json(merge(json!({"model": model, "response": TOKENS.concat()}), final_stats()))
            .into_response()
    }
}

async fn fake_tags() -> Json<Value> {
    Json(json!({
        "models": [
            {"name": "llama2:13b", "modified_at": "2024-01-15T10:30:00Z", "size": 7365960935u64,
             "digest": "abc", "details": {"family": "llama"}}
        ]
    }))
}

async fn fake_version() -> Json<Value> {
    Json(json!({"version": "0.5.7"}))
}

async fn spawn_backend() -> (SocketAddr, Arc<FakeOllama>) {
    let backend = Arc::new(FakeOllama::default());
    let app = Router::new()
        .route("/api/chat", post(fake_chat))
        .route("/api/generate", post(fake_generate))
        .route("/api/tags", get(fake_tags))
        .route("/api/version", get(fake_version))
        .with_state(Arc::clone(&backend));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, backend)
}

fn proxy_config(backend: SocketAddr, queue: QueueConfig) -> ProxyConfig {
    ProxyConfig { ollama_url: format!("http://{}", backend), queue, ..Default::default() }
}

fn new_state(config: ProxyConfig) -> Arc<AppState> {
    Arc::new(AppState::new(config, Arc::new(Collector::new().unwrap())).unwrap())
}

async fn spawn_proxy(backend: SocketAddr, queue: QueueConfig) -> (String, Arc<AppState>) {
    let state = new_state(proxy_config(backend, queue));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(Arc::clone(&state));
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{}", addr), state)
}

async fn setup() -> (String, Arc<AppState>, Arc<FakeOllama>) {
    let (backend_addr, backend) = spawn_backend().await;
    let (url, state) = spawn_proxy(backend_addr, QueueConfig::default()).await;
    (url, state, backend)
}

/// Poll `cond` until it holds or two seconds pass.
async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_streaming_chat_completion() {
    let (url, state, backend) = setup().await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", url))
        .header("x-request-id", "req-1")
        .json(&json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true,
            "temperature": 0.0,
            "max_tokens": 64
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["x-request-id"], "req-1");

    let body = response.text().await.unwrap();
    let frames: Vec<&str> = body.split("\n\n").filter(|f| !f.is_empty()).collect();
    assert_eq!(frames.len(), TOKENS.len() + 1);
    assert_eq!(*frames.last().unwrap(), "data: [DONE]");

    let chunks: Vec<Value> = frames[..TOKENS.len()]
        .iter()
        .map(|f| serde_json::from_str(f.strip_prefix("data: ").unwrap()).unwrap())
        .collect();
    assert_eq!(chunks[0]["id"], "chatcmpl-req-1");
    assert_eq!(chunks[0]["model"], "gpt-3.5-turbo");
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
    let text: String =
        chunks.iter().filter_map(|c| c["choices"][0]["delta"]["content"].as_str()).collect();
    assert_eq!(text, TOKENS.concat());

    // Translated request: alias resolved, zero temperature omitted
    let sent = backend.last_body.lock().clone().unwrap();
    assert_eq!(sent["model"], "llama2:13b");
    assert_eq!(sent["options"]["num_predict"], 64);
    assert!(sent["options"].get("temperature").is_none());

    let collector = Arc::clone(&state.collector);
    eventually(|| collector.generated_tokens_total.with_label_values(&["llama2:13b"]).get() == 7.0)
        .await;
    assert_eq!(collector.prompt_tokens_total.with_label_values(&["llama2:13b"]).get(), 8.0);
    assert_eq!(
        collector
            .time_to_first_token_seconds
            .with_label_values(&["llama2:13b"])
            .get_sample_count(),
        1
    );
}

#[tokio::test]
async fn test_buffered_chat_completion() {
    let (url, _state, _backend) = setup().await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", url))
        .json(&json!({"model": "mistral:7b", "messages": [{"role": "user", "content": "Hi"}]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "mistral:7b");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["choices"][0]["message"]["content"], TOKENS.concat());
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 8);
    assert_eq!(body["usage"]["completion_tokens"], 7);
    assert_eq!(body["usage"]["total_tokens"], 15);
}

#[tokio::test]
async fn test_text_completion() {
    let (url, _state, backend) = setup().await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/v1/completions", url))
        .json(&json!({"model": "text-davinci-003", "prompt": ["Once upon", "ignored"], "stream": false}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["choices"][0]["text"], TOKENS.concat());
    let sent = backend.last_body.lock().clone().unwrap();
    assert_eq!(sent["model"], "llama2:7b");
    assert_eq!(sent["prompt"], "Once upon");
}

#[tokio::test]
async fn test_native_stream_passes_through() {
    let (url, state, _backend) = setup().await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/generate", url))
        .header("x-user-id", "alice")
        .json(&json!({"model": "llama2:7b", "prompt": "Hi"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/x-ndjson");
    let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();

    let body = response.text().await.unwrap();
    let lines: Vec<Value> = body.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines.len(), TOKENS.len() + 1);
    assert_eq!(lines[0]["response"], "Hello");
    assert_eq!(lines[3]["done"], true);
    assert_eq!(lines[3]["eval_count"], 7);

    let collector = Arc::clone(&state.collector);
    eventually(|| {
        collector.user_requests_total.with_label_values(&["alice", "llama2:7b", "/api/generate"]).get()
            == 1.0
    })
    .await;
    assert_eq!(
        collector.request_by_id_total.with_label_values(&[&request_id, "llama2:7b", "alice"]).get(),
        1.0
    );
}

#[tokio::test]
async fn test_malformed_body_never_reaches_backend() {
    let (url, state, backend) = setup().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/chat/completions", url))
        .header(header::CONTENT_TYPE.as_str(), "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "parse_request");

    let response = client
        .post(format!("{}/api/chat", url))
        .body(r#"{"messages": []}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    assert_eq!(backend.hits(), 0);
    assert_eq!(state.collector.errors_total.with_label_values(&["unknown", "parse_request"]).get(), 2.0);
}

#[tokio::test]
async fn test_models_and_passthrough() {
    let (url, _state, _backend) = setup().await;
    let client = reqwest::Client::new();

    let models: Value = client.get(format!("{}/v1/models", url)).send().await.unwrap().json().await.unwrap();
    assert_eq!(models["object"], "list");
    assert_eq!(models["data"][0]["id"], "llama2:13b");
    assert_eq!(models["data"][0]["owned_by"], "llama");

    let response = client.get(format!("{}/api/version", url)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));
    let version: Value = response.json().await.unwrap();
    assert_eq!(version["version"], "0.5.7");

    let response = client.get(format!("{}/api/missing", url)).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_queue_full_is_503() {
    let (backend_addr, backend) = spawn_backend().await;
    let queue = QueueConfig { capacity: 1, workers: 1, ..Default::default() };
    let (url, state) = spawn_proxy(backend_addr, queue).await;
    let client = reqwest::Client::new();

    let send = |model: &'static str| {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            client
                .post(format!("{}/api/generate", url))
                .json(&json!({"model": model, "prompt": "Hi", "stream": false}))
                .send()
                .await
                .unwrap()
                .status()
        })
    };

    // One running, one resident
    let running = send("slow-a");
    eventually(|| backend.hits() == 1).await;
    let waiting = send("slow-b");
    eventually(|| state.queue.stats().current_size == 1).await;

    let response = client
        .post(format!("{}/v1/chat/completions", url))
        .json(&json!({"model": "slow-c", "messages": [{"role": "user", "content": "Hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "queue_full");

    backend.gate.add_permits(2);
    assert_eq!(running.await.unwrap(), 200);
    assert_eq!(waiting.await.unwrap(), 200);
    assert_eq!(state.queue.stats().total_rejected, 1);
    assert_eq!(state.collector.queue_rejected_total.get(), 1);
}

#[tokio::test]
async fn test_high_priority_jumps_the_queue() {
    let (backend_addr, backend) = spawn_backend().await;
    let queue = QueueConfig { capacity: 10, workers: 1, ..Default::default() };
    let (url, state) = spawn_proxy(backend_addr, queue).await;
    let client = reqwest::Client::new();

    let send = |model: &'static str, priority: &'static str| {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            client
                .post(format!("{}/api/chat", url))
                .header("x-priority", priority)
                .json(&json!({"model": model, "messages": [], "stream": false}))
                .send()
                .await
                .unwrap()
                .status()
        })
    };

    let first = send("slow-first", "normal");
    eventually(|| backend.hits() == 1).await;
    let normal = send("slow-normal", "normal");
    eventually(|| state.queue.stats().current_size == 1).await;
    let high = send("slow-high", "high");
    eventually(|| state.queue.stats().current_size == 2).await;

    backend.gate.add_permits(3);
    for handle in [first, normal, high] {
        assert_eq!(handle.await.unwrap(), 200);
    }

    assert_eq!(*backend.arrivals.lock(), vec!["slow-first", "slow-high", "slow-normal"]);
}

#[tokio::test]
async fn test_backend_error_status_is_mapped() {
    let (url, state, _backend) = setup().await;
    let client = reqwest::Client::new();

    let chat = |model: &'static str| {
        client
            .post(format!("{}/v1/chat/completions", url))
            .json(&json!({"model": model, "messages": [{"role": "user", "content": "Hi"}]}))
            .send()
    };

    let response = chat("status-500").await.unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "backend_status");
    assert_eq!(body["error"]["type"], "api_error");

    let response = chat("status-503").await.unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "backend_status");

    // Native dialect carries a plain error string
    let response = client
        .post(format!("{}/api/chat", url))
        .json(&json!({"model": "status-500", "messages": [], "stream": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    let errors = &state.collector.errors_total;
    assert_eq!(errors.with_label_values(&["status-500", "backend_status"]).get(), 2.0);
    assert_eq!(errors.with_label_values(&["status-503", "backend_status"]).get(), 1.0);
    assert_eq!(
        state.collector.requests_total.with_label_values(&["/v1/chat/completions", "status-500", "502"]).get(),
        1.0
    );
}

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    // Bind and release a port so nothing listens on it
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let (url, state) = spawn_proxy(closed, QueueConfig::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", url))
        .json(&json!({"model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "Hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "backend_unreachable");

    assert_eq!(
        state.collector.errors_total.with_label_values(&["llama2:13b", "backend_unreachable"]).get(),
        1.0
    );
}

#[tokio::test]
async fn test_client_disconnect_withdraws_queued_request() {
    let (backend_addr, backend) = spawn_backend().await;
    let queue = QueueConfig { capacity: 10, workers: 1, ..Default::default() };
    let (url, state) = spawn_proxy(backend_addr, queue).await;

    let running = {
        let url = url.clone();
        tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("{}/api/generate", url))
                .json(&json!({"model": "slow-running", "prompt": "Hi", "stream": false}))
                .send()
                .await
                .unwrap()
                .status()
        })
    };
    eventually(|| backend.hits() == 1).await;

    // Gives up while still resident
    let impatient = reqwest::Client::builder().timeout(Duration::from_millis(300)).build().unwrap();
    let result = impatient
        .post(format!("{}/api/generate", url))
        .json(&json!({"model": "slow-abandoned", "prompt": "Hi", "stream": false}))
        .send()
        .await;
    assert!(result.unwrap_err().is_timeout());

    eventually(|| state.queue.stats().current_size == 0).await;

    backend.gate.add_permits(1);
    assert_eq!(running.await.unwrap(), 200);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*backend.arrivals.lock(), vec!["slow-running"]);
}

#[tokio::test]
async fn test_deadline_during_work_is_counted_once() {
    let (backend_addr, _backend) = spawn_backend().await;
    let queue = QueueConfig { request_timeout: Some(Duration::from_millis(200)), ..Default::default() };
    let (url, state) = spawn_proxy(backend_addr, queue).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/generate", url))
        .json(&json!({"model": "slow-deadline", "prompt": "Hi", "stream": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);

    let collector = Arc::clone(&state.collector);
    let count = move |status: &str| {
        collector.requests_total.with_label_values(&["/api/generate", "slow-deadline", status]).get()
    };
    eventually(|| count("504") == 1.0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count("504"), 1.0);
    assert_eq!(count("aborted"), 0.0);
    assert_eq!(
        state.collector.errors_total.with_label_values(&["slow-deadline", "deadline_exceeded"]).get(),
        1.0
    );
}

#[tokio::test]
async fn test_serve_bounds_shutdown_drain() {
    let (backend_addr, backend) = spawn_backend().await;
    let queue = QueueConfig { shutdown_timeout: Duration::from_millis(200), ..Default::default() };
    let state = new_state(proxy_config(backend_addr, queue));

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let metrics_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", proxy_listener.local_addr().unwrap());
    let token = CancellationToken::new();
    let server = tokio::spawn(serve(Arc::clone(&state), proxy_listener, metrics_listener, token.clone()));

    // Held by the backend gate, never released
    let in_flight = tokio::spawn(
        reqwest::Client::new()
            .post(format!("{}/api/generate", url))
            .json(&json!({"model": "slow-shutdown", "prompt": "Hi", "stream": false}))
            .send(),
    );
    eventually(|| backend.hits() == 1).await;

    let started = tokio::time::Instant::now();
    token.cancel();
    server.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

    in_flight.abort();
}
