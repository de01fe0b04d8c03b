//! Ollama metrics proxy library
//!
//! A proxy in front of a single Ollama server that adds:
//! - a bounded, priority-aware admission queue with a fixed worker pool
//! - OpenAI-compatible endpoints translated to the native API
//! - Prometheus telemetry extracted from streamed responses
//!
//! The proxy listener serves the API; a second listener serves `/metrics`,
//! `/health`, `/ready`, `/live` and `/stats`.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderName,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

pub mod convert;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod routes;
pub mod state;
pub mod streaming;
pub mod types;

pub use metrics::Collector;
pub use state::{AppState, ConfigError, ProxyConfig};

/// Largest request body accepted on any route.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Header carrying the request id on requests and responses.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Router for the proxy listener.
pub fn build_router(state: Arc<AppState>) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        // Ollama-native endpoints
        .route("/api/generate", post(routes::generate).fallback(routes::passthrough))
        .route("/api/chat", post(routes::chat).fallback(routes::passthrough))
        // OpenAI-compatible endpoints
        .route(
            "/v1/chat/completions",
            post(routes::chat_completions).fallback(routes::passthrough),
        )
        .route("/v1/completions", post(routes::completions).fallback(routes::passthrough))
        .route("/v1/models", get(routes::list_models).fallback(routes::passthrough))
        // Everything else goes to Ollama untouched
        .fallback(routes::passthrough)
        // Middleware
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .with_state(state)
}

/// Router for the metrics listener.
pub fn build_metrics_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(routes::metrics))
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/live", get(routes::live))
        .route("/stats", get(routes::stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve both listeners until `shutdown` fires, then drain.
///
/// Open connections and the admission queue drain concurrently, each bounded
/// by the queue's `shutdown_timeout`. Connections still open after that are
/// dropped.
pub async fn serve(
    state: Arc<AppState>,
    proxy_listener: TcpListener,
    metrics_listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let proxy_app = build_router(Arc::clone(&state));
    let metrics_app = build_metrics_router(Arc::clone(&state));

    let proxy_stop = shutdown.clone();
    let metrics_stop = shutdown.clone();
    let proxy_server = async move {
        axum::serve(proxy_listener, proxy_app)
            .with_graceful_shutdown(async move { proxy_stop.cancelled().await })
            .await
    };
    let metrics_server = async move {
        axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move { metrics_stop.cancelled().await })
            .await
    };
    let servers = async move { tokio::join!(proxy_server, metrics_server) };
    tokio::pin!(servers);

    let stopped_early = tokio::select! {
        results = &mut servers => Some(results),
        _ = shutdown.cancelled() => None,
    };

    let drain = state.config.queue.shutdown_timeout;
    info!(timeout_secs = drain.as_secs_f64(), "Draining connections and admission queue");

    let (results, queue) = match stopped_early {
        Some(results) => (Some(results), state.queue.shutdown(drain).await),
        None => {
            let (results, queue) =
                tokio::join!(tokio::time::timeout(drain, &mut servers), state.queue.shutdown(drain));
            (results.ok(), queue)
        }
    };

    if let Err(e) = queue {
        error!(error = %e, "Queue did not drain in time");
    }
    match results {
        Some((proxy_result, metrics_result)) => {
            proxy_result?;
            metrics_result?;
        }
        None => warn!(timeout = ?drain, "Closing connections still open after drain timeout"),
    }
    Ok(())
}

/// Run the metrics proxy.
///
/// Binds both listeners, checks Ollama once, and blocks until `shutdown`
/// resolves.
///
/// # Example
/// ```no_run
/// use ollama_metrics_proxy::{run_server, ProxyConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ProxyConfig::from_env();
///     config.validate()?;
///     run_server(config, async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await
/// }
/// ```
pub async fn run_server(
    config: ProxyConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(
        port = config.port,
        metrics_port = config.metrics_port,
        ollama_url = %config.ollama_url,
        "Starting Ollama metrics proxy v{}",
        env!("CARGO_PKG_VERSION")
    );

    let collector = Arc::new(Collector::new()?);
    let state = Arc::new(AppState::new(config.clone(), collector)?);

    // Check Ollama connectivity
    match state.proxy.health_check().await {
        Ok(()) => {
            state.collector.set_backend_healthy(true);
            info!("Connected to Ollama at {}", config.ollama_url);
        }
        Err(e) => {
            state.collector.set_backend_healthy(false);
            warn!(
                "Could not connect to Ollama at {}: {}. \
                 Proxy will start anyway and retry on requests.",
                config.ollama_url, e
            );
        }
    }

    let proxy_listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let metrics_listener = TcpListener::bind(("0.0.0.0", config.metrics_port)).await?;

    log_summary(&config, &state);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown.await;
        info!("Shutdown signal received");
        trigger.cancel();
    });

    serve(state, proxy_listener, metrics_listener, token).await
}

fn log_summary(config: &ProxyConfig, state: &AppState) {
    let queue = &config.queue;
    info!("Proxy listening on http://0.0.0.0:{}", config.port);
    info!("Metrics listening on http://0.0.0.0:{}/metrics", config.metrics_port);
    info!(
        capacity = queue.capacity,
        workers = queue.workers,
        timeout = ?queue.request_timeout,
        "Admission queue configured"
    );
    info!(aliases = state.aliases.len(), "Model aliases loaded");
    info!("OpenAI API: POST /v1/chat/completions, POST /v1/completions, GET /v1/models");
    info!("Ollama API: POST /api/generate, POST /api/chat (other paths pass through)");
    info!("Send `X-Priority: high` to jump the queue");
}
