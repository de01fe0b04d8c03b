//! Ollama metrics proxy
//!
//! Sits between your applications and Ollama, providing:
//! - Admission control with `X-Priority: high` queue jumping
//! - OpenAI API compatibility
//! - Prometheus metrics (tokens/sec, time to first token, queue depth)
//!
//! ## Quick Start
//!
//! ```bash
//! # Start with defaults (proxy on 11435, metrics on 8001, Ollama at localhost:11434)
//! ollama-metrics-proxy
//!
//! # Custom configuration
//! OLLAMA_HOST=192.168.1.100 OLLAMA_PORT=11434 MAX_CONCURRENCY=2 ollama-metrics-proxy
//! ```
//!
//! ## Usage with OpenAI clients
//!
//! ```python
//! from openai import OpenAI
//!
//! client = OpenAI(base_url="http://localhost:11435/v1", api_key="not-needed")
//! response = client.chat.completions.create(
//!     model="gpt-3.5-turbo",  # resolved to a local model
//!     messages=[{"role": "user", "content": "Hello!"}]
//! )
//! ```

use ollama_metrics_proxy::{run_server, ProxyConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ollama_metrics_proxy=info,tower_http=info"));

    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    // Load configuration
    let config = ProxyConfig::from_env();
    config.validate()?;

    run_server(config, shutdown_signal()).await?;

    info!("Proxy stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
