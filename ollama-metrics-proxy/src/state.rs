//! Application state and configuration for the metrics proxy.

use std::sync::Arc;
use std::time::Duration;

use crate::convert::ModelAliases;
use crate::error::ProxyError;
use crate::metrics::Collector;
use crate::proxy::OllamaProxy;
use crate::queue::{AdmissionQueue, CallerContext, QueueConfig};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application state shared across all handlers
pub struct AppState {
    /// Ollama backend client
    pub proxy: OllamaProxy,

    /// Admission-control queue in front of generation endpoints
    pub queue: Arc<AdmissionQueue>,

    /// Metrics recording surface
    pub collector: Arc<Collector>,

    /// OpenAI model name aliases
    pub aliases: ModelAliases,

    /// Configuration
    pub config: ProxyConfig,
}

impl AppState {
    /// Build the backend client and start the queue workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ProxyConfig, collector: Arc<Collector>) -> Result<Self, ProxyError> {
        let proxy =
            OllamaProxy::new(&config.ollama_url, config.generation_timeout, config.list_timeout)?;
        let queue = AdmissionQueue::start(config.queue.clone(), Arc::clone(&collector));
        let aliases = match &config.model_aliases {
            Some(entries) => ModelAliases::with_overrides(entries),
            None => ModelAliases::default(),
        };

        Ok(Self { proxy, queue, collector, aliases, config })
    }

    /// Fresh caller context carrying the configured queue deadline.
    pub fn caller_context(&self) -> CallerContext {
        CallerContext::with_timeout(self.config.queue.request_timeout)
    }
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port of the proxy listener
    pub port: u16,

    /// Port of the metrics and health listener
    pub metrics_port: u16,

    /// Ollama backend URL
    pub ollama_url: String,

    /// Timeout for generation calls
    pub generation_timeout: Duration,

    /// Timeout for list and health calls
    pub list_timeout: Duration,

    /// `name=alias,...` entries merged over the built-in table
    pub model_aliases: Option<String>,

    /// Admission queue settings
    pub queue: QueueConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 11435,
            metrics_port: 8001,
            ollama_url: "http://localhost:11434".to_string(),
            generation_timeout: Duration::from_secs(300),
            list_timeout: Duration::from_secs(10),
            model_aliases: None,
            queue: QueueConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse("PROXY_PORT") {
            config.port = port;
        }
        if let Some(port) = env_parse("METRICS_PORT") {
            config.metrics_port = port;
        }
        if let Some(url) = ollama_url_from_env() {
            config.ollama_url = url;
        }
        if let Some(secs) = env_parse("GENERATION_TIMEOUT_SECS") {
            config.generation_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("LIST_TIMEOUT_SECS") {
            config.list_timeout = Duration::from_secs(secs);
        }
        config.model_aliases = std::env::var("MODEL_ALIASES").ok().filter(|s| !s.trim().is_empty());
        config.queue = QueueConfig::from_env();

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == self.metrics_port {
            return Err(ConfigError::Invalid(format!(
                "PROXY_PORT and METRICS_PORT must differ (both {})",
                self.port
            )));
        }
        if !(self.ollama_url.starts_with("http://") || self.ollama_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "Ollama URL must start with http:// or https://, got {}",
                self.ollama_url
            )));
        }
        if self.generation_timeout.is_zero() || self.list_timeout.is_zero() {
            return Err(ConfigError::Invalid("backend timeouts must be non-zero".into()));
        }
        self.queue.validate()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// `OLLAMA_URL` wins; otherwise `OLLAMA_HOST` with an optional `OLLAMA_PORT`.
fn ollama_url_from_env() -> Option<String> {
    if let Ok(url) = std::env::var("OLLAMA_URL") {
        return Some(url);
    }
    let host = std::env::var("OLLAMA_HOST").ok()?;
    Some(compose_ollama_url(&host, std::env::var("OLLAMA_PORT").ok().as_deref()))
}

fn compose_ollama_url(host: &str, port: Option<&str>) -> String {
    let base = if host.contains("://") { host.to_string() } else { format!("http://{}", host) };
    match port {
        Some(port) if !has_port(&base) => format!("{}:{}", base.trim_end_matches('/'), port),
        _ => base,
    }
}

fn has_port(url: &str) -> bool {
    let authority = url.split("://").nth(1).unwrap_or(url);
    authority.split('/').next().is_some_and(|a| a.contains(':'))
}
