//! Prometheus collector for the proxy
//!
//! One `Collector` is built at startup and handed to every component that
//! records. It owns its registry, so tests can build as many as they like.
//! Recording methods never fail: a label mismatch is logged and dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::core::{MetricVec, MetricVecBuilder};
use prometheus::{
    exponential_buckets, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec,
    IntCounter, Opts, Registry, TextEncoder,
};
use tracing::debug;

use crate::queue::Priority;

/// Prefix of every metric name.
pub const NAMESPACE: &str = "ollama_proxy";

/// Look up a labelled child without panicking on a cardinality mismatch.
fn child<T: MetricVecBuilder>(vec: &MetricVec<T>, labels: &[&str]) -> Option<T::M> {
    match vec.get_metric_with_label_values(labels) {
        Ok(m) => Some(m),
        Err(e) => {
            debug!(error = %e, ?labels, "Dropping metric sample");
            None
        }
    }
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<CounterVec> {
    CounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
}

fn histogram_vec(
    name: &str,
    help: &str,
    buckets: Vec<f64>,
    labels: &[&str],
) -> prometheus::Result<HistogramVec> {
    HistogramVec::new(HistogramOpts::new(name, help).namespace(NAMESPACE).buckets(buckets), labels)
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> prometheus::Result<Histogram> {
    Histogram::with_opts(HistogramOpts::new(name, help).namespace(NAMESPACE).buckets(buckets))
}

fn gauge(name: &str, help: &str) -> prometheus::Result<Gauge> {
    Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

/// Registry plus every metric handle the proxy records into.
pub struct Collector {
    registry: Registry,

    // ============== Request Metrics ==============
    pub requests_total: CounterVec,
    pub request_duration_seconds: HistogramVec,
    pub active_requests: GaugeVec,
    pub errors_total: CounterVec,

    // ============== Token Metrics ==============
    pub prompt_tokens_total: CounterVec,
    pub generated_tokens_total: CounterVec,
    pub tokens_per_second: HistogramVec,
    pub time_to_first_token_seconds: HistogramVec,
    pub model_load_duration_seconds: HistogramVec,
    pub context_length: HistogramVec,

    // ============== Payload / Attribution ==============
    pub request_size_bytes: HistogramVec,
    pub response_size_bytes: HistogramVec,
    pub user_requests_total: CounterVec,
    pub request_by_id_total: CounterVec,

    // ============== Queue Metrics ==============
    pub queue_size: Gauge,
    pub queue_peak_size: Gauge,
    pub queue_high_priority_count: Gauge,
    pub queue_normal_priority_count: Gauge,
    pub queue_processing_rate: Gauge,
    pub queue_rejected_total: IntCounter,
    pub queue_wait_time_seconds: HistogramVec,
    pub queue_high_priority_wait_time_seconds: Histogram,
    pub queue_normal_priority_wait_time_seconds: Histogram,

    // ============== Backend / Platform ==============
    pub backend_healthy: Gauge,
    pub system_gauge: GaugeVec,
}

impl Collector {
    /// Create the collector and register every metric with its own registry.
    pub fn new() -> prometheus::Result<Self> {
        let wait_buckets = vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

        let collector = Self {
            registry: Registry::new(),

            requests_total: counter_vec(
                "requests_total",
                "Total number of requests",
                &["endpoint", "model", "status"],
            )?,
            request_duration_seconds: histogram_vec(
                "request_duration_seconds",
                "Request duration in seconds, queue wait included",
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
                &["endpoint", "model", "priority"],
            )?,
            active_requests: GaugeVec::new(
                Opts::new("active_requests", "Requests currently executing against Ollama")
                    .namespace(NAMESPACE),
                &["model"],
            )?,
            errors_total: counter_vec(
                "errors_total",
                "Total errors by reason",
                &["model", "error_type"],
            )?,

            prompt_tokens_total: counter_vec(
                "prompt_tokens_total",
                "Total prompt tokens evaluated",
                &["model"],
            )?,
            generated_tokens_total: counter_vec(
                "generated_tokens_total",
                "Total tokens generated",
                &["model"],
            )?,
            tokens_per_second: histogram_vec(
                "tokens_per_second",
                "Generation throughput per request",
                vec![10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0],
                &["model"],
            )?,
            time_to_first_token_seconds: histogram_vec(
                "time_to_first_token_seconds",
                "Latency until the first generated content",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0],
                &["model"],
            )?,
            model_load_duration_seconds: histogram_vec(
                "model_load_duration_seconds",
                "Time Ollama spent loading the model",
                vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0],
                &["model"],
            )?,
            context_length: histogram_vec(
                "context_length",
                "Prompt plus generated tokens per request",
                exponential_buckets(128.0, 2.0, 10)?,
                &["model"],
            )?,

            request_size_bytes: histogram_vec(
                "request_size_bytes",
                "Inbound request body size",
                exponential_buckets(100.0, 4.0, 8)?,
                &["model", "endpoint"],
            )?,
            response_size_bytes: histogram_vec(
                "response_size_bytes",
                "Response body size (approximate for streams)",
                exponential_buckets(100.0, 4.0, 8)?,
                &["model", "endpoint"],
            )?,
            user_requests_total: counter_vec(
                "user_requests_total",
                "Requests per user",
                &["user", "model", "endpoint"],
            )?,
            request_by_id_total: counter_vec(
                "request_by_id_total",
                "Requests by request id",
                &["request_id", "model", "user"],
            )?,

            queue_size: gauge("queue_size", "Requests waiting in the admission queue")?,
            queue_peak_size: gauge("queue_peak_size", "Highest queue depth observed")?,
            queue_high_priority_count: gauge(
                "queue_high_priority_count",
                "High priority requests waiting",
            )?,
            queue_normal_priority_count: gauge(
                "queue_normal_priority_count",
                "Normal priority requests waiting",
            )?,
            queue_processing_rate: gauge(
                "queue_processing_rate",
                "Requests completed per second",
            )?,
            queue_rejected_total: IntCounter::with_opts(
                Opts::new("queue_rejected_total", "Requests rejected because the queue was full")
                    .namespace(NAMESPACE),
            )?,
            queue_wait_time_seconds: histogram_vec(
                "queue_wait_time_seconds",
                "Time spent waiting in the queue",
                wait_buckets.clone(),
                &["model"],
            )?,
            queue_high_priority_wait_time_seconds: histogram(
                "queue_high_priority_wait_time_seconds",
                "Queue wait of high priority requests",
                wait_buckets.clone(),
            )?,
            queue_normal_priority_wait_time_seconds: histogram(
                "queue_normal_priority_wait_time_seconds",
                "Queue wait of normal priority requests",
                wait_buckets,
            )?,

            backend_healthy: gauge(
                "backend_healthy",
                "Backend health status (1=healthy, 0=unhealthy)",
            )?,
            system_gauge: GaugeVec::new(
                Opts::new("system_gauge", "Platform values pushed by external scrapers")
                    .namespace(NAMESPACE),
                &["name"],
            )?,
        };

        collector.register_all()?;
        Ok(collector)
    }

    fn register_all(&self) -> prometheus::Result<()> {
        let r = &self.registry;

        // Request metrics
        r.register(Box::new(self.requests_total.clone()))?;
        r.register(Box::new(self.request_duration_seconds.clone()))?;
        r.register(Box::new(self.active_requests.clone()))?;
        r.register(Box::new(self.errors_total.clone()))?;

        // Token metrics
        r.register(Box::new(self.prompt_tokens_total.clone()))?;
        r.register(Box::new(self.generated_tokens_total.clone()))?;
        r.register(Box::new(self.tokens_per_second.clone()))?;
        r.register(Box::new(self.time_to_first_token_seconds.clone()))?;
        r.register(Box::new(self.model_load_duration_seconds.clone()))?;
        r.register(Box::new(self.context_length.clone()))?;

        // Payload and attribution
        r.register(Box::new(self.request_size_bytes.clone()))?;
        r.register(Box::new(self.response_size_bytes.clone()))?;
        r.register(Box::new(self.user_requests_total.clone()))?;
        r.register(Box::new(self.request_by_id_total.clone()))?;

        // Queue metrics
        r.register(Box::new(self.queue_size.clone()))?;
        r.register(Box::new(self.queue_peak_size.clone()))?;
        r.register(Box::new(self.queue_high_priority_count.clone()))?;
        r.register(Box::new(self.queue_normal_priority_count.clone()))?;
        r.register(Box::new(self.queue_processing_rate.clone()))?;
        r.register(Box::new(self.queue_rejected_total.clone()))?;
        r.register(Box::new(self.queue_wait_time_seconds.clone()))?;
        r.register(Box::new(self.queue_high_priority_wait_time_seconds.clone()))?;
        r.register(Box::new(self.queue_normal_priority_wait_time_seconds.clone()))?;

        // Backend and platform
        r.register(Box::new(self.backend_healthy.clone()))?;
        r.register(Box::new(self.system_gauge.clone()))?;

        Ok(())
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
    }

    /// Record a finished request.
    pub fn record_request(
        &self,
        endpoint: &str,
        model: &str,
        priority: Priority,
        status: &str,
        duration: Duration,
    ) {
        if let Some(c) = child(&self.requests_total, &[endpoint, model, status]) {
            c.inc();
        }
        if let Some(h) =
            child(&self.request_duration_seconds, &[endpoint, model, priority.as_str()])
        {
            h.observe(duration.as_secs_f64());
        }
    }

    pub fn record_error(&self, model: &str, reason: &str) {
        if let Some(c) = child(&self.errors_total, &[model, reason]) {
            c.inc();
        }
    }

    /// Record the authoritative counts from a final backend chunk.
    pub fn record_tokens(&self, model: &str, prompt_tokens: u64, generated_tokens: u64) {
        if let Some(c) = child(&self.prompt_tokens_total, &[model]) {
            c.inc_by(prompt_tokens as f64);
        }
        if let Some(c) = child(&self.generated_tokens_total, &[model]) {
            c.inc_by(generated_tokens as f64);
        }
        if let Some(h) = child(&self.context_length, &[model]) {
            h.observe((prompt_tokens + generated_tokens) as f64);
        }
    }

    pub fn record_throughput(&self, model: &str, tokens_per_second: f64) {
        if !tokens_per_second.is_finite() {
            return;
        }
        if let Some(h) = child(&self.tokens_per_second, &[model]) {
            h.observe(tokens_per_second);
        }
    }

    pub fn record_time_to_first_token(&self, model: &str, ttft: Duration) {
        if let Some(h) = child(&self.time_to_first_token_seconds, &[model]) {
            h.observe(ttft.as_secs_f64());
        }
    }

    pub fn record_model_load(&self, model: &str, load: Duration) {
        if let Some(h) = child(&self.model_load_duration_seconds, &[model]) {
            h.observe(load.as_secs_f64());
        }
    }

    pub fn record_payload_sizes(
        &self,
        model: &str,
        endpoint: &str,
        request_bytes: usize,
        response_bytes: usize,
    ) {
        if let Some(h) = child(&self.request_size_bytes, &[model, endpoint]) {
            h.observe(request_bytes as f64);
        }
        if let Some(h) = child(&self.response_size_bytes, &[model, endpoint]) {
            h.observe(response_bytes as f64);
        }
    }

    /// Per-user and per-request attribution counters.
    pub fn record_attribution(&self, request_id: &str, model: &str, user: &str, endpoint: &str) {
        if let Some(c) = child(&self.user_requests_total, &[user, model, endpoint]) {
            c.inc();
        }
        if let Some(c) = child(&self.request_by_id_total, &[request_id, model, user]) {
            c.inc();
        }
    }

    pub fn record_rejection(&self) {
        self.queue_rejected_total.inc();
    }

    pub fn record_queue_wait(&self, model: &str, priority: Priority, wait: Duration) {
        let secs = wait.as_secs_f64();
        if let Some(h) = child(&self.queue_wait_time_seconds, &[model]) {
            h.observe(secs);
        }
        match priority {
            Priority::High => self.queue_high_priority_wait_time_seconds.observe(secs),
            Priority::Normal => self.queue_normal_priority_wait_time_seconds.observe(secs),
        }
    }

    pub fn set_queue_depth(&self, current: usize, peak: usize, high: usize, normal: usize) {
        self.queue_size.set(current as f64);
        self.queue_peak_size.set(peak as f64);
        self.queue_high_priority_count.set(high as f64);
        self.queue_normal_priority_count.set(normal as f64);
    }

    pub fn set_processing_rate(&self, rate: f64) {
        if rate.is_finite() {
            self.queue_processing_rate.set(rate);
        }
    }

    /// Set backend health status.
    pub fn set_backend_healthy(&self, healthy: bool) {
        self.backend_healthy.set(if healthy { 1.0 } else { 0.0 });
    }

    /// Entry point for external platform scrapers (GPU, power, memory).
    pub fn record_system_gauge(&self, name: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        if let Some(g) = child(&self.system_gauge, &[name]) {
            g.set(value);
        }
    }
}

/// Tracks one request while it executes against the backend.
///
/// Holds the per-model active gauge up while alive. A timer dropped without
/// `finish` is counted with status `aborted`.
pub struct RequestTimer {
    collector: Arc<Collector>,
    endpoint: &'static str,
    model: String,
    priority: Priority,
    started_at: Instant,
    finished: bool,
}

impl RequestTimer {
    /// `started_at` is when the request arrived, so queue wait is included.
    pub fn start(
        collector: Arc<Collector>,
        endpoint: &'static str,
        model: &str,
        priority: Priority,
        started_at: Instant,
    ) -> Self {
        if let Some(g) = child(&collector.active_requests, &[model]) {
            g.inc();
        }
        Self { collector, endpoint, model: model.to_string(), priority, started_at, finished: false }
    }

    /// Record completion with the HTTP status returned to the caller.
    pub fn finish(mut self, status: u16) {
        self.record(&status.to_string());
        self.finished = true;
    }

    fn record(&self, status: &str) {
        self.collector.record_request(
            self.endpoint,
            &self.model,
            self.priority,
            status,
            self.started_at.elapsed(),
        );
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        if !self.finished {
            self.record("aborted");
        }
        if let Some(g) = child(&self.collector.active_requests, &[&self.model]) {
            g.dec();
        }
    }
}
