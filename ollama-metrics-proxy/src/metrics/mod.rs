//! Metrics module for the proxy
//!
//! Provides an injected Prometheus collector for monitoring and observability.

pub mod collector;

// Re-export commonly used items
pub use collector::{Collector, RequestTimer, NAMESPACE};
