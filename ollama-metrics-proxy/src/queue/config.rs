//! Configuration for the admission-control queue.

use std::time::Duration;

use crate::state::ConfigError;

/// Configuration for the admission-control queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of units resident in the queue
    pub capacity: usize,

    /// Number of workers executing units against the backend
    /// This should match or be less than OLLAMA_NUM_PARALLEL
    pub workers: usize,

    /// Deadline applied to every submission (None disables it)
    pub request_timeout: Option<Duration>,

    /// Budget for draining in-flight work at shutdown
    pub shutdown_timeout: Duration,

    /// Interval of the processing-rate sampler
    pub sample_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            // Match Ollama's default OLLAMA_NUM_PARALLEL
            workers: 4,
            request_timeout: Some(Duration::from_secs(300)),
            shutdown_timeout: Duration::from_secs(30),
            sample_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MAX_QUEUE_SIZE") {
            if let Ok(n) = val.parse() {
                config.capacity = n;
            }
        }

        if let Ok(val) = std::env::var("MAX_CONCURRENCY") {
            if let Ok(n) = val.parse() {
                config.workers = n;
            }
        }

        if let Ok(val) = std::env::var("QUEUE_TIMEOUT_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.request_timeout = (n > 0).then(|| Duration::from_secs(n));
            }
        }

        if let Ok(val) = std::env::var("SHUTDOWN_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.shutdown_timeout = Duration::from_secs(n);
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("MAX_QUEUE_SIZE must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("MAX_CONCURRENCY must be at least 1".into()));
        }
        if self.sample_interval.is_zero() {
            return Err(ConfigError::Invalid("sample interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, 100);
        assert_eq!(config.workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = QueueConfig { capacity: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = QueueConfig { workers: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
