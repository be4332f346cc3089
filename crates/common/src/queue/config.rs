use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Configuration for [`BackpressureQueue`](super::BackpressureQueue)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Tasks allowed to wait for a worker
    pub max_queue_size: usize,
    /// Workers, i.e. tasks running at once
    pub max_concurrent: usize,
    /// How long `shutdown` waits for workers before aborting them
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_queue_size: 100, max_concurrent: 10, shutdown_timeout: Duration::from_secs(10) }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::new()
    }

    /// Total tasks admitted at once (waiting plus running)
    pub fn capacity(&self) -> usize {
        self.max_queue_size.saturating_add(self.max_concurrent)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for QueueConfig
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn new() -> Self {
        Self { config: QueueConfig::default() }
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<QueueConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_capacity() {
        let config = QueueConfig::default();
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.capacity(), 110);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(QueueConfig::builder().max_concurrent(0).build().is_err());
        assert!(QueueConfig::builder().max_queue_size(0).max_concurrent(1).build().is_ok());
    }
}
