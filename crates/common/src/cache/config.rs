//! Cache configuration types and builder

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Configuration for [`CoalescingCache`](super::CoalescingCache)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Entries kept before the eviction sweep runs
    pub max_entries: usize,

    /// Freshness window used when a call passes no explicit TTL
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1000, default_ttl: Duration::from_secs(5) }
    }
}

impl CacheConfig {
    /// Create a new configuration builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_entries == 0 {
            return Err(ConfigError::invalid("max_entries must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CacheConfig`]
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.max_entries = max;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    pub fn build(self) -> ConfigResult<CacheConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.default_ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_validates() {
        assert!(CacheConfig::builder().max_entries(0).build().is_err());

        let config = CacheConfig::builder()
            .max_entries(10)
            .default_ttl(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(config.max_entries, 10);
        assert_eq!(config.default_ttl, Duration::from_secs(30));
    }
}
