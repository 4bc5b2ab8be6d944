//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Permission cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: crate::telemetry::LoggingConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            logging: crate::telemetry::LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

/// Permission cache tuning.
///
/// TTLs are a backstop behind synchronous invalidation, so they are short:
/// tens of seconds to a few minutes.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL for cached memberships (including the absent-membership sentinel)
    #[serde(default = "default_membership_ttl", with = "humantime_serde")]
    pub membership_ttl: Duration,

    /// TTL for cached effective permission sets
    #[serde(default = "default_permissions_ttl", with = "humantime_serde")]
    pub permissions_ttl: Duration,

    /// Capacity of the invalidation event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            membership_ttl: default_membership_ttl(),
            permissions_ttl: default_permissions_ttl(),
            event_capacity: default_event_capacity(),
        }
    }
}

// Default value functions
fn default_database_url() -> String {
    "postgres://localhost:5432/academy".to_string()
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    5
}
fn default_membership_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_permissions_ttl() -> Duration {
    Duration::from_secs(120)
}
fn default_event_capacity() -> usize {
    1024
}

impl CoreConfig {
    /// Load configuration from environment and config files.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("ACADEMY").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.cache.membership_ttl, Duration::from_secs(60));
        assert_eq!(config.cache.permissions_ttl, Duration::from_secs(120));
        assert_eq!(config.cache.event_capacity, 1024);
    }

    #[test]
    fn test_cache_ttls_are_short() {
        // TTLs back up synchronous invalidation; they must stay in the
        // tens-of-seconds-to-minutes range, not hours.
        let config = CacheConfig::default();
        assert!(config.membership_ttl >= Duration::from_secs(10));
        assert!(config.membership_ttl <= Duration::from_secs(600));
        assert!(config.permissions_ttl <= Duration::from_secs(600));
    }
}
