//! Data-layer configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! All optional:
//! - `COUPONHUB_CACHE_CAPACITY` - Max in-memory cache entries (default: 1000)
//! - `COUPONHUB_CACHE_TTL_MS` - Default cache TTL in ms (default: 300000)
//! - `COUPONHUB_CACHE_PATH` - JSON file for the persisted cache tier
//!   (default: unset, persisted tier kept in memory)
//! - `COUPONHUB_CACHE_QUOTA_BYTES` - Persisted tier quota (default: 5 MiB)
//! - `COUPONHUB_METRICS_CAPACITY` - Query metrics ring buffer size (default: 1000)
//! - `COUPONHUB_SLOW_QUERY_MS` - Slow query warning threshold (default: 1000)
//! - `COUPONHUB_VERY_SLOW_QUERY_MS` - Very slow query threshold (default: 2000)
//! - `COUPONHUB_DISCOVERY_CONCURRENCY` - Parallel discovery queries (default: 4)
//! - `COUPONHUB_ACTIVE_BUSINESS_LIMIT` - Active business listing cap (default: 50)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Cache tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Max entries in the memory tier before eviction.
    pub memory_capacity: usize,
    /// TTL used when callers do not pass one.
    pub default_ttl: Duration,
    /// File backing the persisted tier, if any.
    pub storage_path: Option<PathBuf>,
    /// Byte quota of the persisted tier.
    pub storage_quota_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1000,
            default_ttl: Duration::from_millis(300_000),
            storage_path: None,
            storage_quota_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Performance monitor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Ring buffer size.
    pub capacity: usize,
    /// Queries slower than this are logged and listed as slow.
    pub slow_query: Duration,
    /// Queries slower than this get a second, louder warning.
    pub very_slow_query: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            slow_query: Duration::from_millis(1000),
            very_slow_query: Duration::from_millis(2000),
        }
    }
}

/// Business discovery tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Queries in flight at once during fan-out.
    pub max_concurrent_queries: usize,
    /// Soft cap on the active-business listing.
    pub active_business_limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 4,
            active_business_limit: 50,
        }
    }
}

/// Data-layer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataConfig {
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
    pub discovery: DiscoveryConfig,
}

impl DataConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable does not parse or the thresholds
    /// contradict each other.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup.
    fn from_source(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let cache = CacheConfig {
            memory_capacity: parse_or(&get, "COUPONHUB_CACHE_CAPACITY", defaults.cache.memory_capacity)?,
            default_ttl: millis_or(&get, "COUPONHUB_CACHE_TTL_MS", defaults.cache.default_ttl)?,
            storage_path: get("COUPONHUB_CACHE_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            storage_quota_bytes: parse_or(
                &get,
                "COUPONHUB_CACHE_QUOTA_BYTES",
                defaults.cache.storage_quota_bytes,
            )?,
        };

        let monitor = MonitorConfig {
            capacity: parse_or(&get, "COUPONHUB_METRICS_CAPACITY", defaults.monitor.capacity)?,
            slow_query: millis_or(&get, "COUPONHUB_SLOW_QUERY_MS", defaults.monitor.slow_query)?,
            very_slow_query: millis_or(
                &get,
                "COUPONHUB_VERY_SLOW_QUERY_MS",
                defaults.monitor.very_slow_query,
            )?,
        };

        let discovery = DiscoveryConfig {
            max_concurrent_queries: parse_or(
                &get,
                "COUPONHUB_DISCOVERY_CONCURRENCY",
                defaults.discovery.max_concurrent_queries,
            )?,
            active_business_limit: parse_or(
                &get,
                "COUPONHUB_ACTIVE_BUSINESS_LIMIT",
                defaults.discovery.active_business_limit,
            )?,
        };

        let config = Self {
            cache,
            monitor,
            discovery,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Inconsistent` on zero capacities or inverted
    /// thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.memory_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "cache capacity must be at least 1".to_string(),
            ));
        }
        if self.monitor.capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "metrics capacity must be at least 1".to_string(),
            ));
        }
        if self.monitor.very_slow_query < self.monitor.slow_query {
            return Err(ConfigError::Inconsistent(format!(
                "very slow threshold ({:?}) is below slow threshold ({:?})",
                self.monitor.very_slow_query, self.monitor.slow_query
            )));
        }
        if self.discovery.max_concurrent_queries == 0 {
            return Err(ConfigError::Inconsistent(
                "discovery concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Parse a variable, falling back to `default` when unset.
fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}

/// Parse a millisecond duration, falling back to `default` when unset.
fn millis_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(get, key, default_ms).map(Duration::from_millis)
}
