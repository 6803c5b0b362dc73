use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{bail, Context, Result};

use crate::cache::{CacheConfig, RefreshConfig};

/// Default cache TTL: 5 minutes in milliseconds
const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

/// Where the family dataset comes from. A URL wins over a file.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub url: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl_ms: u64,
    pub max_entries: usize,
    pub refresh_threshold: f64,
    pub background_refresh: bool,
    pub fetch_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub interval_secs: u64,
    pub auto: bool,
    pub smart: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub stale_threshold_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub cache: CacheSettings,
    pub refresh: RefreshSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cache_defaults = CacheConfig::default();
        let refresh_defaults = RefreshConfig::default();

        Ok(Self {
            server: ServerConfig {
                port: env::var("PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .context("PORT must be a valid port number")?,
            },
            source: SourceConfig {
                url: env::var("FAMILY_SOURCE_URL").ok().filter(|v| !v.is_empty()),
                file: env::var("FAMILY_SOURCE_FILE")
                    .ok()
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from),
            },
            cache: CacheSettings {
                ttl_ms: env_or("CACHE_TTL_MS", DEFAULT_CACHE_TTL_MS),
                max_entries: env_or("CACHE_MAX_ENTRIES", cache_defaults.max_entries),
                refresh_threshold: env_or(
                    "CACHE_REFRESH_THRESHOLD",
                    cache_defaults.refresh_threshold,
                ),
                background_refresh: env_or(
                    "CACHE_BACKGROUND_REFRESH",
                    cache_defaults.enable_background_refresh,
                ),
                fetch_timeout_ms: env_or(
                    "CACHE_FETCH_TIMEOUT_MS",
                    cache_defaults
                        .fetch_timeout
                        .map_or(0, |timeout| timeout.as_millis() as u64),
                ),
            },
            refresh: RefreshSettings {
                interval_secs: env_or("REFRESH_INTERVAL_SECS", refresh_defaults.interval.as_secs()),
                auto: env_or("REFRESH_AUTO", refresh_defaults.enable_auto_refresh),
                smart: env_or("REFRESH_SMART", refresh_defaults.enable_smart_refresh),
                max_retries: env_or("REFRESH_MAX_RETRIES", refresh_defaults.max_retries),
                retry_delay_ms: env_or(
                    "REFRESH_RETRY_DELAY_MS",
                    refresh_defaults.retry_delay.as_millis() as u64,
                ),
                stale_threshold_secs: env_or(
                    "STALE_THRESHOLD_SECS",
                    refresh_defaults.stale_threshold.as_secs(),
                ),
            },
        })
    }

    /// Check the merged settings; call after CLI overrides are applied
    pub fn validate(&self) -> Result<()> {
        if self.source.url.is_none() && self.source.file.is_none() {
            bail!("either FAMILY_SOURCE_URL or FAMILY_SOURCE_FILE must be set");
        }
        self.to_cache_config()
            .validate()
            .context("invalid cache configuration")?;
        self.to_refresh_config()
            .validate()
            .context("invalid refresh configuration")?;
        Ok(())
    }

    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_millis(self.cache.ttl_ms),
            max_entries: self.cache.max_entries,
            refresh_threshold: self.cache.refresh_threshold,
            enable_background_refresh: self.cache.background_refresh,
            // 0 disables the timeout
            fetch_timeout: (self.cache.fetch_timeout_ms > 0)
                .then(|| Duration::from_millis(self.cache.fetch_timeout_ms)),
            ..CacheConfig::default()
        }
    }

    pub fn to_refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            interval: Duration::from_secs(self.refresh.interval_secs),
            enable_auto_refresh: self.refresh.auto,
            stale_threshold: Duration::from_secs(self.refresh.stale_threshold_secs),
            max_retries: self.refresh.max_retries,
            retry_delay: Duration::from_millis(self.refresh.retry_delay_ms),
            enable_smart_refresh: self.refresh.smart,
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or unparsable
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig { port: 3000 },
            source: SourceConfig {
                url: None,
                file: Some(PathBuf::from("family.json")),
            },
            cache: CacheSettings {
                ttl_ms: 60_000,
                max_entries: 20,
                refresh_threshold: 0.75,
                background_refresh: true,
                fetch_timeout_ms: 0,
            },
            refresh: RefreshSettings {
                interval_secs: 120,
                auto: false,
                smart: true,
                max_retries: 2,
                retry_delay_ms: 500,
                stale_threshold_secs: 600,
            },
        }
    }

    #[test]
    fn test_conversion_to_runtime_configs() {
        let config = sample();
        assert!(config.validate().is_ok());

        let cache = config.to_cache_config();
        assert_eq!(cache.default_ttl, Duration::from_secs(60));
        assert_eq!(cache.max_entries, 20);
        assert_eq!(cache.fetch_timeout, None);
        assert_eq!(cache.cleanup_interval, Duration::from_secs(60));

        let refresh = config.to_refresh_config();
        assert_eq!(refresh.interval, Duration::from_secs(120));
        assert!(!refresh.enable_auto_refresh);
        assert_eq!(refresh.retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = sample();
        config.source.file = None;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.cache.refresh_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.refresh.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("HEARTH_TEST_GARBAGE_NUMBER", "not-a-number");
        assert_eq!(env_or("HEARTH_TEST_GARBAGE_NUMBER", 42u64), 42);
        env::set_var("HEARTH_TEST_GOOD_NUMBER", " 7 ");
        assert_eq!(env_or("HEARTH_TEST_GOOD_NUMBER", 42u64), 7);
        assert!(env_or("HEARTH_TEST_UNSET_FLAG", true));
    }
}
