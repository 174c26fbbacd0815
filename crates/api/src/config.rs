//! Application configuration loaded from environment variables.

use std::time::Duration;

use orchestrator::{RetryPolicy, RuntimeConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL history store; in-memory when unset
/// - `MAX_CONCURRENT_ACTIVITIES` (default: `16`)
/// - `ACTIVITY_TIMEOUT_MS` (default: `30000`)
/// - `RETRY_MAX_ATTEMPTS` (default: `3`)
/// - `RETRY_INITIAL_BACKOFF_MS` (default: `100`)
/// - `RETRY_MAX_BACKOFF_MS` (default: `5000`)
/// - `RETRY_MULTIPLIER`: backoff growth factor, at least 1 (default: `2.0`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub max_concurrent_activities: usize,
    pub activity_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub retry_multiplier: f64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|f| LogFormat::parse(&f))
                .unwrap_or(defaults.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_concurrent_activities: parsed("MAX_CONCURRENT_ACTIVITIES")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_activities),
            activity_timeout: parsed("ACTIVITY_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.activity_timeout),
            retry_max_attempts: parsed("RETRY_MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.retry_max_attempts),
            retry_initial_backoff: parsed("RETRY_INITIAL_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_initial_backoff),
            retry_max_backoff: parsed("RETRY_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_backoff),
            retry_multiplier: lookup("RETRY_MULTIPLIER")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|m| m.is_finite() && *m >= 1.0)
                .unwrap_or(defaults.retry_multiplier),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the orchestration runtime settings.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_concurrent_activities: self.max_concurrent_activities,
            activity_timeout: self.activity_timeout,
            retry_policy: RetryPolicy::new(
                self.retry_max_attempts,
                self.retry_initial_backoff,
                self.retry_max_backoff,
            )
            .with_multiplier(self.retry_multiplier),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            max_concurrent_activities: 16,
            activity_timeout: Duration::from_millis(30_000),
            retry_max_attempts: 3,
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_millis(5_000),
            retry_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.max_concurrent_activities, 16);
        assert_eq!(config.activity_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_from_lookup_reads_every_setting() {
        let config = Config::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("RUST_LOG", "debug"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/orders"),
            ("MAX_CONCURRENT_ACTIVITIES", "4"),
            ("ACTIVITY_TIMEOUT_MS", "1500"),
            ("RETRY_MAX_ATTEMPTS", "5"),
            ("RETRY_INITIAL_BACKOFF_MS", "10"),
            ("RETRY_MAX_BACKOFF_MS", "200"),
            ("RETRY_MULTIPLIER", "1.5"),
        ]));

        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/orders")
        );

        let runtime = config.runtime_config();
        assert_eq!(runtime.max_concurrent_activities, 4);
        assert_eq!(runtime.activity_timeout, Duration::from_millis(1500));
        assert_eq!(runtime.retry_policy.max_attempts, 5);
        assert_eq!(runtime.retry_policy.initial_backoff, Duration::from_millis(10));
        assert_eq!(runtime.retry_policy.max_backoff, Duration::from_millis(200));
        assert_eq!(runtime.retry_policy.multiplier, 1.5);
        assert_eq!(
            runtime.retry_policy.backoff_after(2),
            Duration::from_millis(15)
        );
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "not-a-port"),
            ("MAX_CONCURRENT_ACTIVITIES", "0"),
            ("ACTIVITY_TIMEOUT_MS", "-5"),
            ("RETRY_MAX_ATTEMPTS", "many"),
            ("DATABASE_URL", "  "),
            ("LOG_FORMAT", "yaml"),
            ("RETRY_MULTIPLIER", "0.5"),
        ]));

        assert_eq!(config.port, 3000);
        assert_eq!(config.max_concurrent_activities, 16);
        assert_eq!(config.activity_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_max_attempts, 3);
        assert!(config.database_url.is_none());
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.retry_multiplier, 2.0);
    }
}
