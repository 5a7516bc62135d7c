use std::time::Duration;

use crate::error::ConfigError;

/// Largest batch the push provider accepts in a single multicast call.
pub const PROVIDER_MAX_CHUNK_SIZE: usize = 500;

/// Upper bound on concurrent chunk workers per dispatch.
pub const MAX_CONCURRENCY: usize = 10;

/// Error codes that mean the provider has permanently forgotten an address.
pub const DEFAULT_PERMANENT_ERROR_CODES: &[&str] = &[
    "messaging/registration-token-not-registered",
    "messaging/invalid-registration-token",
    "NotRegistered",
    "InvalidRegistration",
    "Unregistered",
    "BadDeviceToken",
    "unregistered",
    "not_registered",
    "invalid_registration_token",
];

/// Push dispatch configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Addresses per provider call (default: 500, never above 500)
    pub chunk_size: usize,

    /// Concurrent chunk workers per dispatch (default: 5, clamped to 1..=10)
    pub concurrency: usize,

    /// Attempts per chunk inline, and redrives per queued item (default: 3)
    pub max_retry_attempts: u32,

    /// Base backoff delay in milliseconds (default: 200)
    pub backoff_base_ms: u64,

    /// Upper bound of the random jitter added to each delay (default: 400)
    pub backoff_jitter_ms: u64,

    /// Backoff ceiling in milliseconds (default: 1600)
    pub backoff_max_ms: u64,

    /// Retry queue worker wake interval in milliseconds (default: 5000)
    pub queue_poll_interval_ms: u64,

    /// Items redriven per worker tick (default: 5)
    pub queue_batch_size: usize,

    /// Invalid-address rate that raises an alert (default: 0.05)
    pub invalid_rate_threshold: f64,

    /// Retry queue depth that raises an alert (default: 100)
    pub queue_depth_alert_threshold: usize,

    /// Provider error codes treated as "address permanently invalid"
    pub permanent_error_codes: Vec<String>,

    /// File used by the file-backed dead-letter store
    pub dlq_path: String,

    /// Push relay endpoint for the HTTP delivery client
    pub relay_url: Option<String>,

    /// Bearer token sent to the push relay
    pub relay_api_key: Option<String>,

    /// Per-request timeout for the push relay in milliseconds (default: 10000)
    pub relay_timeout_ms: u64,

    /// PostgreSQL connection string; enables table-backed stores when set
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 5)
    pub db_max_connections: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            chunk_size: PROVIDER_MAX_CHUNK_SIZE,
            concurrency: 5,
            max_retry_attempts: 3,
            backoff_base_ms: 200,
            backoff_jitter_ms: 400,
            backoff_max_ms: 1600,
            queue_poll_interval_ms: 5000,
            queue_batch_size: 5,
            invalid_rate_threshold: 0.05,
            queue_depth_alert_threshold: 100,
            permanent_error_codes: DEFAULT_PERMANENT_ERROR_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            dlq_path: "push-dlq.json".to_string(),
            relay_url: None,
            relay_api_key: None,
            relay_timeout_ms: 10_000,
            database_url: None,
            db_max_connections: 5,
        }
    }
}

impl PushConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let permanent_error_codes = match std::env::var("PUSH_PERMANENT_ERROR_CODES") {
            Ok(raw) => {
                let codes: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
                if codes.is_empty() {
                    defaults.permanent_error_codes.clone()
                } else {
                    codes
                }
            }
            Err(_) => defaults.permanent_error_codes.clone(),
        };

        let config = Self {
            chunk_size: parse_var("PUSH_CHUNK_SIZE", defaults.chunk_size)?,
            concurrency: parse_var("PUSH_CONCURRENCY", defaults.concurrency)?,
            max_retry_attempts: parse_var("PUSH_MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts)?,
            backoff_base_ms: parse_var("PUSH_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_jitter_ms: parse_var("PUSH_BACKOFF_JITTER_MS", defaults.backoff_jitter_ms)?,
            backoff_max_ms: parse_var("PUSH_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
            queue_poll_interval_ms: parse_var(
                "PUSH_QUEUE_POLL_INTERVAL_MS",
                defaults.queue_poll_interval_ms,
            )?,
            queue_batch_size: parse_var("PUSH_QUEUE_BATCH_SIZE", defaults.queue_batch_size)?,
            invalid_rate_threshold: parse_var(
                "PUSH_INVALID_RATE_THRESHOLD",
                defaults.invalid_rate_threshold,
            )?,
            queue_depth_alert_threshold: parse_var(
                "PUSH_QUEUE_DEPTH_ALERT_THRESHOLD",
                defaults.queue_depth_alert_threshold,
            )?,
            permanent_error_codes,
            dlq_path: std::env::var("PUSH_DLQ_PATH").unwrap_or(defaults.dlq_path),
            relay_url: std::env::var("PUSH_RELAY_URL").ok(),
            relay_api_key: std::env::var("PUSH_RELAY_API_KEY").ok(),
            relay_timeout_ms: parse_var("PUSH_RELAY_TIMEOUT_MS", defaults.relay_timeout_ms)?,
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
        };

        Ok(config.clamped())
    }

    /// Pull every value back inside the range the dispatcher can honour.
    pub fn clamped(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(1, PROVIDER_MAX_CHUNK_SIZE);
        self.concurrency = self.concurrency.clamp(1, MAX_CONCURRENCY);
        self.max_retry_attempts = self.max_retry_attempts.max(1);
        self.queue_batch_size = self.queue_batch_size.max(1);
        self.queue_poll_interval_ms = self.queue_poll_interval_ms.max(1);
        if self.backoff_max_ms < self.backoff_base_ms {
            self.backoff_max_ms = self.backoff_base_ms;
        }
        if !self.invalid_rate_threshold.is_finite() || self.invalid_rate_threshold < 0.0 {
            self.invalid_rate_threshold = 0.05;
        }
        self
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw.clone(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = PushConfig::default();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.backoff_base_ms, 200);
        assert_eq!(config.backoff_jitter_ms, 400);
        assert_eq!(config.backoff_max_ms, 1600);
        assert_eq!(config.queue_poll_interval_ms, 5000);
        assert_eq!(config.queue_batch_size, 5);
        assert!((config.invalid_rate_threshold - 0.05).abs() < f64::EPSILON);
        assert!(
            config
                .permanent_error_codes
                .iter()
                .any(|c| c == "unregistered")
        );
    }

    #[test]
    fn test_clamped_limits_chunk_size_and_concurrency() {
        let config = PushConfig {
            chunk_size: 2000,
            concurrency: 64,
            ..PushConfig::default()
        }
        .clamped();
        assert_eq!(config.chunk_size, PROVIDER_MAX_CHUNK_SIZE);
        assert_eq!(config.concurrency, MAX_CONCURRENCY);

        let config = PushConfig {
            chunk_size: 0,
            concurrency: 0,
            max_retry_attempts: 0,
            ..PushConfig::default()
        }
        .clamped();
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.max_retry_attempts, 1);
    }

    #[test]
    fn test_clamped_keeps_cap_above_base() {
        let config = PushConfig {
            backoff_base_ms: 500,
            backoff_max_ms: 100,
            ..PushConfig::default()
        }
        .clamped();
        assert_eq!(config.backoff_max_ms, 500);
    }
}
