//! Ledger tuning knobs.

use std::time::Duration;

/// Retry policy for atomic units that hit lock contention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles afterwards
    pub base_backoff: Duration,

    /// Upper bound for a single backoff
    pub max_backoff: Duration,

    /// How long one attempt may wait for a row lock
    pub lock_timeout: Duration,
}

impl RetryPolicy {
    /// Backoff to sleep after `attempt` (1-based) failed, with up to 50% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_backoff);
        let jitter_ms = (capped.as_millis() as u64) / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::random_range(0..=jitter_ms)
        };
        capped.saturating_sub(Duration::from_millis(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// Ledger configuration
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Contention retry policy shared by every store
    pub retry: RetryPolicy,

    /// Interval between reservation expiry sweeps
    pub sweep_interval: Duration,

    /// TTL applied when a caller passes none
    pub default_reservation_ttl: Duration,

    /// `source` field stamped on every published event
    pub event_source: String,

    /// Event schema version
    pub event_version: String,

    /// Capacity of the notifier queue between ledger and publisher
    pub notifier_queue_capacity: usize,

    /// Publish attempts per event before it is dropped
    pub publish_max_attempts: u32,

    /// Bus channel for events this service publishes
    pub publish_channel: String,

    /// Bus channel carrying `credit_earned` events
    pub consume_channel: String,
}

impl WalletConfig {
    /// Create configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - `WALLET_RETRY_ATTEMPTS` (default: 5)
    /// - `WALLET_RETRY_BASE_MS` (default: 20)
    /// - `WALLET_RETRY_MAX_MS` (default: 500)
    /// - `WALLET_LOCK_TIMEOUT_MS` (default: 2000)
    /// - `RESERVATION_SWEEP_SECS` (default: 30)
    /// - `RESERVATION_DEFAULT_TTL_SECS` (default: 3600)
    /// - `EVENT_SOURCE` (default: wallet-service)
    /// - `EVENT_SCHEMA_VERSION` (default: 1.0)
    /// - `EVENT_QUEUE_CAPACITY` (default: 1024)
    /// - `EVENT_PUBLISH_ATTEMPTS` (default: 3)
    /// - `EVENT_PUBLISH_CHANNEL` (default: wallet_events)
    /// - `EVENT_CONSUME_CHANNEL` (default: activity_events)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retry: RetryPolicy {
                max_attempts: parse_env_or("WALLET_RETRY_ATTEMPTS", defaults.retry.max_attempts),
                base_backoff: Duration::from_millis(parse_env_or("WALLET_RETRY_BASE_MS", 20)),
                max_backoff: Duration::from_millis(parse_env_or("WALLET_RETRY_MAX_MS", 500)),
                lock_timeout: Duration::from_millis(parse_env_or("WALLET_LOCK_TIMEOUT_MS", 2000)),
            },
            sweep_interval: Duration::from_secs(parse_env_or("RESERVATION_SWEEP_SECS", 30)),
            default_reservation_ttl: Duration::from_secs(parse_env_or(
                "RESERVATION_DEFAULT_TTL_SECS",
                3600,
            )),
            event_source: parse_env_or("EVENT_SOURCE", defaults.event_source),
            event_version: parse_env_or("EVENT_SCHEMA_VERSION", defaults.event_version),
            notifier_queue_capacity: parse_env_or(
                "EVENT_QUEUE_CAPACITY",
                defaults.notifier_queue_capacity,
            ),
            publish_max_attempts: parse_env_or(
                "EVENT_PUBLISH_ATTEMPTS",
                defaults.publish_max_attempts,
            ),
            publish_channel: parse_env_or("EVENT_PUBLISH_CHANNEL", defaults.publish_channel),
            consume_channel: parse_env_or("EVENT_CONSUME_CHANNEL", defaults.consume_channel),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(30),
            default_reservation_ttl: Duration::from_secs(3600),
            event_source: "wallet-service".to_string(),
            event_version: "1.0".to_string(),
            notifier_queue_capacity: 1024,
            publish_max_attempts: 3,
            publish_channel: "wallet_events".to_string(),
            consume_channel: "activity_events".to_string(),
        }
    }
}

/// Helper to parse environment variable with default fallback
pub fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
