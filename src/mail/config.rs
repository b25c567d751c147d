//! Session Configuration Module

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const GMAIL_IMAP_HOST: &str = "imap.gmail.com";
pub const GMAIL_IMAP_PORT: u16 = 993;

/// IMAP server configuration.
///
/// The connection is always TLS-wrapped with certificate validation on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Decoded bodies are truncated to this many bytes
    pub max_body_bytes: usize,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: GMAIL_IMAP_HOST.to_string(),
            port: GMAIL_IMAP_PORT,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(60),
            max_body_bytes: 100_000,
        }
    }
}

impl ImapConfig {
    pub fn is_gmail_host(&self) -> bool {
        self.host.ends_with("gmail.com") || self.host.ends_with("googlemail.com")
    }
}

/// Retry policy for connect and reconnect attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay used as random jitter, at most 0.1
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            jitter_ratio: 0.1,
        }
    }
}

/// Keepalive timer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// NOOP is sent once the connection has been idle this long
    pub idle_threshold: Duration,
    /// How often the timer wakes up to check idleness
    pub check_interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(10 * 60),
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Full session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub imap: ImapConfig,
    pub retry: RetryPolicy,
    pub keepalive: KeepaliveConfig,
    pub folder_cache_ttl: Duration,
    /// Non-connected sessions idle longer than this are pruned
    pub stale_after: Duration,
    /// How often the background cleanup prunes stale sessions
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            imap: ImapConfig::default(),
            retry: RetryPolicy::default(),
            keepalive: KeepaliveConfig::default(),
            folder_cache_ttl: Duration::from_secs(10 * 60),
            stale_after: Duration::from_secs(25 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("{} has an invalid value", key)),
        Err(_) => Ok(None),
    }
}

impl SessionConfig {
    /// Defaults overridden by `GMAIL_IMAP_*` environment variables.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("GMAIL_IMAP_HOST") {
            config.imap.host = host;
        }
        if let Some(port) = env_parse::<u16>("GMAIL_IMAP_PORT")? {
            config.imap.port = port;
        }
        if let Some(retries) = env_parse::<u32>("GMAIL_IMAP_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }
        if let Some(secs) = env_parse::<f64>("GMAIL_IMAP_INITIAL_BACKOFF_SECS")? {
            config.retry.initial_delay = Duration::try_from_secs_f64(secs)
                .map_err(|_| "GMAIL_IMAP_INITIAL_BACKOFF_SECS has an invalid value".to_string())?;
        }
        if let Some(secs) = env_parse::<f64>("GMAIL_IMAP_MAX_BACKOFF_SECS")? {
            config.retry.max_delay = Duration::try_from_secs_f64(secs)
                .map_err(|_| "GMAIL_IMAP_MAX_BACKOFF_SECS has an invalid value".to_string())?;
        }
        if let Some(secs) = env_parse::<u64>("GMAIL_IMAP_KEEPALIVE_SECS")? {
            config.keepalive.idle_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("GMAIL_IMAP_CLEANUP_SECS")? {
            config.cleanup_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.imap.host.is_empty() {
            errors.push("IMAP host is required".to_string());
        }
        if self.imap.port == 0 {
            errors.push("IMAP port must be non-zero".to_string());
        }
        if self.imap.connect_timeout.is_zero()
            || self.imap.command_timeout.is_zero()
            || self.imap.fetch_timeout.is_zero()
        {
            errors.push("Timeouts must be positive".to_string());
        }
        if self.retry.max_retries == 0 {
            errors.push("Max retries must be at least 1".to_string());
        }
        if self.retry.initial_delay.is_zero() || self.retry.max_delay < self.retry.initial_delay {
            errors.push("Backoff delays must be positive and max >= initial".to_string());
        }
        if !(0.0..=0.1).contains(&self.retry.jitter_ratio) {
            errors.push("Jitter ratio must be within [0, 0.1]".to_string());
        }
        if self.keepalive.idle_threshold.is_zero() || self.keepalive.check_interval.is_zero() {
            errors.push("Keepalive intervals must be positive".to_string());
        }
        if self.cleanup_interval.is_zero() {
            errors.push("Cleanup interval must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
