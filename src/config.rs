//! Environment-driven configuration
//!
//! Values are read once at startup (after `dotenvy` has loaded `.env`) and shared
//! through [`AppState`](crate::database::AppState). Campaign-level settings such as
//! chunk size fall back to the defaults defined here when the operator does not
//! provide them on creation.

use std::env;
use std::str::FromStr;

/// Runtime configuration for the dispatch service
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to (`PORT`)
    pub port: u16,

    /// Path of the redb database file (`DATABASE_URL`)
    pub database_url: String,

    /// Public base URL used for tracking links and as the fallback redirect (`BASE_URL`)
    pub base_url: String,

    /// Shared secret expected in the `Authorization` header of operator routes.
    /// `None` disables the check.
    pub auth_token: Option<String>,

    /// Default sender identity
    pub from_email: String,
    pub from_name: String,
    pub reply_to_email: String,

    /// Default number of recipients per chunk
    pub chunk_size: usize,

    /// Default pause the caller should observe between chunks
    pub chunk_delay_ms: u64,

    /// Default per-recipient transport timeout
    pub email_timeout_ms: u64,

    /// Default retry budget per campaign, `0` means unlimited
    pub max_retry_attempts: u32,

    /// Slack added to a pass lease on top of `slice × email_timeout_ms`; once the
    /// lease deadline has passed the pass is considered abandoned
    pub send_lease_secs: i64,

    /// Analytics older than this are purged
    pub analytics_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "data.db".to_string(),
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            from_email: "newsletter@localhost".to_string(),
            from_name: "Newsletter".to_string(),
            reply_to_email: "newsletter@localhost".to_string(),
            chunk_size: 50,
            chunk_delay_ms: 1000,
            email_timeout_ms: 10_000,
            max_retry_attempts: 5,
            send_lease_secs: 300,
            analytics_retention_days: 365,
        }
    }
}

impl Config {
    /// Builds the configuration from environment variables, using [`Config::default`]
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let auth_token = env::var("AUTHORIZATION").ok().filter(|s| !s.is_empty());

        Self {
            port: env_or("PORT", defaults.port),
            database_url: env_or("DATABASE_URL", defaults.database_url),
            base_url: env_or("BASE_URL", defaults.base_url)
                .trim_end_matches('/')
                .to_string(),
            auth_token,
            from_email: env_or("FROM_EMAIL", defaults.from_email),
            from_name: env_or("FROM_NAME", defaults.from_name),
            reply_to_email: env_or("REPLY_TO_EMAIL", defaults.reply_to_email),
            chunk_size: env_or("CHUNK_SIZE", defaults.chunk_size).max(1),
            chunk_delay_ms: env_or("CHUNK_DELAY_MS", defaults.chunk_delay_ms),
            email_timeout_ms: env_or("EMAIL_TIMEOUT_MS", defaults.email_timeout_ms),
            max_retry_attempts: env_or("MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts),
            send_lease_secs: env_or("SEND_LEASE_SECS", defaults.send_lease_secs),
            analytics_retention_days: env_or(
                "ANALYTICS_RETENTION_DAYS",
                defaults.analytics_retention_days,
            ),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable configuration value");
                default
            }
        },
        Err(_) => default,
    }
}
