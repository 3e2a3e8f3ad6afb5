use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::connectors::sync::DEFAULT_MAX_CONTENT_BYTES;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_USER_AGENT: &str = concat!("conhub-ingest/", env!("CARGO_PKG_VERSION"));

/// Process-wide settings shared by every connector the registry builds.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Per-item content ceiling; larger items are emitted metadata-only
    pub max_content_bytes: u64,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl IngestConfig {
    /// Load `.env` (if present) and read the environment.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Self {
        Self {
            max_content_bytes: parse_var("INGEST_MAX_CONTENT_BYTES", DEFAULT_MAX_CONTENT_BYTES),
            http_timeout: Duration::from_secs(parse_var(
                "INGEST_HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )),
            user_agent: std::env::var("INGEST_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: DEFAULT_MAX_CONTENT_BYTES,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Copy + std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value > T::default() => value,
            _ => {
                warn!(variable = name, value = %raw, default = %default, "Ignoring unusable setting");
                default
            }
        },
        Err(_) => default,
    }
}
