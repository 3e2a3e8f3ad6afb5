//! Shared HTTP plumbing for the provider adapters.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};

use super::error::{ConnectorError, ConnectorResult};
use super::rate_limiter::MAX_THROTTLE_BACKOFF_SECS;
use super::types::Source;
use crate::config::IngestConfig;

pub fn build_client(config: &IngestConfig) -> ConnectorResult<Client> {
    Client::builder()
        .timeout(config.http_timeout)
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| ConnectorError::InvalidConfiguration(format!("HTTP client: {}", e)))
}

/// `key` setting of the source without a trailing slash, or `default`.
pub fn base_url(source: &Source, key: &str, default: &str) -> String {
    source
        .setting(key)
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

/// Pass successful responses through; map everything else onto the
/// connector error taxonomy.
pub async fn check_response(response: Response, context: &str) -> ConnectorResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(into_error(response, context).await)
}

/// Consume a failed response into an error.
pub async fn into_error(response: Response, context: &str) -> ConnectorError {
    let status = response.status();
    let retry_after = retry_after_secs(response.headers());
    let body = response.text().await.unwrap_or_default();
    classify(status, retry_after, &body, context)
}

pub fn classify(status: StatusCode, retry_after_secs: i64, body: &str, context: &str) -> ConnectorError {
    match status {
        StatusCode::UNAUTHORIZED => {
            ConnectorError::AuthInvalid(format!("{} rejected the credential: {}", context, body))
        }
        StatusCode::TOO_MANY_REQUESTS => ConnectorError::RateLimited { retry_after_secs },
        // Google reports quota exhaustion as 403
        StatusCode::FORBIDDEN if body.contains("rateLimitExceeded") => {
            ConnectorError::RateLimited { retry_after_secs }
        }
        StatusCode::NOT_FOUND => ConnectorError::NotFound(format!("{}: {}", context, body)),
        StatusCode::GONE => ConnectorError::CursorExpired(format!("{}: {}", context, body)),
        _ => ConnectorError::HttpError(format!("{} failed with {}: {}", context, status, body)),
    }
}

/// Read a response body, giving up as soon as it grows past `max_bytes`.
/// `None` means the body is larger than the ceiling; nothing beyond the
/// ceiling is buffered.
pub async fn read_capped(mut response: Response, max_bytes: u64) -> ConnectorResult<Option<Vec<u8>>> {
    if response.content_length().map_or(false, |len| len > max_bytes) {
        return Ok(None);
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if (body.len() + chunk.len()) as u64 > max_bytes {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

/// Seconds from a `Retry-After` header (delta-seconds or HTTP date),
/// capped at [`MAX_THROTTLE_BACKOFF_SECS`]; 0 when absent or unparseable.
pub fn retry_after_secs(headers: &HeaderMap) -> i64 {
    let Some(value) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) else {
        return 0;
    };
    let value = value.trim();

    let secs = match value.parse::<i64>() {
        Ok(secs) => secs,
        Err(_) => chrono::DateTime::parse_from_rfc2822(value)
            .map(|at| (at.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_seconds())
            .unwrap_or(0),
    };
    secs.clamp(0, MAX_THROTTLE_BACKOFF_SECS as i64)
}

/// Provider-issued links are only followed on the configured API host, so
/// a tampered cursor cannot send the bearer token elsewhere.
pub fn ensure_under_base(link: &str, base: &str) -> ConnectorResult<()> {
    let trusted = link
        .strip_prefix(base)
        .map(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
        .unwrap_or(false);

    if trusted {
        Ok(())
    } else {
        Err(ConnectorError::InvalidCursor(format!(
            "link does not point at {}",
            base
        )))
    }
}
