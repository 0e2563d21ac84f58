//! Process-wide HTTP client and error mapping shared by the platform adapters.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::anyhow;
use log::warn;
use reqwest::{Client, StatusCode};
use serde_json::Value;

const TIMEOUT_ENV: &str = "CERTDEPLOY_HTTP_TIMEOUT_SECS";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpClient;

impl HttpClient {
    pub fn shared() -> &'static Client {
        static CLIENT: OnceLock<Client> = OnceLock::new();
        CLIENT.get_or_init(|| {
            let timeout = request_timeout(std::env::var(TIMEOUT_ENV).ok().as_deref());
            Client::builder()
                .timeout(timeout)
                .user_agent(concat!("certdeploy/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|err| {
                    warn!("[platform-http] failed to build shared client: {err}");
                    Client::new()
                })
        })
    }
}

/// Whole-request timeout from the `CERTDEPLOY_HTTP_TIMEOUT_SECS` value.
fn request_timeout(raw: Option<&str>) -> Duration {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return DEFAULT_TIMEOUT;
    };
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => {
            warn!("[platform-http] ignoring {TIMEOUT_ENV}={raw}; using {DEFAULT_TIMEOUT:?}");
            DEFAULT_TIMEOUT
        }
    }
}

/// DigitalOcean answers errors with `{"id": "...", "message": "..."}`;
/// anything else is reported as the raw body.
fn error_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let message = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
    });
    Some(message.unwrap_or_else(|| body.to_string()))
}

pub fn status_error(platform: &str, status: StatusCode, body: Option<String>) -> anyhow::Error {
    let detail = body.as_deref().and_then(error_detail);
    match (status, detail) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, Some(detail)) => {
            anyhow!("{platform} authentication failed: {detail}")
        }
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, None) => {
            anyhow!("{platform} authentication failed")
        }
        (StatusCode::TOO_MANY_REQUESTS, _) => anyhow!("{platform} rate limit exceeded"),
        (status, Some(detail)) => anyhow!("{platform} API error ({status}): {detail}"),
        (status, None) => anyhow!("{platform} API error: {status}"),
    }
}
