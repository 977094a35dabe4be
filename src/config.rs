//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable holding the REST base URL.
pub const API_URL_VAR: &str = "INTAKE_API_URL";
/// Environment variable holding the push channel base URL.
pub const WS_URL_VAR: &str = "INTAKE_WS_URL";
/// Environment variable overriding the reconnect delay, in milliseconds.
pub const RECONNECT_DELAY_VAR: &str = "INTAKE_RECONNECT_DELAY_MS";
/// Environment variable overriding the reconnect attempt cap.
pub const MAX_RECONNECT_ATTEMPTS_VAR: &str = "INTAKE_MAX_RECONNECT_ATTEMPTS";

/// Reconnection policy for the push channel.
///
/// A fixed delay between attempts, not exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait between an unintentional close and the next attempt.
    pub delay: Duration,
    /// Consecutive reconnect attempts allowed after the last successful open.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(3000),
            max_attempts: 5,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST service, without trailing slash.
    pub api_url: String,
    /// Base URL of the push channel, without trailing slash.
    pub ws_url: String,
    /// Push channel reconnection policy.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            ws_url: "ws://localhost:8000".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Build a config pointing at explicit base URLs with the default policy.
    pub fn new(api_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api_url: normalize_base(api_url.into()),
            ws_url: normalize_base(ws_url.into()),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut reconnect = ReconnectPolicy::default();

        if let Some(raw) = lookup(RECONNECT_DELAY_VAR) {
            let ms: u64 = parse_number(RECONNECT_DELAY_VAR, &raw)?;
            reconnect.delay = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup(MAX_RECONNECT_ATTEMPTS_VAR) {
            reconnect.max_attempts = parse_number(MAX_RECONNECT_ATTEMPTS_VAR, &raw)?;
        }

        let api_url = lookup(API_URL_VAR)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.api_url);
        let ws_url = lookup(WS_URL_VAR)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.ws_url);

        Ok(Self {
            api_url: normalize_base(api_url),
            ws_url: normalize_base(ws_url),
            reconnect,
        })
    }

    /// Full URL for a REST path such as `/api/sessions`.
    pub fn api_endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    /// Push channel URL for a session.
    pub fn push_url(&self, session_id: &str) -> String {
        format!("{}/ws/{session_id}", self.ws_url)
    }
}

fn normalize_base(url: String) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
