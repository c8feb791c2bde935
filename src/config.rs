//! Session configuration parsed from environment variables.
//!
//! Every knob has a default so a bare `livepoll join CODE` works against a
//! local session service. Unparseable numbers fall back to their defaults;
//! structural mistakes (an unknown countdown mode, a non-http base URL) are
//! errors.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_STORE_PATH: &str = "livepoll-store.json";
pub const DEFAULT_TICK_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_LEAVE_ACK_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("unknown LIVEPOLL_COUNTDOWN mode '{0}' (expected 'fixed' or 'wall_clock')")]
    UnknownCountdownMode(String),
}

/// How each tick updates poll countdowns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CountdownMode {
    /// Exactly one second off every active poll per tick.
    #[default]
    Fixed,
    /// Remaining time recomputed from the poll's arrival instant.
    WallClock,
}

impl std::str::FromStr for CountdownMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "fixed" => Ok(Self::Fixed),
            "wall_clock" => Ok(Self::WallClock),
            other => Err(ConfigError::UnknownCountdownMode(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl ReconnectPolicy {
    /// Next backoff delay after `current_ms`, doubling up to the cap.
    #[must_use]
    pub fn next_ms(&self, current_ms: u64) -> u64 {
        current_ms.saturating_mul(2).min(self.max_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub api_url: String,
    pub ws_url: String,
    /// Opaque identity forwarded with each answer.
    pub user_id: Option<String>,
    pub store_path: PathBuf,
    pub tick: Duration,
    pub countdown: CountdownMode,
    pub reconnect: ReconnectPolicy,
    pub timeouts: HttpTimeouts,
    pub leave_ack_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_owned(),
            ws_url: "ws://127.0.0.1:3000/ws".to_owned(),
            user_id: None,
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            countdown: CountdownMode::Fixed,
            reconnect: ReconnectPolicy { initial_ms: DEFAULT_RECONNECT_INITIAL_MS, max_ms: DEFAULT_RECONNECT_MAX_MS },
            timeouts: HttpTimeouts {
                request_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
                connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            },
            leave_ack_timeout: Duration::from_millis(DEFAULT_LEAVE_ACK_TIMEOUT_MS),
        }
    }
}

impl SessionConfig {
    /// Build typed session config from environment variables.
    ///
    /// - `LIVEPOLL_API_URL`: REST base URL (default `http://127.0.0.1:3000`)
    /// - `LIVEPOLL_WS_URL`: push channel URL (default derived from the API URL)
    /// - `LIVEPOLL_USER_ID`: identity forwarded with answers
    /// - `LIVEPOLL_STORE_PATH`: durable key-value file
    /// - `LIVEPOLL_TICK_MS`: countdown period (default 1000)
    /// - `LIVEPOLL_COUNTDOWN`: `fixed` (default) or `wall_clock`
    /// - `LIVEPOLL_RECONNECT_INITIAL_MS` / `LIVEPOLL_RECONNECT_MAX_MS`
    /// - `LIVEPOLL_REQUEST_TIMEOUT_SECS` / `LIVEPOLL_CONNECT_TIMEOUT_SECS`
    /// - `LIVEPOLL_LEAVE_ACK_TIMEOUT_MS`
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown countdown mode or a base URL that
    /// cannot be turned into a websocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = std::env::var("LIVEPOLL_API_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let ws_url = match std::env::var("LIVEPOLL_WS_URL").ok().filter(|s| !s.is_empty()) {
            Some(url) => url,
            None => ws_url_from_api(&api_url)?,
        };
        let countdown = std::env::var("LIVEPOLL_COUNTDOWN")
            .ok()
            .filter(|s| !s.is_empty())
            .map_or(Ok(CountdownMode::Fixed), |raw| raw.parse())?;

        Ok(Self {
            api_url,
            ws_url,
            user_id: std::env::var("LIVEPOLL_USER_ID").ok().filter(|s| !s.is_empty()),
            store_path: std::env::var("LIVEPOLL_STORE_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map_or_else(|| PathBuf::from(DEFAULT_STORE_PATH), PathBuf::from),
            tick: Duration::from_millis(env_parse("LIVEPOLL_TICK_MS", DEFAULT_TICK_MS).max(1)),
            countdown,
            reconnect: ReconnectPolicy {
                initial_ms: env_parse("LIVEPOLL_RECONNECT_INITIAL_MS", DEFAULT_RECONNECT_INITIAL_MS),
                max_ms: env_parse("LIVEPOLL_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS),
            },
            timeouts: HttpTimeouts {
                request_secs: env_parse("LIVEPOLL_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
                connect_secs: env_parse("LIVEPOLL_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            },
            leave_ack_timeout: Duration::from_millis(env_parse(
                "LIVEPOLL_LEAVE_ACK_TIMEOUT_MS",
                DEFAULT_LEAVE_ACK_TIMEOUT_MS,
            )),
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Derive the push channel URL from the REST base URL.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidBaseUrl`] for anything but http(s).
pub fn ws_url_from_api(api_url: &str) -> Result<String, ConfigError> {
    let api_url = api_url.trim_end_matches('/');
    if let Some(rest) = api_url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/ws"));
    }
    if let Some(rest) = api_url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/ws"));
    }
    Err(ConfigError::InvalidBaseUrl(api_url.to_owned()))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
