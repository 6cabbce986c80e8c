use std::env;
use std::time::Duration;

use crate::error::{ChatError, Result};

pub const DEFAULT_API_URL: &str = "http://localhost:8090";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8090/ws/websocket";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

pub struct Config {
    pub api: ApiConfig,
    pub chat: ChatConfig,
}

pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

/// Per-room behaviour shared by every session the client opens
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// STOMP-over-WebSocket endpoint, `None` runs rooms in poll-only mode
    pub push_url: Option<String>,
    pub poll_interval: Duration,
    /// Fixed delay between reconnect attempts; retries are unbounded
    pub reconnect_delay: Duration,
    /// Re-fetch messages after the newest known id on every poll tick
    pub poll_messages: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            push_url: Some(DEFAULT_WS_URL.to_string()),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            poll_messages: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let push_enabled = env::var("CHAT_PUSH_ENABLED")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            api: ApiConfig {
                base_url: env::var("CHAT_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
                request_timeout: Duration::from_secs(env_u64(
                    "CHAT_REQUEST_TIMEOUT_SECS",
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                )),
            },
            chat: ChatConfig {
                push_url: push_enabled.then(|| {
                    env::var("CHAT_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string())
                }),
                poll_interval: Duration::from_millis(env_u64(
                    "CHAT_POLL_INTERVAL_MS",
                    DEFAULT_POLL_INTERVAL_MS,
                )),
                reconnect_delay: Duration::from_millis(env_u64(
                    "CHAT_RECONNECT_DELAY_MS",
                    DEFAULT_RECONNECT_DELAY_MS,
                )),
                poll_messages: env::var("CHAT_POLL_MESSAGES")
                    .map(|v| v.to_lowercase() == "true")
                    .unwrap_or(false),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !has_scheme(&self.api.base_url, &["http://", "https://"]) {
            return Err(ChatError::InvalidConfiguration(format!(
                "CHAT_API_URL must be an http(s) URL, got {}",
                self.api.base_url
            )));
        }

        if let Some(url) = &self.chat.push_url {
            if !has_scheme(url, &["ws://", "wss://"]) {
                return Err(ChatError::InvalidConfiguration(format!(
                    "CHAT_WS_URL must be a ws(s) URL, got {}",
                    url
                )));
            }
        }

        if self.chat.poll_interval.is_zero() {
            return Err(ChatError::InvalidConfiguration(
                "CHAT_POLL_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        if self.chat.reconnect_delay.is_zero() {
            return Err(ChatError::InvalidConfiguration(
                "CHAT_RECONNECT_DELAY_MS must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn has_scheme(url: &str, schemes: &[&str]) -> bool {
    schemes.iter().any(|scheme| url.starts_with(scheme))
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key = %key, value = %raw, default, "Invalid numeric setting, using default");
            default
        }),
        Err(_) => default,
    }
}
