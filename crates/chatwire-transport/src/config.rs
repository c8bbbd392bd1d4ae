//! Transport configuration.
//!
//! Every timing the connection manager and the request client use is read from
//! [`TransportConfig`] through its `Duration` accessors.

use std::time::Duration;

use chatwire_core::ClientType;
use serde::Deserialize;

/// Configuration for the chat transport.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// WebSocket endpoint for the streaming chat channel.
    #[serde(default = "TransportConfig::default_ws_url")]
    pub ws_url: String,

    /// Base URL prepended to every REST path.
    #[serde(default = "TransportConfig::default_api_base_url")]
    pub api_base_url: String,

    /// Client platform tag used when none is given explicitly.
    #[serde(default)]
    pub client_type: ClientType,

    /// Interval between heartbeat pings in milliseconds.
    #[serde(default = "TransportConfig::default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Time allowed for a pong to arrive after a ping, in milliseconds.
    #[serde(default = "TransportConfig::default_pong_timeout")]
    pub pong_timeout_ms: u64,

    /// Upper bound a send waits for the connection to open, in milliseconds.
    #[serde(default = "TransportConfig::default_open_timeout")]
    pub open_timeout_ms: u64,

    /// Time allowed for the peer to acknowledge a close frame, in milliseconds.
    #[serde(default = "TransportConfig::default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Number of retries after the first failed REST attempt.
    #[serde(default = "TransportConfig::default_retry_count")]
    pub retry_count: u32,

    /// Fixed delay between REST attempts in milliseconds.
    #[serde(default = "TransportConfig::default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Per-attempt REST timeout in milliseconds.
    #[serde(default = "TransportConfig::default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Capacity of the inbound frame channel.
    #[serde(default = "TransportConfig::default_frame_buffer")]
    pub frame_buffer: usize,
}

impl TransportConfig {
    fn default_ws_url() -> String {
        "wss://higoall.com:9443/api/v1/buyer/ai-chat-ws".to_string()
    }

    fn default_api_base_url() -> String {
        "https://higoall.com:9443/api/v1".to_string()
    }

    const fn default_heartbeat_interval() -> u64 {
        30_000
    }

    const fn default_pong_timeout() -> u64 {
        10_000
    }

    const fn default_open_timeout() -> u64 {
        8_000
    }

    const fn default_close_timeout() -> u64 {
        5_000
    }

    const fn default_retry_count() -> u32 {
        20
    }

    const fn default_retry_delay() -> u64 {
        3_000
    }

    const fn default_request_timeout() -> u64 {
        30_000
    }

    const fn default_frame_buffer() -> usize {
        128
    }

    /// Build a configuration from `CHATWIRE_*` environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(value: Option<String>, fallback: T) -> T {
            value.and_then(|v| v.parse().ok()).unwrap_or(fallback)
        }

        let defaults = Self::default();
        Self {
            ws_url: lookup("CHATWIRE_WS_URL").unwrap_or(defaults.ws_url),
            api_base_url: lookup("CHATWIRE_API_URL").unwrap_or(defaults.api_base_url),
            client_type: parsed(lookup("CHATWIRE_CLIENT_TYPE"), defaults.client_type),
            heartbeat_interval_ms: parsed(
                lookup("CHATWIRE_HEARTBEAT_INTERVAL_MS"),
                defaults.heartbeat_interval_ms,
            ),
            pong_timeout_ms: parsed(lookup("CHATWIRE_PONG_TIMEOUT_MS"), defaults.pong_timeout_ms),
            open_timeout_ms: parsed(lookup("CHATWIRE_OPEN_TIMEOUT_MS"), defaults.open_timeout_ms),
            close_timeout_ms: parsed(
                lookup("CHATWIRE_CLOSE_TIMEOUT_MS"),
                defaults.close_timeout_ms,
            ),
            retry_count: parsed(lookup("CHATWIRE_RETRY_COUNT"), defaults.retry_count),
            retry_delay_ms: parsed(lookup("CHATWIRE_RETRY_DELAY_MS"), defaults.retry_delay_ms),
            request_timeout_ms: parsed(
                lookup("CHATWIRE_REQUEST_TIMEOUT_MS"),
                defaults.request_timeout_ms,
            ),
            frame_buffer: parsed(lookup("CHATWIRE_FRAME_BUFFER"), defaults.frame_buffer),
        }
    }

    /// Get the heartbeat interval as a `Duration`.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get the pong timeout as a `Duration`.
    #[must_use]
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// Get the wait-until-open bound as a `Duration`.
    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Get the close acknowledgement timeout as a `Duration`.
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Get the retry delay as a `Duration`.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Get the per-attempt request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ws_url: Self::default_ws_url(),
            api_base_url: Self::default_api_base_url(),
            client_type: ClientType::default(),
            heartbeat_interval_ms: Self::default_heartbeat_interval(),
            pong_timeout_ms: Self::default_pong_timeout(),
            open_timeout_ms: Self::default_open_timeout(),
            close_timeout_ms: Self::default_close_timeout(),
            retry_count: Self::default_retry_count(),
            retry_delay_ms: Self::default_retry_delay(),
            request_timeout_ms: Self::default_request_timeout(),
            frame_buffer: Self::default_frame_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.pong_timeout(), Duration::from_secs(10));
        assert_eq!(config.open_timeout(), Duration::from_secs(8));
        assert_eq!(config.retry_count, 20);
        assert_eq!(config.retry_delay(), Duration::from_secs(3));
        assert_eq!(config.client_type, ClientType::WechatMp);
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"ws_url":"ws://localhost:9000/ws","retry_count":3}"#)
                .unwrap();
        assert_eq!(config.ws_url, "ws://localhost:9000/ws");
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.pong_timeout_ms, 10_000);
    }

    #[test]
    fn env_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("CHATWIRE_WS_URL", "ws://127.0.0.1:1/ws"),
            ("CHATWIRE_CLIENT_TYPE", "app"),
            ("CHATWIRE_PONG_TIMEOUT_MS", "250"),
            ("CHATWIRE_RETRY_COUNT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = TransportConfig::from_lookup(|k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.ws_url, "ws://127.0.0.1:1/ws");
        assert_eq!(config.client_type, ClientType::App);
        assert_eq!(config.pong_timeout(), Duration::from_millis(250));
        assert_eq!(config.retry_count, 20);
    }
}
