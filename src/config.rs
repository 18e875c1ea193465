use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const DEFAULT_API_BASE_URL: &str = "https://api.example-delivery.com";
const DEFAULT_WS_BASE_URL: &str = "wss://api.example-delivery.com";
const DEFAULT_ENDPOINT: &str = "ws";
const DEFAULT_REFRESH_PATH: &str = "/api/auth/refresh-token";
const DEFAULT_HEARTBEAT_MS: u64 = 4000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
const DEFAULT_REFRESH_MARGIN_SECS: i64 = 300;
const DEFAULT_LOCATION_PING_INTERVAL_MS: u64 = 5000;

/// How STOMP frames are carried inside WebSocket messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One STOMP frame per text message.
    #[default]
    Raw,
    /// SockJS envelopes (`o`, `h`, `a[...]`, `c[...]`) around the frames.
    SockJs,
}

/// Settings for the connection core.
///
/// Durations are kept as integer fields so the struct round-trips through
/// any serde format; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Base URL for REST calls (token refresh and authenticated requests).
    pub api_base_url: String,
    /// `ws://` or `wss://` origin of the message bus.
    pub ws_base_url: String,
    /// SockJS endpoint name, the `{endpoint}` in `/{endpoint}/{server}/{session}/websocket`.
    pub endpoint: String,
    pub refresh_path: String,
    pub framing: Framing,
    pub heartbeat_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub token_refresh_margin_secs: i64,
    pub location_ping_interval_ms: u64,
    /// Per-agent topic template; `{agentId}` is substituted.
    pub assignment_topic: String,
    pub order_status_topic: String,
    pub assignment_response_destination: String,
    pub location_destination: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            framing: Framing::Raw,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            token_refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            location_ping_interval_ms: DEFAULT_LOCATION_PING_INTERVAL_MS,
            assignment_topic: "/topic/delivery-agent/{agentId}/assignments".to_string(),
            order_status_topic: "/topic/delivery-agent/{agentId}/order-status".to_string(),
            assignment_response_destination: "/app/order-assignment-response".to_string(),
            location_destination: "/app/location_update".to_string(),
        }
    }
}

impl RealtimeConfig {
    /// Builds a config from `DELIVERY_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("DELIVERY_API_URL") {
            config.api_base_url = v;
        }
        if let Ok(v) = std::env::var("DELIVERY_WS_URL") {
            config.ws_base_url = v;
        }
        if let Ok(v) = std::env::var("DELIVERY_WS_ENDPOINT") {
            config.endpoint = v;
        }
        if let Ok(v) = std::env::var("DELIVERY_WS_FRAMING") {
            config.framing = match v.to_ascii_lowercase().as_str() {
                "raw" => Framing::Raw,
                "sockjs" => Framing::SockJs,
                other => {
                    return Err(RealtimeError::Config(format!(
                        "DELIVERY_WS_FRAMING must be 'raw' or 'sockjs', got '{}'",
                        other
                    )))
                }
            };
        }
        config.heartbeat_ms = env_u64("DELIVERY_HEARTBEAT_MS", config.heartbeat_ms)?;
        config.connect_timeout_ms =
            env_u64("DELIVERY_CONNECT_TIMEOUT_MS", config.connect_timeout_ms)?;
        config.reconnect_delay_ms =
            env_u64("DELIVERY_RECONNECT_DELAY_MS", config.reconnect_delay_ms)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that both base URLs parse and use the expected schemes.
    pub fn validate(&self) -> Result<()> {
        let api = Url::parse(&self.api_base_url)?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(RealtimeError::Config(format!(
                "api_base_url must be http(s), got '{}'",
                api.scheme()
            )));
        }
        let ws = Url::parse(&self.ws_base_url)?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(RealtimeError::Config(format!(
                "ws_base_url must be ws(s), got '{}'",
                ws.scheme()
            )));
        }
        if self.endpoint.trim_matches('/').is_empty() {
            return Err(RealtimeError::Config("endpoint must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn token_refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_margin_secs)
    }

    pub fn location_ping_interval(&self) -> Duration {
        Duration::from_millis(self.location_ping_interval_ms)
    }

    pub fn assignment_topic_for(&self, agent_id: &str) -> String {
        self.assignment_topic.replace("{agentId}", agent_id)
    }

    pub fn order_status_topic_for(&self, agent_id: &str) -> String {
        self.order_status_topic.replace("{agentId}", agent_id)
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(v) => v.parse::<u64>().map_err(|e| {
            RealtimeError::Config(format!("{} must be an integer: {}", name, e))
        }),
        Err(_) => Ok(default),
    }
}
