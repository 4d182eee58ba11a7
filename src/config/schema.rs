use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::webrtc::config::WebRtcConfig;

/// Default signaling server address
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling transport settings
    pub signaling: SignalingConfig,
    /// Peer connection and negotiation settings
    pub webrtc: WebRtcConfig,
}

/// Signaling transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling server
    pub url: String,
    /// Give up on the WebSocket handshake after this long (ms)
    pub connect_timeout_ms: u64,
    /// Start a negotiation as soon as the transport opens. Relay peers that
    /// only answer offers turn this off.
    pub negotiate_on_open: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
            connect_timeout_ms: 5_000,
            negotiate_on_open: true,
        }
    }
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
