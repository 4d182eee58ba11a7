//! WebRTC configuration

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use webrtc::ice::mdns::MulticastDnsMode;

/// Environment variable overriding [`WebRtcConfig::mdns_mode`]
pub const MDNS_MODE_ENV: &str = "PEERLINK_WEBRTC_MDNS_MODE";

/// Where the two ends of a negotiation live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Both peer handles live in this process and exchange descriptions directly
    #[default]
    Loopback,
    /// One handle per process; offer/answer/candidates travel over the signaling transport
    Relay,
}

impl FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loopback" | "local" => Ok(Topology::Loopback),
            "relay" | "remote" => Ok(Topology::Relay),
            other => Err(format!("unknown topology '{}'", other)),
        }
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Loopback => write!(f, "loopback"),
            Topology::Relay => write!(f, "relay"),
        }
    }
}

/// mDNS behaviour of the ICE agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MdnsMode {
    Disabled,
    /// Resolve `.local` candidates from the remote, never gather our own
    #[default]
    QueryOnly,
    QueryAndGather,
}

impl FromStr for MdnsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "false" | "0" => Ok(MdnsMode::Disabled),
            "query" | "query_only" | "query-only" => Ok(MdnsMode::QueryOnly),
            "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
                Ok(MdnsMode::QueryAndGather)
            }
            other => Err(format!("unknown mdns mode '{}'", other)),
        }
    }
}

impl From<MdnsMode> for MulticastDnsMode {
    fn from(mode: MdnsMode) -> Self {
        match mode {
            MdnsMode::Disabled => MulticastDnsMode::Disabled,
            MdnsMode::QueryOnly => MulticastDnsMode::QueryOnly,
            MdnsMode::QueryAndGather => MulticastDnsMode::QueryAndGather,
        }
    }
}

impl MdnsMode {
    /// Mode from [`MDNS_MODE_ENV`], if set to something recognisable
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(MDNS_MODE_ENV).ok()?;
        if raw.trim().is_empty() {
            return None;
        }
        raw.parse().ok()
    }

    /// Host name advertised when gathering mDNS candidates
    pub fn host_name(session_id: &str) -> String {
        format!("{session_id}.local")
    }
}

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs, handed to the engine verbatim
    pub stun_servers: Vec<String>,
    /// Label of the data channel the initiator opens
    pub data_channel_label: String,
    /// Ordered delivery on the data channel
    pub ordered: bool,
    /// Same-process pair or relayed through the signaling server
    pub topology: Topology,
    /// Upper bound for the whole offer/answer pipeline (ms)
    pub negotiation_timeout_ms: u64,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// Gather 127.0.0.1 host candidates (needed for single-host setups)
    pub include_loopback_candidates: bool,
    /// mDNS candidate handling
    pub mdns_mode: MdnsMode,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough for local peers
            stun_servers: vec![],
            data_channel_label: "sendChannel".to_string(),
            ordered: true,
            topology: Topology::Loopback,
            negotiation_timeout_ms: 10_000,
            max_sessions: 8,
            include_loopback_candidates: false,
            mdns_mode: MdnsMode::QueryOnly,
        }
    }
}

impl WebRtcConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Effective mDNS mode, environment first
    pub fn effective_mdns_mode(&self) -> MdnsMode {
        MdnsMode::from_env().unwrap_or(self.mdns_mode)
    }
}
