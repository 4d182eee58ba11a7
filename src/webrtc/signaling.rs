//! WebRTC signaling types and messages

use serde::{Deserialize, Serialize};

/// Reserved liveness probe accepted by the signaling server
pub const LIVENESS_PROBE: &str = "Unity-Ping";

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// Session description; the SDP body is owned by the engine and never inspected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }

    /// Empty candidate string is the "no candidate" sentinel
    pub fn is_empty(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Signaling message exchanged over the transport in relay topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// SDP offer from the initiator
    Offer { session_id: String, sdp: String },
    /// SDP answer from the responder
    Answer { session_id: String, sdp: String },
    /// Trickled ICE candidate
    Candidate {
        session_id: String,
        #[serde(flatten)]
        candidate: IceCandidate,
    },
    /// Session closed by the peer
    Bye { session_id: String },
    /// Peer reported an error
    Error(SignalingError),
}

impl SignalingMessage {
    /// Parse a transport frame; `None` for anything that is not a signaling payload
    pub fn parse(text: &str) -> Option<Self> {
        if !text.trim_start().starts_with('{') {
            return None;
        }
        serde_json::from_str(text).ok()
    }

    pub fn to_text(&self) -> String {
        // Serializing these plain structs cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::Answer { session_id, .. }
            | SignalingMessage::Candidate { session_id, .. }
            | SignalingMessage::Bye { session_id } => Some(session_id),
            SignalingMessage::Error(_) => None,
        }
    }
}

/// Signaling error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingError {
    /// Error code
    pub code: u32,
    /// Error message
    pub message: String,
}

impl SignalingError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown_session(session_id: &str) -> Self {
        Self::new(404, format!("Unknown session {}", session_id))
    }

    pub fn negotiation_failed(reason: impl Into<String>) -> Self {
        Self::new(500, reason)
    }
}

/// Offer/answer state of one peer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingState::New => write!(f, "new"),
            SignalingState::HaveLocalOffer => write!(f, "have-local-offer"),
            SignalingState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            SignalingState::Stable => write!(f, "stable"),
            SignalingState::Closed => write!(f, "closed"),
        }
    }
}

/// Connection state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}
