//! Event types
//!
//! [`StatusEvent`] is what the status display and log view consume.
//! [`SessionEvent`] is the per-session stream the coordinator reports on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::webrtc::config::Topology;
use crate::webrtc::data_channel::{ChannelDirection, ReadyState};
use crate::webrtc::engine::ChannelPayload;
use crate::webrtc::peer::PeerRole;
use crate::webrtc::signaling::{ConnectionState, SignalingState};

/// Human-readable status updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StatusEvent {
    /// Signaling connection label, e.g. "Signaling Server: Connected"
    #[serde(rename = "signal.status")]
    SignalStatus { text: String },

    /// One line of the running log
    #[serde(rename = "log.line")]
    LogLine { at: DateTime<Utc>, line: String },
}

impl StatusEvent {
    pub fn signal(text: impl Into<String>) -> Self {
        StatusEvent::SignalStatus { text: text.into() }
    }

    pub fn line(line: impl Into<String>) -> Self {
        StatusEvent::LogLine {
            at: Utc::now(),
            line: line.into(),
        }
    }
}

/// Negotiation and data channel notifications, per session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    NegotiationStarted {
        session_id: String,
        topology: Topology,
    },
    /// Offer/answer exchange finished on our side(s)
    NegotiationComplete { session_id: String },
    NegotiationFailed { session_id: String, reason: String },
    SignalingStateChanged {
        session_id: String,
        role: PeerRole,
        state: SignalingState,
    },
    ConnectionStateChanged {
        session_id: String,
        role: PeerRole,
        state: ConnectionState,
    },
    ChannelOpened {
        session_id: String,
        label: String,
        direction: ChannelDirection,
    },
    ChannelMessage {
        session_id: String,
        label: String,
        direction: ChannelDirection,
        payload: ChannelPayload,
    },
    ChannelClosed {
        session_id: String,
        label: String,
        direction: ChannelDirection,
    },
    SessionClosed { session_id: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::NegotiationStarted { session_id, .. }
            | SessionEvent::NegotiationComplete { session_id }
            | SessionEvent::NegotiationFailed { session_id, .. }
            | SessionEvent::SignalingStateChanged { session_id, .. }
            | SessionEvent::ConnectionStateChanged { session_id, .. }
            | SessionEvent::ChannelOpened { session_id, .. }
            | SessionEvent::ChannelMessage { session_id, .. }
            | SessionEvent::ChannelClosed { session_id, .. }
            | SessionEvent::SessionClosed { session_id } => session_id,
        }
    }

    /// Status line for the log view
    pub fn describe(&self) -> String {
        match self {
            SessionEvent::NegotiationStarted {
                session_id,
                topology,
            } => format!("Session {}: negotiating ({})", short(session_id), topology),
            SessionEvent::NegotiationComplete { session_id } => {
                format!("Session {}: negotiation complete", short(session_id))
            }
            SessionEvent::NegotiationFailed { session_id, reason } => {
                format!("Session {}: negotiation failed: {}", short(session_id), reason)
            }
            SessionEvent::SignalingStateChanged {
                session_id,
                role,
                state,
            } => format!("Session {}: {} signaling {}", short(session_id), role, state),
            SessionEvent::ConnectionStateChanged {
                session_id,
                role,
                state,
            } => format!(
                "Session {}: {} ICE connection {}",
                short(session_id),
                role,
                state
            ),
            SessionEvent::ChannelOpened { label, direction, .. } => {
                format!("{} channel '{}' open.", direction, label)
            }
            SessionEvent::ChannelMessage { payload, .. } => {
                format!("Received: {}", payload.to_text_lossy())
            }
            SessionEvent::ChannelClosed { label, direction, .. } => {
                format!("{} channel '{}' closed.", direction, label)
            }
            SessionEvent::SessionClosed { session_id } => {
                format!("Session {}: closed", short(session_id))
            }
        }
    }
}

/// Ready-state snapshot of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub label: String,
    pub direction: ChannelDirection,
    pub state: ReadyState,
}

fn short(session_id: &str) -> &str {
    match session_id.char_indices().nth(8) {
        Some((end, _)) => &session_id[..end],
        None => session_id,
    }
}
