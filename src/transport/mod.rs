//! Signaling transport
//!
//! A text-message channel to the signaling server. The transport knows nothing
//! about what it carries; events come out in the order they happened on the
//! socket: `Open` first, `Close` last, once per connection.

mod websocket;

#[cfg(test)]
pub(crate) mod test_server;

pub use websocket::SignalingTransport;

use serde::Serialize;

/// Transport notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Close(String),
}

/// Connection state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Disconnected => write!(f, "disconnected"),
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
        }
    }
}
