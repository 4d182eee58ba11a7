//! Capability set the negotiation layer drives
//!
//! The coordinator never touches the WebRTC library directly. It talks to a
//! [`RtcEngine`] per peer handle and a [`RtcChannel`] per data channel, and it
//! receives everything the engine reports asynchronously as [`EngineEvent`]s
//! on a single ordered inbox per handle.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::signaling::{ConnectionState, IceCandidate, SessionDescription};
use crate::error::Result;

/// One data channel frame, with its frame type carried explicitly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

impl ChannelPayload {
    pub fn len(&self) -> usize {
        match self {
            ChannelPayload::Text(s) => s.len(),
            ChannelPayload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ChannelPayload::Text(_))
    }

    /// Text view of the frame; binary frames are decoded as UTF-8 (lossy)
    pub fn to_text_lossy(&self) -> String {
        match self {
            ChannelPayload::Text(s) => s.clone(),
            ChannelPayload::Binary(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ChannelPayload::Text(s) => s.as_bytes(),
            ChannelPayload::Binary(b) => b,
        }
    }
}

impl From<&str> for ChannelPayload {
    fn from(s: &str) -> Self {
        ChannelPayload::Text(s.to_string())
    }
}

impl From<String> for ChannelPayload {
    fn from(s: String) -> Self {
        ChannelPayload::Text(s)
    }
}

impl From<Vec<u8>> for ChannelPayload {
    fn from(data: Vec<u8>) -> Self {
        ChannelPayload::Binary(Bytes::from(data))
    }
}

impl From<Bytes> for ChannelPayload {
    fn from(data: Bytes) -> Self {
        ChannelPayload::Binary(data)
    }
}

/// Asynchronous notifications from the engine for one peer connection
pub enum EngineEvent {
    /// Locally gathered candidate; `None` marks the end of gathering
    IceCandidate(Option<IceCandidate>),
    ConnectionState(ConnectionState),
    /// The remote opened a data channel (responder side)
    DataChannel(Arc<dyn RtcChannel>),
    ChannelOpen { label: String },
    ChannelClose { label: String },
    ChannelMessage { label: String, payload: ChannelPayload },
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            EngineEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            EngineEvent::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
            EngineEvent::ChannelOpen { label } => {
                f.debug_struct("ChannelOpen").field("label", label).finish()
            }
            EngineEvent::ChannelClose { label } => {
                f.debug_struct("ChannelClose").field("label", label).finish()
            }
            EngineEvent::ChannelMessage { label, payload } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("len", &payload.len())
                .finish(),
        }
    }
}

/// Sender half of a handle's engine inbox
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Peer connection operations; each completes when the engine is done
#[async_trait]
pub trait RtcEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Open a channel; open/close/message notifications arrive on the inbox
    async fn create_data_channel(&self, label: &str, ordered: bool)
        -> Result<Arc<dyn RtcChannel>>;
    async fn close(&self) -> Result<()>;
}

/// Data channel operations
#[async_trait]
pub trait RtcChannel: Send + Sync {
    fn label(&self) -> String;
    async fn send(&self, payload: &ChannelPayload) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates engine instances, one per peer handle
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, session_id: &str, events: EngineEventSender)
        -> Result<Arc<dyn RtcEngine>>;
}
