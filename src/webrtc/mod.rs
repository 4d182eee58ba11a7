//! WebRTC negotiation and data channels
//!
//! Architecture:
//! ```text
//! SignalingTransport (WebSocket)
//!        |  offer / answer / candidate / bye
//!        v
//! NegotiationCoordinator ---- loopback: both handles in-process
//!        |
//!        v
//! PeerConnectionHandle --- RtcEngine (webrtc-rs or mock)
//!        |
//!        +------- DataChannelEndpoint (Send / Receive)
//! ```

pub mod config;
pub mod data_channel;
pub mod engine;
#[cfg(test)]
pub(crate) mod mock;
pub mod native;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{MdnsMode, Topology, WebRtcConfig};
pub use data_channel::{ChannelDirection, DataChannelEndpoint, ReadyState};
pub use engine::{ChannelPayload, EngineEvent, EngineFactory, RtcChannel, RtcEngine};
pub use native::{NativeEngine, NativeEngineFactory};
pub use peer::{CandidateDisposition, PeerConnectionHandle, PeerRole};
pub use session::{CoordinatorOutput, NegotiationCoordinator, SessionInfo};
pub use signaling::{
    ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingMessage, SignalingState,
};
