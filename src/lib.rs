//! peerlink - WebRTC data channel negotiation over a WebSocket signaling server
//!
//! A [`client::SignalingClient`] connects to a signaling server, negotiates a
//! peer connection (either fully in-process or with a remote peer relayed
//! through the server) and exposes a text/binary data channel.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod transport;
pub mod webrtc;

pub use error::{AppError, Result};
