//! Data channel endpoint: ready-state tracking and send/receive gating

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::engine::{ChannelPayload, RtcChannel};
use crate::error::{AppError, Result};
use crate::events::{ChannelInfo, SessionEvent};

/// Data channel ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadyState::Connecting => write!(f, "connecting"),
            ReadyState::Open => write!(f, "open"),
            ReadyState::Closing => write!(f, "closing"),
            ReadyState::Closed => write!(f, "closed"),
        }
    }
}

/// Which side of the negotiation the channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelDirection {
    /// Created by the initiator
    Send,
    /// Surfaced to the responder by the engine
    Receive,
}

impl std::fmt::Display for ChannelDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelDirection::Send => write!(f, "Send"),
            ChannelDirection::Receive => write!(f, "Receive"),
        }
    }
}

/// One data channel's lifecycle
///
/// The observer (the session event sender) is fixed at construction, so the
/// endpoint can never receive a frame before someone is listening.
pub struct DataChannelEndpoint {
    session_id: String,
    label: String,
    direction: ChannelDirection,
    channel: Arc<dyn RtcChannel>,
    /// Authoritative ready state; transitions go through `send_if_modified`
    state: watch::Sender<ReadyState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl std::fmt::Debug for DataChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelEndpoint")
            .field("label", &self.label)
            .field("direction", &self.direction)
            .field("state", &self.ready_state())
            .finish()
    }
}

impl DataChannelEndpoint {
    pub fn new(
        session_id: impl Into<String>,
        direction: ChannelDirection,
        channel: Arc<dyn RtcChannel>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ReadyState::Connecting);
        Arc::new(Self {
            session_id: session_id.into(),
            label: channel.label(),
            direction,
            channel,
            state,
            events,
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn direction(&self) -> ChannelDirection {
        self.direction
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            label: self.label.clone(),
            direction: self.direction,
            state: self.ready_state(),
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Engine reported the channel open. Fires the open notification once.
    pub fn mark_open(&self) -> bool {
        let opened = self.state.send_if_modified(|state| {
            if *state != ReadyState::Connecting {
                return false;
            }
            *state = ReadyState::Open;
            // Emitted under the state lock so a concurrent close cannot overtake it
            let _ = self.events.send(SessionEvent::ChannelOpened {
                session_id: self.session_id.clone(),
                label: self.label.clone(),
                direction: self.direction,
            });
            true
        });

        if opened {
            info!("{} channel '{}' open", self.direction, self.label);
        }
        opened
    }

    /// Engine reported the channel closed (or teardown finished). Fires once.
    pub fn mark_closed(&self) -> bool {
        let closed = self.state.send_if_modified(|state| {
            if *state == ReadyState::Closed {
                return false;
            }
            *state = ReadyState::Closed;
            let _ = self.events.send(SessionEvent::ChannelClosed {
                session_id: self.session_id.clone(),
                label: self.label.clone(),
                direction: self.direction,
            });
            true
        });

        if closed {
            info!("{} channel '{}' closed", self.direction, self.label);
        }
        closed
    }

    /// Hand an inbound frame to the observer; dropped unless Open
    pub fn deliver(&self, payload: ChannelPayload) -> bool {
        let mut payload = Some(payload);
        let delivered = self.state.send_if_modified(|state| {
            if *state == ReadyState::Open {
                if let Some(payload) = payload.take() {
                    let _ = self.events.send(SessionEvent::ChannelMessage {
                        session_id: self.session_id.clone(),
                        label: self.label.clone(),
                        direction: self.direction,
                        payload,
                    });
                }
            }
            // Never a state change
            false
        });
        debug_assert!(!delivered);

        match payload {
            None => {
                self.frames_received.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(payload) => {
                debug!(
                    "Dropping {} byte frame on '{}' ({})",
                    payload.len(),
                    self.label,
                    self.ready_state()
                );
                false
            }
        }
    }

    /// Transmit one frame; `ChannelNotOpen` (and no frame) unless Open
    pub async fn send(&self, payload: ChannelPayload) -> Result<()> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            warn!(
                "Not sending on '{}': channel is {} (session {})",
                self.label, state, self.session_id
            );
            return Err(AppError::ChannelNotOpen(self.label.clone()));
        }

        self.channel.send(&payload).await?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        debug!("Sent {} byte frame on '{}'", payload.len(), self.label);
        Ok(())
    }

    /// Close the channel. Returns false if it was already closing or closed.
    pub async fn close(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state >= ReadyState::Closing {
                return false;
            }
            *state = ReadyState::Closing;
            true
        });
        if !started {
            return false;
        }

        if let Err(e) = self.channel.close().await {
            warn!("Failed to close data channel '{}': {}", self.label, e);
        }
        self.mark_closed();
        true
    }
}
