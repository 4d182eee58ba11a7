//! Peer connection handle: one negotiation endpoint's lifecycle
//!
//! The handle owns the offer/answer state machine and the ICE candidate
//! queue; the engine behind it only ever sees operations that are legal in
//! the current state.
//!
//! ```text
//! New ──offer(local)──> HaveLocalOffer ──answer(remote)──┐
//!  │                                                     v
//!  └──offer(remote)──> HaveRemoteOffer ──answer(local)─> Stable
//!
//! any state ──close()──> Closed
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::data_channel::{ChannelDirection, DataChannelEndpoint};
use super::engine::{EngineEvent, RtcChannel, RtcEngine};
use super::signaling::{
    ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState,
};
use crate::error::{AppError, Result};
use crate::events::SessionEvent;

/// Which side of the offer/answer exchange a handle plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Creates the data channel and the offer
    Initiator,
    /// Receives the offer and answers
    Responder,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Initiator => write!(f, "local"),
            PeerRole::Responder => write!(f, "remote"),
        }
    }
}

/// What happened to a candidate handed to [`PeerConnectionHandle::add_ice_candidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Passed to the engine
    Applied,
    /// Held until the remote description is applied
    Queued,
    /// Empty sentinel, dropped
    Filtered,
    /// Handle already torn down
    Ignored,
}

#[derive(Debug)]
struct HandleState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// A description is being applied by the engine right now
    local_in_flight: bool,
    remote_in_flight: bool,
    /// Remote description applied and queue drained; candidates go straight through
    remote_applied: bool,
    pending: Vec<IceCandidate>,
    channels: Vec<Arc<DataChannelEndpoint>>,
    /// No further operations are accepted
    released: bool,
    /// Channels and engine have been closed
    torn_down: bool,
}

/// Peer connection handle
pub struct PeerConnectionHandle {
    session_id: String,
    role: PeerRole,
    engine: Arc<dyn RtcEngine>,
    inner: Mutex<HandleState>,
    signaling_tx: watch::Sender<SignalingState>,
    connection_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerConnectionHandle {
    pub fn new(
        session_id: impl Into<String>,
        role: PeerRole,
        engine: Arc<dyn RtcEngine>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let (signaling_tx, _) = watch::channel(SignalingState::New);
        let (connection_tx, _) = watch::channel(ConnectionState::New);

        Arc::new(Self {
            session_id: session_id.into(),
            role,
            engine,
            inner: Mutex::new(HandleState {
                signaling: SignalingState::New,
                local: None,
                remote: None,
                local_in_flight: false,
                remote_in_flight: false,
                remote_applied: false,
                pending: Vec::new(),
                channels: Vec::new(),
                released: false,
                torn_down: false,
            }),
            signaling_tx,
            connection_tx,
            events,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.inner.lock().signaling
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_tx.borrow()
    }

    /// Subscribe to signaling state changes
    pub fn signaling_watch(&self) -> watch::Receiver<SignalingState> {
        self.signaling_tx.subscribe()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    /// Candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn channels(&self) -> Vec<Arc<DataChannelEndpoint>> {
        self.inner.lock().channels.clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<DataChannelEndpoint>> {
        self.inner
            .lock()
            .channels
            .iter()
            .find(|c| c.label() == label)
            .cloned()
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    fn check_active(&self, state: &HandleState, op: &str) -> Result<()> {
        if state.released {
            return Err(AppError::SessionClosed(format!(
                "{} on {} peer of session {}",
                op, self.role, self.session_id
            )));
        }
        Ok(())
    }

    fn step_failed(&self, op: &str, e: AppError) -> AppError {
        warn!(
            "{} peer {}: {} failed: {}",
            self.role, self.session_id, op, e
        );
        AppError::NegotiationFailed(format!("{}: {}", op, e))
    }

    fn publish_signaling(&self, state: SignalingState) {
        self.signaling_tx.send_replace(state);
        info!(
            "{} peer {} signaling state: {}",
            self.role, self.session_id, state
        );
        let _ = self.events.send(SessionEvent::SignalingStateChanged {
            session_id: self.session_id.clone(),
            role: self.role,
            state,
        });
    }

    /// Create an offer (initiator only, before any answer)
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        {
            let state = self.inner.lock();
            self.check_active(&state, "create offer")?;
            if self.role != PeerRole::Initiator {
                return Err(AppError::InvalidState(
                    "only the initiating side creates offers".to_string(),
                ));
            }
            if !matches!(
                state.signaling,
                SignalingState::New | SignalingState::HaveLocalOffer
            ) {
                return Err(AppError::InvalidState(format!(
                    "cannot create offer in state {}",
                    state.signaling
                )));
            }
        }

        let offer = self
            .engine
            .create_offer()
            .await
            .map_err(|e| self.step_failed("create offer", e))?;

        self.check_active(&self.inner.lock(), "create offer")?;
        debug!("{} peer {} created offer", self.role, self.session_id);
        Ok(offer)
    }

    /// Create an answer to the remote offer
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        {
            let state = self.inner.lock();
            self.check_active(&state, "create answer")?;
            if state.signaling != SignalingState::HaveRemoteOffer {
                return Err(AppError::InvalidState(format!(
                    "cannot create answer in state {}",
                    state.signaling
                )));
            }
        }

        let answer = self
            .engine
            .create_answer()
            .await
            .map_err(|e| self.step_failed("create answer", e))?;

        self.check_active(&self.inner.lock(), "create answer")?;
        debug!("{} peer {} created answer", self.role, self.session_id);
        Ok(answer)
    }

    fn next_after_local(&self, current: SignalingState, kind: SdpType) -> Option<SignalingState> {
        match (current, kind, self.role) {
            (SignalingState::New, SdpType::Offer, PeerRole::Initiator) => {
                Some(SignalingState::HaveLocalOffer)
            }
            (SignalingState::HaveRemoteOffer, SdpType::Answer, _) => Some(SignalingState::Stable),
            _ => None,
        }
    }

    fn next_after_remote(&self, current: SignalingState, kind: SdpType) -> Option<SignalingState> {
        match (current, kind, self.role) {
            (SignalingState::New, SdpType::Offer, PeerRole::Responder) => {
                Some(SignalingState::HaveRemoteOffer)
            }
            (SignalingState::HaveLocalOffer, SdpType::Answer, _) => Some(SignalingState::Stable),
            _ => None,
        }
    }

    /// Apply our own description. Starts ICE gathering in the engine.
    pub async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let next = {
            let mut state = self.inner.lock();
            self.check_active(&state, "set local description")?;
            if state.local.is_some() || state.local_in_flight {
                return Err(AppError::InvalidState(
                    "local description already set".to_string(),
                ));
            }
            let next = self.next_after_local(state.signaling, desc.kind).ok_or_else(|| {
                AppError::InvalidState(format!(
                    "cannot apply local {} in state {}",
                    desc.kind, state.signaling
                ))
            })?;
            state.local_in_flight = true;
            next
        };

        if let Err(e) = self.engine.set_local_description(desc.clone()).await {
            self.inner.lock().local_in_flight = false;
            return Err(self.step_failed("set local description", e));
        }

        {
            let mut state = self.inner.lock();
            state.local_in_flight = false;
            self.check_active(&state, "set local description")?;
            state.local = Some(desc);
            state.signaling = next;
        }
        self.publish_signaling(next);
        Ok(())
    }

    /// Apply the peer's description, then flush queued candidates in order
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let next = {
            let mut state = self.inner.lock();
            self.check_active(&state, "set remote description")?;
            if state.remote.is_some() || state.remote_in_flight {
                return Err(AppError::InvalidState(
                    "remote description already set".to_string(),
                ));
            }
            let next = self.next_after_remote(state.signaling, desc.kind).ok_or_else(|| {
                AppError::InvalidState(format!(
                    "cannot apply remote {} in state {}",
                    desc.kind, state.signaling
                ))
            })?;
            state.remote_in_flight = true;
            next
        };

        if let Err(e) = self.engine.set_remote_description(desc.clone()).await {
            self.inner.lock().remote_in_flight = false;
            return Err(self.step_failed("set remote description", e));
        }

        {
            let mut state = self.inner.lock();
            state.remote_in_flight = false;
            self.check_active(&state, "set remote description")?;
            state.remote = Some(desc);
            state.signaling = next;
        }
        self.publish_signaling(next);

        self.flush_pending_candidates().await
    }

    async fn flush_pending_candidates(&self) -> Result<()> {
        loop {
            // Anything arriving while a batch is applied lands in the queue and
            // goes out with the next batch, keeping submission order.
            let batch = {
                let mut state = self.inner.lock();
                self.check_active(&state, "apply queued candidates")?;
                if state.pending.is_empty() {
                    state.remote_applied = true;
                    return Ok(());
                }
                std::mem::take(&mut state.pending)
            };

            debug!(
                "{} peer {}: applying {} queued ICE candidates",
                self.role,
                self.session_id,
                batch.len()
            );
            for candidate in batch {
                if let Err(e) = self.engine.add_ice_candidate(candidate).await {
                    warn!(
                        "{} peer {}: queued ICE candidate rejected: {}",
                        self.role, self.session_id, e
                    );
                }
            }
        }
    }

    /// Add a remote ICE candidate
    ///
    /// Empty candidates are filtered. Before the remote description is applied
    /// the candidate is queued. Engine rejections come back as
    /// `InvalidCandidate` and are not fatal.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<CandidateDisposition> {
        if candidate.is_empty() {
            debug!(
                "{} peer {}: ignoring empty ICE candidate",
                self.role, self.session_id
            );
            return Ok(CandidateDisposition::Filtered);
        }

        {
            let mut state = self.inner.lock();
            if state.released {
                debug!(
                    "{} peer {} released, dropping ICE candidate",
                    self.role, self.session_id
                );
                return Ok(CandidateDisposition::Ignored);
            }
            if !state.remote_applied {
                debug!(
                    "{} peer {}: queueing ICE candidate until remote description is set",
                    self.role, self.session_id
                );
                state.pending.push(candidate);
                return Ok(CandidateDisposition::Queued);
            }
        }

        debug!(
            "{} peer {} ICE candidate: {}",
            self.role, self.session_id, candidate.candidate
        );
        self.engine
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| AppError::InvalidCandidate(e.to_string()))?;
        Ok(CandidateDisposition::Applied)
    }

    /// Open a data channel (initiator side, before the offer is created)
    pub async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<DataChannelEndpoint>> {
        {
            let state = self.inner.lock();
            self.check_active(&state, "create data channel")?;
            if state.channels.iter().any(|c| c.label() == label) {
                return Err(AppError::InvalidState(format!(
                    "data channel '{}' already exists",
                    label
                )));
            }
        }

        let channel = self
            .engine
            .create_data_channel(label, ordered)
            .await
            .map_err(|e| self.step_failed("create data channel", e))?;
        let endpoint = DataChannelEndpoint::new(
            self.session_id.clone(),
            ChannelDirection::Send,
            channel,
            self.events.clone(),
        );

        let released = {
            let mut state = self.inner.lock();
            if !state.released {
                state.channels.push(endpoint.clone());
            }
            state.released
        };
        if released {
            endpoint.close().await;
            return Err(AppError::SessionClosed(self.session_id.clone()));
        }

        info!("Data channel '{}' created (session {})", label, self.session_id);
        Ok(endpoint)
    }

    /// Take ownership of a channel the remote opened
    pub async fn adopt_remote_channel(
        &self,
        channel: Arc<dyn RtcChannel>,
    ) -> Option<Arc<DataChannelEndpoint>> {
        let endpoint = DataChannelEndpoint::new(
            self.session_id.clone(),
            ChannelDirection::Receive,
            channel,
            self.events.clone(),
        );

        let released = {
            let mut state = self.inner.lock();
            if !state.released {
                state.channels.push(endpoint.clone());
            }
            state.released
        };
        if released {
            debug!(
                "Closing data channel '{}' surfaced after teardown",
                endpoint.label()
            );
            endpoint.close().await;
            return None;
        }

        info!(
            "Received remote data channel '{}' (session {})",
            endpoint.label(),
            self.session_id
        );
        Some(endpoint)
    }

    /// Record an ICE connection state reported by the engine
    pub fn set_connection_state(&self, state: ConnectionState) {
        let changed = self.connection_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!(
                "{} peer {} ICE connection state: {}",
                self.role, self.session_id, state
            );
            let _ = self.events.send(SessionEvent::ConnectionStateChanged {
                session_id: self.session_id.clone(),
                role: self.role,
                state,
            });
        }
    }

    /// Apply an engine notification that concerns this handle only
    ///
    /// Candidate events are routing decisions and belong to the caller.
    pub async fn apply_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::IceCandidate(_) => {}
            EngineEvent::ConnectionState(state) => self.set_connection_state(state),
            EngineEvent::DataChannel(channel) => {
                self.adopt_remote_channel(channel).await;
            }
            EngineEvent::ChannelOpen { label } => match self.channel(&label) {
                Some(endpoint) => {
                    endpoint.mark_open();
                }
                None => debug!("Open event for unknown channel '{}'", label),
            },
            EngineEvent::ChannelClose { label } => {
                if let Some(endpoint) = self.channel(&label) {
                    endpoint.mark_closed();
                }
            }
            EngineEvent::ChannelMessage { label, payload } => match self.channel(&label) {
                Some(endpoint) => {
                    endpoint.deliver(payload);
                }
                None => debug!(
                    "Dropping {} byte frame for unknown channel '{}'",
                    payload.len(),
                    label
                ),
            },
        }
    }

    /// Close the handle. Idempotent; returns true only for the call that tore down.
    pub async fn close(&self) -> bool {
        let changed = {
            let mut state = self.inner.lock();
            state.released = true;
            if state.signaling == SignalingState::Closed {
                false
            } else {
                state.signaling = SignalingState::Closed;
                true
            }
        };
        if changed {
            self.publish_signaling(SignalingState::Closed);
        }
        self.teardown().await
    }

    /// Stop the handle without moving its signaling state
    ///
    /// Used when the signaling transport goes away: the handle keeps the state
    /// negotiation had reached, its channels and engine are closed, and every
    /// later operation is refused.
    pub async fn release(&self) -> bool {
        self.inner.lock().released = true;
        self.teardown().await
    }

    async fn teardown(&self) -> bool {
        let channels = {
            let mut state = self.inner.lock();
            if state.torn_down {
                return false;
            }
            state.torn_down = true;
            state.pending.clear();
            state.channels.clone()
        };

        for channel in channels {
            channel.close().await;
        }
        if let Err(e) = self.engine.close().await {
            warn!(
                "Failed to close {} peer {}: {}",
                self.role, self.session_id, e
            );
        }
        self.set_connection_state(ConnectionState::Closed);
        info!("{} peer {} torn down", self.role, self.session_id);
        true
    }
}
