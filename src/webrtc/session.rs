//! Negotiation sessions
//!
//! A session is one negotiation: in loopback topology a pair of handles in
//! this process, in relay topology a single local handle whose peer is reached
//! through signaling messages. Every handle gets one engine inbox drained by
//! one pump task; the offer/answer pipeline runs in its own task under the
//! negotiation timeout and the session's cancellation token.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{Topology, WebRtcConfig};
use super::engine::{ChannelPayload, EngineEvent, EngineFactory};
use super::peer::{PeerConnectionHandle, PeerRole};
use super::signaling::{
    ConnectionState, IceCandidate, SessionDescription, SignalingError, SignalingMessage,
    SignalingState,
};
use crate::error::{AppError, Result};
use crate::events::{ChannelInfo, SessionEvent};

/// Session snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub topology: Topology,
    pub role: PeerRole,
    pub signaling: SignalingState,
    pub connection: ConnectionState,
    pub channels: Vec<ChannelInfo>,
    pub created_at: DateTime<Utc>,
}

/// Receivers for everything the coordinator reports
pub struct CoordinatorOutput {
    /// Negotiation and data channel events, all sessions
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Relay messages to put on the signaling transport
    pub signaling: mpsc::UnboundedReceiver<SignalingMessage>,
}

struct Session {
    id: String,
    topology: Topology,
    local: Arc<PeerConnectionHandle>,
    /// Responder handle, loopback only
    remote: Option<Arc<PeerConnectionHandle>>,
    cancel: CancellationToken,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    /// Relay initiator waiting for the answer
    answer_tx: Mutex<Option<oneshot::Sender<SessionDescription>>>,
    /// Relay: our description went out, candidates may follow
    announced: watch::Sender<bool>,
    created_at: DateTime<Utc>,
}

impl Session {
    fn handles(&self) -> impl Iterator<Item = &Arc<PeerConnectionHandle>> {
        std::iter::once(&self.local).chain(self.remote.iter())
    }

    fn info(&self) -> SessionInfo {
        let channels = self
            .handles()
            .flat_map(|h| h.channels())
            .map(|c| c.info())
            .collect();
        SessionInfo {
            session_id: self.id.clone(),
            topology: self.topology,
            role: self.local.role(),
            signaling: self.local.signaling_state(),
            connection: self.local.connection_state(),
            channels,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    /// Handles move to Closed; relay peers get a `bye`
    Close { notify_peer: bool },
    /// Transport went away; handles keep their signaling state
    Release,
}

/// Where a handle's locally gathered candidates go
enum CandidateRoute {
    /// Loopback: straight into the other handle
    Peer(Arc<PeerConnectionHandle>),
    /// Relay: out over the transport once our description is announced
    Relay {
        session_id: String,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        announced: watch::Receiver<bool>,
        held: Vec<IceCandidate>,
    },
}

impl CandidateRoute {
    async fn forward(&mut self, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate else {
            debug!("ICE gathering complete");
            return;
        };

        match self {
            CandidateRoute::Peer(peer) => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!("ICE candidate rejected by peer handle: {}", e);
                }
            }
            CandidateRoute::Relay {
                session_id,
                outbound,
                announced,
                held,
            } => {
                if candidate.is_empty() {
                    return;
                }
                if *announced.borrow() {
                    send_candidate(outbound, session_id, candidate);
                } else {
                    held.push(candidate);
                }
            }
        }
    }

    /// Resolves when held candidates may be released; never for loopback
    async fn released(&mut self) {
        if let CandidateRoute::Relay {
            announced, held, ..
        } = self
        {
            if *announced.borrow_and_update() {
                if !held.is_empty() {
                    return;
                }
            } else if announced.changed().await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }

    fn flush(&mut self) {
        if let CandidateRoute::Relay {
            session_id,
            outbound,
            announced,
            held,
        } = self
        {
            if *announced.borrow() {
                for candidate in held.drain(..) {
                    send_candidate(outbound, session_id, candidate);
                }
            }
        }
    }
}

fn send_candidate(
    outbound: &mpsc::UnboundedSender<SignalingMessage>,
    session_id: &str,
    candidate: IceCandidate,
) {
    debug!("Relaying ICE candidate: {}", candidate.candidate);
    let _ = outbound.send(SignalingMessage::Candidate {
        session_id: session_id.to_string(),
        candidate,
    });
}

enum PumpStep {
    Event(EngineEvent),
    Released,
    Stop,
}

/// Drain one handle's engine inbox in order until the session is cancelled
async fn pump(
    handle: Arc<PeerConnectionHandle>,
    mut inbox: mpsc::UnboundedReceiver<EngineEvent>,
    mut route: CandidateRoute,
    cancel: CancellationToken,
) {
    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => PumpStep::Stop,
            _ = route.released() => PumpStep::Released,
            event = inbox.recv() => event.map(PumpStep::Event).unwrap_or(PumpStep::Stop),
        };

        match step {
            PumpStep::Stop => break,
            PumpStep::Released => route.flush(),
            PumpStep::Event(EngineEvent::IceCandidate(candidate)) => route.forward(candidate).await,
            PumpStep::Event(event) => handle.apply_engine_event(event).await,
        }
    }
    debug!(
        "Engine pump for {} peer {} stopped",
        handle.role(),
        handle.session_id()
    );
}

/// Negotiation coordinator
///
/// Owns every session, keyed by id.
pub struct NegotiationCoordinator {
    config: WebRtcConfig,
    factory: Arc<dyn EngineFactory>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Session ids, oldest first
    order: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
}

impl NegotiationCoordinator {
    pub fn new(
        config: WebRtcConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> (Arc<Self>, CoordinatorOutput) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (outbound_tx, signaling) = mpsc::unbounded_channel();

        let coordinator = Arc::new(Self {
            config,
            factory,
            sessions: RwLock::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            events: events_tx,
            outbound: outbound_tx,
        });

        (coordinator, CoordinatorOutput { events, signaling })
    }

    pub fn config(&self) -> &WebRtcConfig {
        &self.config
    }

    pub fn topology(&self) -> Topology {
        self.config.topology
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn ensure_capacity(&self) -> Result<()> {
        if self.sessions.read().await.len() >= self.config.max_sessions {
            return Err(AppError::InvalidState(format!(
                "Maximum sessions ({}) reached",
                self.config.max_sessions
            )));
        }
        Ok(())
    }

    async fn new_handle(
        &self,
        session_id: &str,
        role: PeerRole,
    ) -> Result<(Arc<PeerConnectionHandle>, mpsc::UnboundedReceiver<EngineEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.factory.create(session_id, tx).await?;
        let handle = PeerConnectionHandle::new(session_id, role, engine, self.events.clone());
        Ok((handle, rx))
    }

    fn relay_route(&self, session_id: &str, announced: &watch::Sender<bool>) -> CandidateRoute {
        CandidateRoute::Relay {
            session_id: session_id.to_string(),
            outbound: self.outbound.clone(),
            announced: announced.subscribe(),
            held: Vec::new(),
        }
    }

    /// Insert unless full; a rejected session is released
    async fn register(&self, session: Arc<Session>) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() < self.config.max_sessions && !sessions.contains_key(&session.id) {
                sessions.insert(session.id.clone(), session.clone());
                self.order.lock().push(session.id.clone());
                drop(sessions);

                info!("Session created: {} ({})", session.id, session.topology);
                self.emit(SessionEvent::NegotiationStarted {
                    session_id: session.id.clone(),
                    topology: session.topology,
                });
                return Ok(());
            }
        }

        session.cancel.cancel();
        for handle in session.handles() {
            handle.release().await;
        }
        Err(AppError::InvalidState(format!(
            "Cannot register session {}: limit of {} reached or id in use",
            session.id, self.config.max_sessions
        )))
    }

    /// Start a negotiation as the initiating side
    ///
    /// Returns once the session exists; the pipeline runs in the background and
    /// reports through [`SessionEvent`]s.
    pub async fn start_session(self: &Arc<Self>) -> Result<String> {
        self.ensure_capacity().await?;
        let session_id = uuid::Uuid::new_v4().to_string();

        match self.config.topology {
            Topology::Loopback => self.start_loopback(session_id.clone()).await?,
            Topology::Relay => self.start_relay_initiator(session_id.clone()).await?,
        }
        Ok(session_id)
    }

    async fn start_loopback(self: &Arc<Self>, session_id: String) -> Result<()> {
        let (local, local_rx) = self.new_handle(&session_id, PeerRole::Initiator).await?;
        let (remote, remote_rx) = match self.new_handle(&session_id, PeerRole::Responder).await {
            Ok(pair) => pair,
            Err(e) => {
                local.release().await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let (announced, _) = watch::channel(false);
        let session = Arc::new(Session {
            id: session_id.clone(),
            topology: Topology::Loopback,
            local: local.clone(),
            remote: Some(remote.clone()),
            cancel: cancel.clone(),
            pumps: Mutex::new(Vec::new()),
            answer_tx: Mutex::new(None),
            announced,
            created_at: Utc::now(),
        });

        // Candidate routing and channel observers exist before the first step
        session.pumps.lock().extend([
            tokio::spawn(pump(
                local.clone(),
                local_rx,
                CandidateRoute::Peer(remote.clone()),
                cancel.clone(),
            )),
            tokio::spawn(pump(
                remote.clone(),
                remote_rx,
                CandidateRoute::Peer(local.clone()),
                cancel.clone(),
            )),
        ]);
        self.register(session.clone()).await?;

        let label = self.config.data_channel_label.clone();
        let ordered = self.config.ordered;
        self.spawn_pipeline(session, async move {
            local.create_data_channel(&label, ordered).await?;

            let offer = local.create_offer().await?;
            local.set_local_description(offer.clone()).await?;
            remote.set_remote_description(offer).await?;
            let answer = remote.create_answer().await?;
            remote.set_local_description(answer.clone()).await?;
            local.set_remote_description(answer).await?;
            Ok(())
        });
        Ok(())
    }

    async fn start_relay_initiator(self: &Arc<Self>, session_id: String) -> Result<()> {
        let (local, local_rx) = self.new_handle(&session_id, PeerRole::Initiator).await?;

        let cancel = CancellationToken::new();
        let (answer_tx, answer_rx) = oneshot::channel();
        let (announced, _) = watch::channel(false);
        let route = self.relay_route(&session_id, &announced);
        let session = Arc::new(Session {
            id: session_id.clone(),
            topology: Topology::Relay,
            local: local.clone(),
            remote: None,
            cancel: cancel.clone(),
            pumps: Mutex::new(Vec::new()),
            answer_tx: Mutex::new(Some(answer_tx)),
            announced,
            created_at: Utc::now(),
        });

        session
            .pumps
            .lock()
            .push(tokio::spawn(pump(local.clone(), local_rx, route, cancel)));
        self.register(session.clone()).await?;

        let label = self.config.data_channel_label.clone();
        let ordered = self.config.ordered;
        let outbound = self.outbound.clone();
        let pipeline_session = session.clone();
        self.spawn_pipeline(session, async move {
            local.create_data_channel(&label, ordered).await?;

            let offer = local.create_offer().await?;
            local.set_local_description(offer.clone()).await?;
            let _ = outbound.send(SignalingMessage::Offer {
                session_id: session_id.clone(),
                sdp: offer.sdp,
            });
            pipeline_session.announced.send_replace(true);

            let answer = answer_rx
                .await
                .map_err(|_| AppError::SessionClosed(session_id.clone()))?;
            local.set_remote_description(answer).await?;
            Ok(())
        });
        Ok(())
    }

    async fn start_relay_responder(self: &Arc<Self>, session_id: String, sdp: String) -> Result<()> {
        self.ensure_capacity().await?;
        let (local, local_rx) = self.new_handle(&session_id, PeerRole::Responder).await?;

        let cancel = CancellationToken::new();
        let (announced, _) = watch::channel(false);
        let route = self.relay_route(&session_id, &announced);
        let session = Arc::new(Session {
            id: session_id.clone(),
            topology: Topology::Relay,
            local: local.clone(),
            remote: None,
            cancel: cancel.clone(),
            pumps: Mutex::new(Vec::new()),
            answer_tx: Mutex::new(None),
            announced,
            created_at: Utc::now(),
        });

        session
            .pumps
            .lock()
            .push(tokio::spawn(pump(local.clone(), local_rx, route, cancel)));
        self.register(session.clone()).await?;

        let outbound = self.outbound.clone();
        let pipeline_session = session.clone();
        self.spawn_pipeline(session, async move {
            local
                .set_remote_description(SessionDescription::offer(sdp))
                .await?;
            let answer = local.create_answer().await?;
            local.set_local_description(answer.clone()).await?;
            let _ = outbound.send(SignalingMessage::Answer {
                session_id,
                sdp: answer.sdp,
            });
            pipeline_session.announced.send_replace(true);
            Ok(())
        });
        Ok(())
    }

    fn spawn_pipeline<F>(self: &Arc<Self>, session: Arc<Session>, pipeline: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let coordinator = self.clone();
        let timeout = self.config.negotiation_timeout();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = session.cancel.cancelled() => {
                    debug!("Negotiation for session {} cancelled", session.id);
                    return;
                }
                outcome = tokio::time::timeout(timeout, pipeline) => outcome,
            };

            match outcome {
                Ok(Ok(())) => {
                    info!("Negotiation complete for session {}", session.id);
                    coordinator.emit(SessionEvent::NegotiationComplete {
                        session_id: session.id.clone(),
                    });
                }
                Ok(Err(e)) if e.is_session_closed() => {
                    debug!("Session {} closed during negotiation", session.id);
                }
                Ok(Err(e)) => coordinator.fail(&session, e).await,
                Err(_) => {
                    let e = AppError::Timeout(format!(
                        "negotiation did not finish within {} ms",
                        timeout.as_millis()
                    ));
                    coordinator.fail(&session, e).await
                }
            }
        });
    }

    /// Abort a session whose pipeline failed; no retry
    async fn fail(&self, session: &Arc<Session>, error: AppError) {
        if session.cancel.is_cancelled() {
            return;
        }
        warn!("Negotiation failed for session {}: {}", session.id, error);
        self.emit(SessionEvent::NegotiationFailed {
            session_id: session.id.clone(),
            reason: error.to_string(),
        });

        if session.topology == Topology::Relay {
            let _ = self.outbound.send(SignalingMessage::Error(
                SignalingError::negotiation_failed(error.to_string()),
            ));
        }
        if let Some(session) = self.remove(&session.id).await {
            self.shutdown(&session, Shutdown::Close { notify_peer: true })
                .await;
        }
    }

    async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(session_id);
        if session.is_some() {
            self.order.lock().retain(|id| id != session_id);
        }
        session
    }

    async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn shutdown(&self, session: &Session, mode: Shutdown) {
        session.cancel.cancel();
        for pump in session.pumps.lock().drain(..) {
            pump.abort();
        }
        session.answer_tx.lock().take();

        for handle in session.handles() {
            match mode {
                Shutdown::Close { .. } => handle.close().await,
                Shutdown::Release => handle.release().await,
            };
        }

        if mode == (Shutdown::Close { notify_peer: true }) && session.topology == Topology::Relay {
            let _ = self.outbound.send(SignalingMessage::Bye {
                session_id: session.id.clone(),
            });
        }

        info!("Session closed: {}", session.id);
        self.emit(SessionEvent::SessionClosed {
            session_id: session.id.clone(),
        });
    }

    /// Close a session; handles end up Closed
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .remove(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Session not found: {}", session_id)))?;
        self.shutdown(&session, Shutdown::Close { notify_peer: true })
            .await;
        Ok(())
    }

    /// Tear down every session after the signaling transport went away
    ///
    /// Handles keep the signaling state they had reached; channels and engines
    /// are closed and no further events are reported for these sessions.
    pub async fn teardown_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            self.order.lock().clear();
            sessions.drain().map(|(_, s)| s).collect()
        };

        if !sessions.is_empty() {
            info!("Tearing down {} session(s)", sessions.len());
        }
        for session in sessions {
            self.shutdown(&session, Shutdown::Release).await;
        }
    }

    /// Route one relay message from the signaling transport
    pub async fn handle_signaling(self: &Arc<Self>, msg: SignalingMessage) -> Result<()> {
        match msg {
            SignalingMessage::Offer { session_id, sdp } => {
                if self.config.topology != Topology::Relay {
                    debug!("Ignoring relayed offer in {} topology", self.config.topology);
                    return Ok(());
                }
                if self.get(&session_id).await.is_some() {
                    return Err(AppError::InvalidState(format!(
                        "Session {} already negotiating",
                        session_id
                    )));
                }
                if let Err(e) = self.start_relay_responder(session_id.clone(), sdp).await {
                    let _ = self.outbound.send(SignalingMessage::Error(
                        SignalingError::negotiation_failed(e.to_string()),
                    ));
                    return Err(e);
                }
                Ok(())
            }
            SignalingMessage::Answer { session_id, sdp } => {
                let Some(session) = self.get(&session_id).await else {
                    let _ = self.outbound.send(SignalingMessage::Error(
                        SignalingError::unknown_session(&session_id),
                    ));
                    return Err(AppError::NotFound(format!("Session not found: {}", session_id)));
                };
                let Some(tx) = session.answer_tx.lock().take() else {
                    return Err(AppError::InvalidState(format!(
                        "Session {} is not waiting for an answer",
                        session_id
                    )));
                };
                let _ = tx.send(SessionDescription::answer(sdp));
                Ok(())
            }
            SignalingMessage::Candidate {
                session_id,
                candidate,
            } => match self.get(&session_id).await {
                Some(session) => {
                    session.local.add_ice_candidate(candidate).await?;
                    Ok(())
                }
                None => {
                    debug!("Dropping candidate for unknown session {}", session_id);
                    Ok(())
                }
            },
            SignalingMessage::Bye { session_id } => {
                if let Some(session) = self.remove(&session_id).await {
                    info!("Peer closed session {}", session_id);
                    self.shutdown(&session, Shutdown::Close { notify_peer: false })
                        .await;
                }
                Ok(())
            }
            SignalingMessage::Error(err) => {
                warn!("Signaling peer reported error {}: {}", err.code, err.message);
                Ok(())
            }
        }
    }

    /// Most recently started session
    pub async fn active_session(&self) -> Option<String> {
        self.order.lock().last().cloned()
    }

    /// Send on the active session's data channel
    pub async fn send(&self, payload: ChannelPayload) -> Result<()> {
        let session_id = self
            .active_session()
            .await
            .ok_or_else(|| AppError::NotFound("No active session".to_string()))?;
        self.send_to(&session_id, payload).await
    }

    pub async fn send_to(&self, session_id: &str, payload: ChannelPayload) -> Result<()> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Session not found: {}", session_id)))?;
        let label = &self.config.data_channel_label;
        let endpoint = session
            .local
            .channel(label)
            .ok_or_else(|| AppError::ChannelNotOpen(label.clone()))?;
        endpoint.send(payload).await
    }

    /// Handle of one side of a session
    pub async fn handle(&self, session_id: &str, role: PeerRole) -> Option<Arc<PeerConnectionHandle>> {
        let session = self.get(session_id).await?;
        let found = session.handles().find(|h| h.role() == role).cloned();
        found
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.get(session_id).await.map(|s| s.info())
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::data_channel::{ChannelDirection, ReadyState};
    use crate::webrtc::mock::{MockEngineFactory, MockStep};
    use std::time::Duration;

    fn coordinator(
        topology: Topology,
        factory: &Arc<MockEngineFactory>,
    ) -> (Arc<NegotiationCoordinator>, CoordinatorOutput) {
        let config = WebRtcConfig {
            topology,
            negotiation_timeout_ms: 1_000,
            ..Default::default()
        };
        NegotiationCoordinator::new(config, factory.clone())
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Read events until `pred` matches, returning everything seen
    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_loopback_end_to_end_hello() {
        let factory = MockEngineFactory::new();
        let (coordinator, mut out) = coordinator(Topology::Loopback, &factory);

        let session_id = coordinator.start_session().await.unwrap();

        // Channels open inside the last step, before the queued candidates are
        // flushed, so wait for the pipeline to finish as well
        let mut seen = Vec::new();
        let mut open = 0;
        let mut complete = false;
        while open < 2 || !complete {
            let event = next_event(&mut out.events).await;
            match event {
                SessionEvent::ChannelOpened { .. } => open += 1,
                SessionEvent::NegotiationComplete { .. } => complete = true,
                _ => {}
            }
            seen.push(event);
        }
        assert!(matches!(seen[0], SessionEvent::NegotiationStarted { .. }));

        let local = coordinator.handle(&session_id, PeerRole::Initiator).await.unwrap();
        let remote = coordinator.handle(&session_id, PeerRole::Responder).await.unwrap();
        assert_eq!(local.signaling_state(), SignalingState::Stable);
        assert_eq!(remote.signaling_state(), SignalingState::Stable);
        assert_eq!(local.pending_candidates(), 0);

        // Each side applied exactly the other side's host candidate
        assert_eq!(factory.engine(0).added_candidates().len(), 1);
        assert_eq!(factory.engine(1).added_candidates().len(), 1);

        coordinator.send("hello".into()).await.unwrap();

        let seen = wait_for(&mut out.events, |e| {
            matches!(e, SessionEvent::ChannelMessage { .. })
        })
        .await;
        match seen.last().unwrap() {
            SessionEvent::ChannelMessage {
                direction, payload, ..
            } => {
                assert_eq!(*direction, ChannelDirection::Receive);
                assert_eq!(payload, &ChannelPayload::from("hello"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = out.events.try_recv() {
            assert!(
                !matches!(event, SessionEvent::ChannelMessage { .. }),
                "message delivered twice"
            );
        }
        let receiver = remote.channel("sendChannel").unwrap();
        assert_eq!(receiver.frames_received(), 1);
    }

    #[tokio::test]
    async fn test_step_failure_aborts_session() {
        let factory = MockEngineFactory::new();
        factory.fail_on(MockStep::CreateAnswer);
        let (coordinator, mut out) = coordinator(Topology::Loopback, &factory);

        let session_id = coordinator.start_session().await.unwrap();
        let seen = wait_for(&mut out.events, |e| {
            matches!(e, SessionEvent::SessionClosed { .. })
        })
        .await;

        assert!(seen
            .iter()
            .any(|e| matches!(e, SessionEvent::NegotiationFailed { reason, .. } if reason.contains("create answer"))));
        assert!(!seen
            .iter()
            .any(|e| matches!(e, SessionEvent::NegotiationComplete { .. })));
        assert!(coordinator.get_session(&session_id).await.is_none());

        // No retry: exactly one offer was ever created
        let offers = factory
            .engine(0)
            .calls()
            .iter()
            .filter(|s| **s == MockStep::CreateOffer)
            .count();
        assert_eq!(offers, 1);
        assert_eq!(factory.engine(0).close_count(), 1);
        assert_eq!(factory.engine(1).close_count(), 1);
    }

    #[tokio::test]
    async fn test_negotiation_timeout() {
        let factory = MockEngineFactory::new();
        factory.hang_on(MockStep::SetRemote);
        let config = WebRtcConfig {
            negotiation_timeout_ms: 100,
            ..Default::default()
        };
        let (coordinator, mut out) = NegotiationCoordinator::new(config, factory.clone());

        coordinator.start_session().await.unwrap();
        let seen = wait_for(&mut out.events, |e| {
            matches!(e, SessionEvent::NegotiationFailed { .. })
        })
        .await;
        match seen.last().unwrap() {
            SessionEvent::NegotiationFailed { reason, .. } => assert!(reason.contains("100 ms")),
            other => panic!("unexpected event {:?}", other),
        }
        wait_for(&mut out.events, |e| matches!(e, SessionEvent::SessionClosed { .. })).await;
        assert_eq!(coordinator.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_before_open_is_rejected() {
        let factory = MockEngineFactory::new();
        factory.hang_on(MockStep::CreateOffer);
        let (coordinator, _out) = coordinator(Topology::Loopback, &factory);

        assert!(matches!(
            coordinator.send("early".into()).await,
            Err(AppError::NotFound(_))
        ));

        coordinator.start_session().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            coordinator.send("early".into()).await,
            Err(AppError::ChannelNotOpen(_))
        ));
        assert!(factory.engine(0).channels()[0].sent().is_empty());
    }

    #[tokio::test]
    async fn test_close_session_mid_negotiation() {
        let factory = MockEngineFactory::new();
        factory.hang_on(MockStep::CreateAnswer);
        let (coordinator, mut out) = coordinator(Topology::Loopback, &factory);

        let session_id = coordinator.start_session().await.unwrap();
        let remote = coordinator.handle(&session_id, PeerRole::Responder).await.unwrap();
        let mut state = remote.signaling_watch();
        state
            .wait_for(|s| *s == SignalingState::HaveRemoteOffer)
            .await
            .unwrap();

        coordinator.close_session(&session_id).await.unwrap();
        assert_eq!(remote.signaling_state(), SignalingState::Closed);
        wait_for(&mut out.events, |e| matches!(e, SessionEvent::SessionClosed { .. })).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(out.events.try_recv().is_err());
        assert!(matches!(
            coordinator.close_session(&session_id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_max_sessions() {
        let factory = MockEngineFactory::new();
        factory.hang_on(MockStep::CreateOffer);
        let config = WebRtcConfig {
            max_sessions: 2,
            ..Default::default()
        };
        let (coordinator, _out) = NegotiationCoordinator::new(config, factory.clone());

        let first = coordinator.start_session().await.unwrap();
        let second = coordinator.start_session().await.unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            coordinator.start_session().await,
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(coordinator.session_count().await, 2);
        assert_eq!(coordinator.active_session().await, Some(second.clone()));

        let listed = coordinator.list_sessions().await;
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.role == PeerRole::Initiator));
    }

    /// Two coordinators joined back to back, as two processes on one server
    fn relay(
        mut from: mpsc::UnboundedReceiver<SignalingMessage>,
        to: Arc<NegotiationCoordinator>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = from.recv().await {
                let text = msg.to_text();
                if let Some(parsed) = SignalingMessage::parse(&text) {
                    let _ = to.handle_signaling(parsed).await;
                }
            }
        })
    }

    #[tokio::test]
    async fn test_relay_end_to_end() {
        let factory = MockEngineFactory::new();
        let (a, mut a_out) = coordinator(Topology::Relay, &factory);
        let (b, mut b_out) = coordinator(Topology::Relay, &factory);

        let a_to_b = relay(a_out.signaling, b.clone());
        let b_to_a = relay(b_out.signaling, a.clone());

        let session_id = a.start_session().await.unwrap();

        wait_for(&mut a_out.events, |e| {
            matches!(e, SessionEvent::ChannelOpened { direction: ChannelDirection::Send, .. })
        })
        .await;
        wait_for(&mut b_out.events, |e| {
            matches!(e, SessionEvent::ChannelOpened { direction: ChannelDirection::Receive, .. })
        })
        .await;

        let responder = b.handle(&session_id, PeerRole::Responder).await.unwrap();
        assert_eq!(responder.signaling_state(), SignalingState::Stable);

        a.send_to(&session_id, "hello".into()).await.unwrap();
        let seen = wait_for(&mut b_out.events, |e| {
            matches!(e, SessionEvent::ChannelMessage { .. })
        })
        .await;
        assert!(matches!(
            seen.last(),
            Some(SessionEvent::ChannelMessage { payload, .. }) if payload.to_text_lossy() == "hello"
        ));

        // bye propagates
        a.close_session(&session_id).await.unwrap();
        wait_for(&mut b_out.events, |e| matches!(e, SessionEvent::SessionClosed { .. })).await;
        assert_eq!(b.session_count().await, 0);

        a_to_b.abort();
        b_to_a.abort();
    }

    #[tokio::test]
    async fn test_relay_release_keeps_last_state() {
        let factory = MockEngineFactory::new();
        let (coordinator, mut out) = coordinator(Topology::Relay, &factory);

        let session_id = coordinator.start_session().await.unwrap();
        // The offer goes out, the answer never comes back
        let offer = tokio::time::timeout(Duration::from_secs(2), out.signaling.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(offer, SignalingMessage::Offer { .. }));

        let local = coordinator.handle(&session_id, PeerRole::Initiator).await.unwrap();
        let endpoint = local.channel("sendChannel").unwrap();
        assert_eq!(local.signaling_state(), SignalingState::HaveLocalOffer);

        coordinator.teardown_all().await;
        wait_for(&mut out.events, |e| matches!(e, SessionEvent::SessionClosed { .. })).await;

        assert_eq!(local.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(endpoint.ready_state(), ReadyState::Closed);
        assert_eq!(factory.engine(0).close_count(), 1);
        assert_eq!(coordinator.session_count().await, 0);

        // A late answer finds nothing and nothing else is reported
        let late = SignalingMessage::Answer {
            session_id: session_id.clone(),
            sdp: "late".to_string(),
        };
        assert!(coordinator.handle_signaling(late).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(out.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_candidates_follow_offer() {
        let factory = MockEngineFactory::new();
        let (coordinator, mut out) = coordinator(Topology::Relay, &factory);
        coordinator.start_session().await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), out.signaling.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), out.signaling.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, SignalingMessage::Offer { .. }));
        assert!(matches!(second, SignalingMessage::Candidate { ref candidate, .. } if !candidate.is_empty()));

        // The empty sentinel is never relayed
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(out.signaling.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offer_ignored_in_loopback() {
        let factory = MockEngineFactory::new();
        let (coordinator, _out) = coordinator(Topology::Loopback, &factory);
        let offer = SignalingMessage::Offer {
            session_id: "s1".to_string(),
            sdp: "mock-offer-0".to_string(),
        };
        coordinator.handle_signaling(offer).await.unwrap();
        assert_eq!(coordinator.session_count().await, 0);
        assert!(factory.engines().is_empty());
    }

    #[tokio::test]
    #[ignore = "needs UDP networking"]
    async fn test_native_engine_loopback() {
        use crate::webrtc::config::MdnsMode;
        use crate::webrtc::native::NativeEngineFactory;

        let config = WebRtcConfig {
            include_loopback_candidates: true,
            mdns_mode: MdnsMode::Disabled,
            ..Default::default()
        };
        let factory = Arc::new(NativeEngineFactory::new(config.clone()));
        let (coordinator, mut out) = NegotiationCoordinator::new(config, factory);

        coordinator.start_session().await.unwrap();
        let mut open = 0;
        while open < 2 {
            let event = tokio::time::timeout(Duration::from_secs(15), out.events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, SessionEvent::ChannelOpened { .. }) {
                open += 1;
            }
        }

        coordinator.send("hello".into()).await.unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), out.events.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::ChannelMessage { payload, .. } = event {
                assert_eq!(payload.to_text_lossy(), "hello");
                break;
            }
        }
        coordinator.teardown_all().await;
    }
}
