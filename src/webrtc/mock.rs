//! In-memory engine for tests
//!
//! Engines created by one [`MockEngineFactory`] can reach each other: the
//! answerer finds the offerer through the offer SDP, and once the offerer has
//! the answer as remote description and the answerer has it as local
//! description the pair "connects". Every data channel the offerer created is
//! then mirrored to the answerer and both ends open.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::engine::{
    ChannelPayload, EngineEvent, EngineEventSender, EngineFactory, RtcChannel, RtcEngine,
};
use super::signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use crate::error::{AppError, Result};

/// Engine operation, for failure injection and call logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockStep {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    AddCandidate,
    CreateChannel,
    Close,
}

#[derive(Default)]
struct Behaviour {
    fail: Option<MockStep>,
    hang: Option<MockStep>,
}

type Registry = Mutex<Vec<Arc<MockEngine>>>;

#[derive(Default)]
pub struct MockEngineFactory {
    engines: Arc<Registry>,
    behaviour: Mutex<Behaviour>,
}

impl MockEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every engine created afterwards rejects `step`
    pub fn fail_on(&self, step: MockStep) {
        self.behaviour.lock().fail = Some(step);
    }

    /// Every engine created afterwards never completes `step`
    pub fn hang_on(&self, step: MockStep) {
        self.behaviour.lock().hang = Some(step);
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines.lock().clone()
    }

    pub fn engine(&self, index: usize) -> Arc<MockEngine> {
        self.engines.lock()[index].clone()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        _session_id: &str,
        events: EngineEventSender,
    ) -> Result<Arc<dyn RtcEngine>> {
        let (fail, hang) = {
            let behaviour = self.behaviour.lock();
            (behaviour.fail, behaviour.hang)
        };
        let engine = Arc::new(MockEngine {
            id: self.engines.lock().len(),
            registry: Arc::downgrade(&self.engines),
            events,
            fail,
            hang,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
            channels: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            added_candidates: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        });
        self.engines.lock().push(engine.clone());
        Ok(engine)
    }
}

pub struct MockEngine {
    pub id: usize,
    registry: Weak<Registry>,
    events: EngineEventSender,
    fail: Option<MockStep>,
    hang: Option<MockStep>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    peer: Mutex<Weak<MockEngine>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    calls: Mutex<Vec<MockStep>>,
    added_candidates: Mutex<Vec<IceCandidate>>,
    connected: AtomicBool,
    close_count: AtomicUsize,
}

impl MockEngine {
    pub fn calls(&self) -> Vec<MockStep> {
        self.calls.lock().clone()
    }

    /// Candidates the handle actually handed to the engine, in order
    pub fn added_candidates(&self) -> Vec<String> {
        self.added_candidates
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    fn find(&self, id: usize) -> Option<Arc<MockEngine>> {
        let registry = self.registry.upgrade()?;
        let engines = registry.lock();
        engines.iter().find(|e| e.id == id).cloned()
    }

    /// Push an arbitrary event into the owning handle's inbox
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    async fn step(&self, step: MockStep) -> Result<()> {
        self.calls.lock().push(step);
        if self.hang == Some(step) {
            std::future::pending::<()>().await;
        }
        if self.fail == Some(step) {
            return Err(AppError::Engine(format!("mock engine rejected {:?}", step)));
        }
        tokio::task::yield_now().await;
        Ok(())
    }

    fn candidate(&self) -> String {
        format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
            self.id,
            50000 + self.id
        )
    }

    fn try_connect(&self) {
        let Some(peer) = self.peer.lock().upgrade() else {
            return;
        };
        let self_is_offerer = matches!(&*self.local.lock(), Some(d) if d.kind == SdpType::Offer);
        let (offerer, answerer) = if self_is_offerer {
            (self, peer.as_ref())
        } else {
            (peer.as_ref(), self)
        };

        let offerer_ready =
            matches!(&*offerer.remote.lock(), Some(d) if d.kind == SdpType::Answer);
        let answerer_ready =
            matches!(&*answerer.local.lock(), Some(d) if d.kind == SdpType::Answer);
        if !offerer_ready || !answerer_ready {
            return;
        }
        if offerer.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        answerer.connected.store(true, Ordering::SeqCst);

        for engine in [offerer, answerer] {
            engine.emit(EngineEvent::ConnectionState(ConnectionState::Connecting));
            engine.emit(EngineEvent::ConnectionState(ConnectionState::Connected));
        }

        for channel in offerer.channels() {
            let label = channel.label.clone();
            let mirror = MockChannel::detached(&label);
            channel.link(answerer.events.clone());
            mirror.link(offerer.events.clone());
            answerer.channels.lock().push(mirror.clone());

            answerer.emit(EngineEvent::DataChannel(mirror));
            answerer.emit(EngineEvent::ChannelOpen {
                label: label.clone(),
            });
            offerer.emit(EngineEvent::ChannelOpen { label });
        }
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.step(MockStep::CreateOffer).await?;
        Ok(SessionDescription::offer(format!("mock-offer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.step(MockStep::CreateAnswer).await?;
        Ok(SessionDescription::answer(format!("mock-answer-{}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.step(MockStep::SetLocal).await?;
        *self.local.lock() = Some(desc);

        // Gathering: one host candidate, the empty sentinel, then completion
        self.emit(EngineEvent::IceCandidate(Some(IceCandidate::new(
            self.candidate(),
        ))));
        self.emit(EngineEvent::IceCandidate(Some(IceCandidate::new(""))));
        self.emit(EngineEvent::IceCandidate(None));

        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.step(MockStep::SetRemote).await?;
        if desc.kind == SdpType::Offer {
            let offerer = desc
                .sdp
                .strip_prefix("mock-offer-")
                .and_then(|id| id.parse::<usize>().ok())
                .and_then(|id| self.find(id));
            if let (Some(offerer), Some(me)) = (offerer, self.find(self.id)) {
                *offerer.peer.lock() = Arc::downgrade(&me);
                *self.peer.lock() = Arc::downgrade(&offerer);
            }
        }
        *self.remote.lock() = Some(desc);
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.step(MockStep::AddCandidate).await?;
        if self.remote.lock().is_none() {
            return Err(AppError::Engine(
                "remote description not set".to_string(),
            ));
        }
        self.added_candidates.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _ordered: bool,
    ) -> Result<Arc<dyn RtcChannel>> {
        self.step(MockStep::CreateChannel).await?;
        let channel = MockChannel::detached(label);
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.step(MockStep::Close).await?;
        for channel in self.channels() {
            channel.notify_peer_closed();
        }
        Ok(())
    }
}

pub struct MockChannel {
    label: String,
    sent: Mutex<Vec<ChannelPayload>>,
    peer: Mutex<Option<EngineEventSender>>,
    close_count: AtomicUsize,
}

impl MockChannel {
    /// Channel that records what is sent and delivers it nowhere
    pub fn detached(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
            close_count: AtomicUsize::new(0),
        })
    }

    fn link(&self, peer_events: EngineEventSender) {
        *self.peer.lock() = Some(peer_events);
    }

    fn notify_peer_closed(&self) {
        if let Some(peer) = self.peer.lock().take() {
            let _ = peer.send(EngineEvent::ChannelClose {
                label: self.label.clone(),
            });
        }
    }

    pub fn sent(&self) -> Vec<ChannelPayload> {
        self.sent.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RtcChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send(&self, payload: &ChannelPayload) -> Result<()> {
        if self.close_count() > 0 {
            return Err(AppError::Engine("channel closed".to_string()));
        }
        self.sent.lock().push(payload.clone());
        if let Some(peer) = self.peer.lock().as_ref() {
            let _ = peer.send(EngineEvent::ChannelMessage {
                label: self.label.clone(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.notify_peer_closed();
        Ok(())
    }
}
