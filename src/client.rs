//! Signaling client: the transport, the coordinator and the status sink wired together
//!
//! Caller operations are fire-and-forget in spirit: they return a `Result` for
//! convenience, but every outcome is also reported through the [`EventBus`].

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigChange, ConfigStore};
use crate::error::Result;
use crate::events::{EventBus, SessionEvent};
use crate::transport::{SignalingTransport, TransportEvent, TransportState};
use crate::webrtc::config::Topology;
use crate::webrtc::engine::{ChannelPayload, EngineFactory};
use crate::webrtc::session::{CoordinatorOutput, NegotiationCoordinator, SessionInfo};
use crate::webrtc::signaling::{SignalingMessage, LIVENESS_PROBE};

pub const STATUS_CONNECTED: &str = "Signaling Server: Connected";
pub const STATUS_DISCONNECTED: &str = "Signaling Server: Disconnected";

/// Snapshot for the `status` command
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub url: String,
    pub transport: TransportState,
    pub topology: Topology,
    pub sessions: Vec<SessionInfo>,
}

pub struct SignalingClient {
    config: ConfigStore,
    transport: Arc<SignalingTransport>,
    coordinator: Arc<NegotiationCoordinator>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl SignalingClient {
    /// Build the client and spawn its event loop
    pub fn start(
        config: ConfigStore,
        factory: Arc<dyn EngineFactory>,
        bus: Arc<EventBus>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (transport, transport_events) = SignalingTransport::new();
        let (coordinator, output) = NegotiationCoordinator::new(config.get().webrtc.clone(), factory);

        let client = Arc::new(Self {
            config,
            transport,
            coordinator,
            bus,
            cancel: CancellationToken::new(),
        });
        client.bus.signal_status(STATUS_DISCONNECTED);

        let config_changes = client.config.subscribe();
        let task = tokio::spawn(client.clone().run(transport_events, output, config_changes));
        (client, task)
    }

    pub fn coordinator(&self) -> &Arc<NegotiationCoordinator> {
        &self.coordinator
    }

    async fn run(
        self: Arc<Self>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        output: CoordinatorOutput,
        mut config_changes: broadcast::Receiver<ConfigChange>,
    ) {
        let CoordinatorOutput {
            events: mut session_events,
            signaling: mut outbound,
        } = output;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = transport_events.recv() => self.on_transport_event(event).await,
                Some(event) = session_events.recv() => self.on_session_event(event),
                Ok(change) = config_changes.recv() => self.on_config_change(change),
                Some(msg) = outbound.recv() => {
                    if let Err(e) = self.transport.send(&msg.to_text()) {
                        warn!("Dropping relay message for session {:?}: {}", msg.session_id(), e);
                    }
                }
                else => break,
            }
        }
        debug!("Signaling client loop stopped");
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.bus.signal_status(STATUS_CONNECTED);
                if self.config.get().signaling.negotiate_on_open {
                    self.negotiate().await;
                }
            }
            TransportEvent::Message(text) => self.on_message(text).await,
            TransportEvent::Error(reason) => {
                self.bus.log(format!("Signaling error: {}", reason));
            }
            TransportEvent::Close(reason) => {
                self.coordinator.teardown_all().await;
                self.bus.log(format!("Signaling connection closed: {}", reason));
                self.bus.signal_status(STATUS_DISCONNECTED);
            }
        }
    }

    async fn on_message(self: &Arc<Self>, text: String) {
        if text == LIVENESS_PROBE {
            debug!("Liveness probe echoed by signaling server");
            return;
        }

        if self.coordinator.topology() == Topology::Relay {
            if let Some(msg) = SignalingMessage::parse(&text) {
                debug!("Relay message: {}", text);
                if let Err(e) = self.coordinator.handle_signaling(msg).await {
                    self.bus.log(format!("Signaling message rejected: {}", e));
                }
                return;
            }
        }
        self.bus.log(format!("Signaling message: {}", text));
    }

    fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::SignalingStateChanged { .. } | SessionEvent::ConnectionStateChanged { .. } => {
                debug!("{}", event.describe())
            }
            _ => self.bus.log(event.describe()),
        }
    }

    fn on_config_change(&self, change: ConfigChange) {
        match change.key.as_str() {
            "signaling.url" => {
                let url = self.config.get().signaling.url.clone();
                self.bus
                    .log(format!("Signaling URL set to {}, used on next connect", url));
            }
            other => debug!("Configuration changed: {}", other),
        }
    }

    /// Start a negotiation now
    pub async fn negotiate(self: &Arc<Self>) {
        match self.coordinator.start_session().await {
            Ok(session_id) => info!("Negotiating session {}", session_id),
            Err(e) => self.bus.log(format!("Cannot start negotiation: {}", e)),
        }
    }

    /// Connect to the configured signaling server
    pub async fn connect(&self) -> Result<()> {
        let signaling = self.config.get().signaling.clone();
        if let Err(e) = self
            .transport
            .connect(&signaling.url, signaling.connect_timeout())
            .await
        {
            self.bus
                .log(format!("Cannot connect to {}: {}", signaling.url, e));
            return Err(e);
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await
    }

    /// Send the liveness probe to the signaling server
    pub fn ping(&self) -> Result<()> {
        if let Err(e) = self.transport.send(LIVENESS_PROBE) {
            self.bus.log(format!("Ping failed: {}", e));
            return Err(e);
        }
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(ChannelPayload::from(text)).await
    }

    /// Send `text` as a binary frame (its UTF-8 bytes)
    pub async fn send_binary(&self, text: &str) -> Result<()> {
        self.send(ChannelPayload::from(text.as_bytes().to_vec()))
            .await
    }

    async fn send(&self, payload: ChannelPayload) -> Result<()> {
        match self.coordinator.send(payload.clone()).await {
            Ok(()) => {
                self.bus.log(format!("Sent: {}", payload.to_text_lossy()));
                Ok(())
            }
            Err(e) => {
                self.bus.log(format!("Send failed: {}", e));
                Err(e)
            }
        }
    }

    pub async fn status(&self) -> ClientStatus {
        ClientStatus {
            url: self.config.get().signaling.url.clone(),
            transport: self.transport.state(),
            topology: self.coordinator.topology(),
            sessions: self.coordinator.list_sessions().await,
        }
    }

    /// Disconnect, tear everything down and stop the event loop
    pub async fn shutdown(&self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!("Error while disconnecting: {}", e);
        }
        self.coordinator.teardown_all().await;
        self.cancel.cancel();
    }
}
