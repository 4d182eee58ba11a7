//! webrtc-rs backed engine

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::config::{MdnsMode, WebRtcConfig};
use super::engine::{
    ChannelPayload, EngineEvent, EngineEventSender, EngineFactory, RtcChannel, RtcEngine,
};
use super::signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use crate::error::{AppError, Result};

/// Builds one `RTCPeerConnection` per handle from [`WebRtcConfig`]
pub struct NativeEngineFactory {
    config: WebRtcConfig,
}

impl NativeEngineFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineFactory for NativeEngineFactory {
    async fn create(
        &self,
        session_id: &str,
        events: EngineEventSender,
    ) -> Result<Arc<dyn RtcEngine>> {
        let engine = NativeEngine::new(&self.config, session_id, events).await?;
        Ok(Arc::new(engine))
    }
}

/// Peer connection engine
pub struct NativeEngine {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    events: EngineEventSender,
}

impl NativeEngine {
    pub async fn new(
        config: &WebRtcConfig,
        session_id: &str,
        events: EngineEventSender,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::Engine(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::Engine(format!("Failed to register interceptors: {}", e)))?;

        let mut setting_engine = SettingEngine::default();
        let mode = MulticastDnsMode::from(config.effective_mdns_mode());
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(MdnsMode::host_name(session_id));
        }
        setting_engine.set_include_loopback_candidate(config.include_loopback_candidates);
        debug!("WebRTC mDNS mode: {:?} (session {})", mode, session_id);

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::Engine(format!("Failed to create peer connection: {}", e))
        })?;

        let engine = Self {
            session_id: session_id.to_string(),
            pc: Arc::new(pc),
            events,
        };
        engine.setup_event_handlers();

        Ok(engine)
    }

    fn setup_event_handlers(&self) {
        let events = self.events.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let events = events.clone();
                let session_id = session_id.clone();

                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    debug!("Peer {} connection state: {}", session_id, state);
                    let _ = events.send(EngineEvent::ConnectionState(state));
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();

                Box::pin(async move {
                    let candidate = match candidate {
                        Some(c) => match c.to_json() {
                            Ok(init) => Some(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                            Err(e) => {
                                warn!("Failed to serialize ICE candidate: {}", e);
                                return;
                            }
                        },
                        None => None,
                    };
                    let _ = events.send(EngineEvent::IceCandidate(candidate));
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();

                Box::pin(async move {
                    info!("Data channel opened by remote: {}", dc.label());
                    // Ownership first, so open/message events find their endpoint
                    let _ = events.send(EngineEvent::DataChannel(Arc::new(NativeChannel {
                        dc: dc.clone(),
                    })));
                    wire_channel(&dc, events);
                })
            }));
    }
}

/// Forward a channel's callbacks into the handle's inbox
fn wire_channel(dc: &Arc<RTCDataChannel>, events: EngineEventSender) {
    let label = dc.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_events.send(EngineEvent::ChannelOpen { label: open_label });
        })
    }));

    let close_events = events.clone();
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        let label = close_label.clone();
        Box::pin(async move {
            let _ = events.send(EngineEvent::ChannelClose { label });
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let payload = if msg.is_string {
            ChannelPayload::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            ChannelPayload::Binary(msg.data)
        };
        let _ = events.send(EngineEvent::ChannelMessage {
            label: label.clone(),
            payload,
        });
        Box::pin(async {})
    }));
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| AppError::NegotiationFailed(format!("Invalid SDP: {}", e)))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(AppError::Engine(format!(
            "Unexpected description type: {}",
            other
        ))),
    }
}

#[async_trait]
impl RtcEngine for NativeEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<Arc<dyn RtcChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        wire_channel(&dc, self.events.clone());
        Ok(Arc::new(NativeChannel { dc }))
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct NativeChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl RtcChannel for NativeChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    async fn send(&self, payload: &ChannelPayload) -> Result<()> {
        match payload {
            ChannelPayload::Text(text) => self.dc.send_text(text.clone()).await?,
            ChannelPayload::Binary(data) => self.dc.send(data).await?,
        };
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}
