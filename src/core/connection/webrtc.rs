//! [`PeerTransport`] backed by webrtc-rs.
//!
//! Every callback the peer connection raises is forwarded as a
//! [`PeerEvent`]; nothing here makes negotiation decisions.

use crate::core::config::{IceServer, RtcConfig};
use crate::core::connection::transport::{
    ChannelEvent, ChannelHandler, ChannelInit, ChannelMessage, ChannelState, ConnectionState,
    DataChannel, HandlerSlot, IceCandidate, IceConnectionState, PeerEvent, PeerEventSender,
    PeerTransport, PeerTransportFactory, SdpKind, SessionDescription, SignalingState,
    TransportEvent,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

fn create_webrtc_api() -> Result<API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;

    // Frames are capped at MAX_FRAME_SIZE, which fits the default SCTP message size.
    Ok(APIBuilder::new()
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

fn ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone(),
            credential: s.credential.clone(),
        })
        .collect()
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let value = serde_json::to_value(desc)?;
    serde_json::from_value(value).context("invalid session description")
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription> {
    let value = serde_json::to_value(desc)?;
    serde_json::from_value(value).context("unsupported session description type")
}

fn map_signaling(s: RTCSignalingState) -> SignalingState {
    match s {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_connection(s: RTCPeerConnectionState) -> ConnectionState {
    match s {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn map_ice(s: RTCIceConnectionState) -> IceConnectionState {
    match s {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

/// Builds one webrtc-rs peer connection per remote peer.
pub struct WebRtcFactory {
    api: API,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self> {
        Ok(Self {
            api: create_webrtc_api()?,
        })
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcFactory {
    async fn create(
        &self,
        local: Uuid,
        remote: Uuid,
        config: &RtcConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: ice_servers(&config.ice_servers),
                    ..Default::default()
                })
                .await?,
        );
        debug!(event = "peer_connection_created", local = %local, peer = %remote, "Peer connection created");
        let transport = WebRtcTransport { remote, pc, events };
        transport.install_callbacks();
        Ok(Arc::new(transport))
    }
}

pub struct WebRtcTransport {
    remote: Uuid,
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
}

impl WebRtcTransport {
    fn sink(&self) -> impl Fn(TransportEvent) + Clone + Send + Sync + 'static {
        let tx = self.events.clone();
        let peer = self.remote;
        move |event| {
            let _ = tx.send(PeerEvent { peer, event });
        }
    }

    fn install_callbacks(&self) {
        let emit = self.sink();
        self.pc.on_negotiation_needed(Box::new(move || {
            emit(TransportEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let emit = self.sink();
        let peer = self.remote;
        self.pc.on_ice_candidate(Box::new(move |c| {
            if let Some(candidate) = c {
                match candidate.to_json() {
                    Ok(init) => emit(TransportEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!(event = "ice_candidate_encode_failure", peer = %peer, %e, "Failed to encode local ICE candidate"),
                }
            }
            Box::pin(async {})
        }));

        let emit = self.sink();
        self.pc.on_ice_connection_state_change(Box::new(move |s| {
            emit(TransportEvent::IceConnectionState(map_ice(s)));
            Box::pin(async {})
        }));

        let emit = self.sink();
        let peer = self.remote;
        self.pc.on_peer_connection_state_change(Box::new(move |s| {
            info!(event = "peer_connection_state", peer = %peer, state = %s, "Peer connection state changed");
            emit(TransportEvent::ConnectionState(map_connection(s)));
            Box::pin(async {})
        }));

        let emit = self.sink();
        self.pc.on_data_channel(Box::new(move |dc| {
            let emit = emit.clone();
            Box::pin(async move {
                let channel = WebRtcDataChannel::wrap(dc).await;
                emit(TransportEvent::DataChannel(channel));
            })
        }));
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            voice_activity_detection: false,
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut desc = desc;
        // webrtc-rs parses the sdp of a rollback too, so hand it the offer being undone.
        if desc.kind == SdpKind::Rollback && desc.sdp.is_empty() {
            let pending = self
                .pc
                .pending_local_description()
                .await
                .ok_or_else(|| anyhow!("nothing to roll back"))?;
            desc.sdp = pending.sdp;
        }
        self.pc.set_local_description(to_rtc_description(&desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(&desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling(self.pc.signaling_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: ChannelInit,
    ) -> Result<Arc<dyn DataChannel>> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(init.ordered),
                    max_retransmits: init.max_retransmits,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(WebRtcDataChannel::wrap(dc).await)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct WebRtcDataChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    slot: Arc<HandlerSlot>,
}

impl WebRtcDataChannel {
    /// Hook every callback of `dc` into a fresh [`HandlerSlot`].
    pub async fn wrap(dc: Arc<RTCDataChannel>) -> Arc<dyn DataChannel> {
        let slot = Arc::new(HandlerSlot::default());
        let label = dc.label().to_owned();

        let s = slot.clone();
        dc.on_open(Box::new(move || {
            s.dispatch(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let s = slot.clone();
        dc.on_close(Box::new(move || {
            s.dispatch(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        let s = slot.clone();
        let l = label.clone();
        dc.on_error(Box::new(move |err| {
            warn!(event = "dc_error", channel = %short_label(&l), %err, "DataChannel transport error");
            s.dispatch(ChannelEvent::Error(err.to_string()));
            Box::pin(async {})
        }));

        let s = slot.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let message = if msg.is_string {
                ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelMessage::Binary(msg.data)
            };
            s.dispatch(ChannelEvent::Message(message));
            Box::pin(async {})
        }));

        let s = slot.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            s.dispatch(ChannelEvent::BufferedAmountLow);
            Box::pin(async {})
        }))
        .await;

        Arc::new(Self { label, dc, slot })
    }
}

fn short_label(label: &str) -> &str {
    crate::core::connection::channels::short(label)
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    fn attach(&self, handler: ChannelHandler) {
        self.slot.attach(handler);
    }

    fn detach(&self) {
        self.slot.detach();
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_converts_both_ways() {
        let ours = SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0\r\n".into(),
        };
        let rtc = to_rtc_description(&ours).unwrap();
        assert_eq!(rtc.sdp, "v=0\r\n");
        assert_eq!(from_rtc_description(&rtc).unwrap(), ours);
    }

    #[test]
    fn test_ice_servers_mapping() {
        let servers = ice_servers(&RtcConfig::default().ice_servers);
        assert!(!servers.is_empty());
        assert!(servers[0].urls[0].starts_with("stun:"));
    }

    #[tokio::test]
    async fn test_factory_builds_stable_transport() {
        let factory = WebRtcFactory::new().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let config = RtcConfig { ice_servers: vec![] };
        let t = factory
            .create(Uuid::new_v4(), Uuid::new_v4(), &config, tx)
            .await
            .unwrap();
        assert_eq!(t.signaling_state(), SignalingState::Stable);
        assert!(!t.has_remote_description().await);
        t.close().await.unwrap();
    }
}
