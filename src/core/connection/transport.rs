//! Transport seam between the negotiation logic and a concrete peer
//! connection implementation.
//!
//! [`PeerTransport`] mirrors the subset of an RTCPeerConnection the
//! negotiator drives; [`DataChannel`] mirrors an RTCDataChannel. Transport
//! callbacks are delivered as [`PeerEvent`]s on an mpsc channel so that all
//! state transitions run on the engine's event loop instead of inside
//! platform callbacks.

use crate::core::config::RtcConfig;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the JSON shape browsers and webrtc-rs share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

/// `RTCIceCandidateInit` wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that destroy the peer connection.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Data channel creation options.
#[derive(Debug, Clone, Copy)]
pub struct ChannelInit {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Binary(Bytes),
    Text(String),
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    BufferedAmountLow,
    Closed,
    Error(String),
}

/// Callback installed on a data channel. Detached before close.
pub type ChannelHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

#[derive(Default)]
struct SlotInner {
    handler: Option<ChannelHandler>,
    backlog: Vec<ChannelEvent>,
    attached_once: bool,
}

/// Handler holder shared by channel implementations.
///
/// Events raised before the first [`attach`](Self::attach) are kept and
/// replayed on attach, so a remote channel announced through the event loop
/// loses nothing. After a [`detach`](Self::detach) events are dropped.
#[derive(Default)]
pub struct HandlerSlot {
    inner: std::sync::Mutex<SlotInner>,
}

impl HandlerSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn attach(&self, handler: ChannelHandler) {
        let backlog = {
            let mut inner = self.lock();
            inner.handler = Some(handler.clone());
            inner.attached_once = true;
            std::mem::take(&mut inner.backlog)
        };
        for event in backlog {
            handler(event);
        }
    }

    pub fn detach(&self) {
        self.lock().handler = None;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().handler.is_some()
    }

    pub fn dispatch(&self, event: ChannelEvent) {
        let handler = {
            let mut inner = self.lock();
            match inner.handler.clone() {
                Some(h) => h,
                None => {
                    if !inner.attached_once {
                        inner.backlog.push(event);
                    }
                    return;
                }
            }
        };
        handler(event);
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    async fn send(&self, data: Bytes) -> Result<()>;

    async fn send_text(&self, text: String) -> Result<()>;

    /// Route every channel event to `handler`, replacing any previous one.
    fn attach(&self, handler: ChannelHandler);

    /// Drop the installed handler; later events are discarded.
    fn detach(&self);

    async fn close(&self) -> Result<()>;
}

/// Events raised by a peer transport.
pub enum TransportEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    ConnectionState(ConnectionState),
    /// The remote side opened a channel.
    DataChannel(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            Self::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            Self::IceConnectionState(s) => write!(f, "IceConnectionState({s:?})"),
            Self::ConnectionState(s) => write!(f, "ConnectionState({s:?})"),
            Self::DataChannel(dc) => write!(f, "DataChannel({})", dc.label()),
        }
    }
}

#[derive(Debug)]
pub struct PeerEvent {
    pub peer: Uuid,
    pub event: TransportEvent,
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    async fn create_data_channel(
        &self,
        label: &str,
        init: ChannelInit,
    ) -> Result<Arc<dyn DataChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Creates transports. The engine owns one factory; tests swap in the
/// in-memory network.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        local: Uuid,
        remote: Uuid,
        config: &RtcConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_json_shape() {
        let desc = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".into(),
        };
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
        let rb: SessionDescription = serde_json::from_str(r#"{"type":"rollback"}"#).unwrap();
        assert_eq!(rb, SessionDescription::rollback());
    }

    #[test]
    fn test_candidate_json_shape() {
        let c = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn test_handler_slot_backlog_then_detach() {
        let slot = HandlerSlot::default();
        slot.dispatch(ChannelEvent::Open);
        slot.dispatch(ChannelEvent::BufferedAmountLow);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        slot.attach(Arc::new(move |ev| sink.lock().unwrap().push(format!("{ev:?}"))));
        assert_eq!(*seen.lock().unwrap(), ["Open", "BufferedAmountLow"]);

        slot.detach();
        assert!(!slot.is_attached());
        slot.dispatch(ChannelEvent::Closed);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }
}
