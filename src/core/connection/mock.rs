//! In-memory loopback transport.
//!
//! [`MockNetwork`] implements [`PeerTransportFactory`] and links the two
//! transports of a peer pair in process. It follows the RTCPeerConnection
//! signaling state machine closely enough to exercise perfect negotiation:
//! setting a remote offer while holding a local one fails (the caller has to
//! roll back first), a side becomes connected once it is stable with both
//! descriptions applied, and data channels pair up once both ends are
//! connected.

use crate::core::config::RtcConfig;
use crate::core::connection::transport::{
    ChannelEvent, ChannelHandler, ChannelInit, ChannelMessage, ChannelState, ConnectionState,
    DataChannel, HandlerSlot, IceCandidate, IceConnectionState, PeerEvent, PeerEventSender, PeerTransport,
    PeerTransportFactory, SdpKind, SessionDescription, SignalingState, TransportEvent,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

type Link = (Uuid, Uuid);

#[derive(Default)]
struct NetworkInner {
    transports: HashMap<Link, Arc<MockTransport>>,
}

/// Shared in-memory network. Clone freely; all clones see the same links.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport owned by `local` for its connection to `remote`.
    pub fn transport(&self, local: Uuid, remote: Uuid) -> Option<Arc<MockTransport>> {
        lock(&self.inner).transports.get(&(local, remote)).cloned()
    }

    /// Data channel `label` held by `local` towards `remote`.
    pub fn channel(&self, local: Uuid, remote: Uuid, label: &str) -> Option<Arc<MockDataChannel>> {
        self.transport(local, remote)?.channel(label)
    }

    /// Raise an ICE failure on `local`'s side of the link.
    pub fn fail_ice(&self, local: Uuid, remote: Uuid) -> bool {
        match self.transport(local, remote) {
            Some(t) => {
                t.emit(TransportEvent::IceConnectionState(IceConnectionState::Failed));
                true
            }
            None => false,
        }
    }

    /// Drop the link as if the network went away: both sides see `state`.
    pub fn break_link(&self, a: Uuid, b: Uuid, state: ConnectionState) {
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(t) = self.transport(local, remote) {
                t.emit(TransportEvent::ConnectionState(state));
            }
        }
    }

    fn peer_of(&self, t: &MockTransport) -> Option<Arc<MockTransport>> {
        self.transport(t.remote, t.local)
    }

    fn remove(&self, t: &MockTransport) {
        let mut inner = lock(&self.inner);
        if let Some(existing) = inner.transports.get(&(t.local, t.remote)) {
            if std::ptr::eq(Arc::as_ptr(existing), t) {
                inner.transports.remove(&(t.local, t.remote));
            }
        }
    }
}

#[async_trait]
impl PeerTransportFactory for MockNetwork {
    async fn create(
        &self,
        local: Uuid,
        remote: Uuid,
        _config: &RtcConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(MockTransport {
            local,
            remote,
            network: self.clone(),
            events,
            state: Mutex::new(TransportState::default()),
        });
        lock(&self.inner)
            .transports
            .insert((local, remote), transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
struct TransportState {
    signaling: Option<SignalingState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// Last description we answered or applied, restored by rollback.
    stable_local: Option<SessionDescription>,
    connected: bool,
    closed: bool,
    offers: u64,
    ice_restarts: u64,
    applied_candidates: Vec<IceCandidate>,
    channels: Vec<Arc<MockDataChannel>>,
}

impl TransportState {
    fn signaling(&self) -> SignalingState {
        self.signaling.unwrap_or(SignalingState::Stable)
    }
}

pub struct MockTransport {
    local: Uuid,
    remote: Uuid,
    network: MockNetwork,
    events: PeerEventSender,
    state: Mutex<TransportState>,
}

impl MockTransport {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(PeerEvent {
            peer: self.remote,
            event,
        });
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn ice_restarts(&self) -> u64 {
        lock(&self.state).ice_restarts
    }

    pub fn offers_created(&self) -> u64 {
        lock(&self.state).offers
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied_candidates.clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        lock(&self.state)
            .channels
            .iter()
            .rev()
            .find(|c| c.label == label)
            .cloned()
    }

    fn gather_candidate(&self, generation: u64) {
        self.emit(TransportEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp {} 127.0.0.1 9 typ host", self.local.simple(), generation),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    /// Mark connected once stable with both descriptions, then pair channels.
    fn maybe_connect(&self) {
        let newly = {
            let mut st = lock(&self.state);
            let ready = st.signaling() == SignalingState::Stable
                && st.local.is_some()
                && st.remote.is_some()
                && !st.closed;
            let newly = ready && !st.connected;
            if newly {
                st.connected = true;
            }
            newly
        };
        if newly {
            self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
            self.emit(TransportEvent::IceConnectionState(IceConnectionState::Connected));
            self.pair_pending();
        }
    }

    fn pair_pending(&self) {
        let Some(peer) = self.network.peer_of(self) else {
            return;
        };
        if !peer.is_connected() || !self.is_connected() {
            return;
        }
        for transport in [self, peer.as_ref()] {
            let pending: Vec<_> = lock(&transport.state)
                .channels
                .iter()
                .filter(|c| c.unpaired() && c.initiator)
                .cloned()
                .collect();
            let other = if std::ptr::eq(transport, self) { peer.as_ref() } else { self };
            for channel in pending {
                other.accept_channel(&channel);
            }
        }
    }

    /// Create the remote end of `origin`, announce it, then open both ends.
    fn accept_channel(&self, origin: &Arc<MockDataChannel>) {
        let remote_end = MockDataChannel::new(&origin.label, false);
        *lock(&remote_end.peer) = Arc::downgrade(origin);
        *lock(&origin.peer) = Arc::downgrade(&remote_end);
        lock(&self.state).channels.push(remote_end.clone());

        self.emit(TransportEvent::DataChannel(remote_end.clone()));
        origin.open();
        remote_end.open();
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut st = lock(&self.state);
        if st.closed {
            bail!("transport closed");
        }
        st.offers += 1;
        if ice_restart {
            st.ice_restarts += 1;
        }
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("mock-offer {} {}", self.local, st.offers),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let st = lock(&self.state);
        if st.signaling() != SignalingState::HaveRemoteOffer {
            bail!("create_answer in {:?}", st.signaling());
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("mock-answer {}", self.local),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let generation = {
            let mut st = lock(&self.state);
            let current = st.signaling();
            match (desc.kind, current) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    st.signaling = Some(SignalingState::HaveLocalOffer);
                    st.local = Some(desc);
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                    st.signaling = Some(SignalingState::Stable);
                    st.local = Some(desc);
                    st.stable_local = st.local.clone();
                }
                (SdpKind::Rollback, SignalingState::HaveLocalOffer) => {
                    st.signaling = Some(SignalingState::Stable);
                    st.local = st.stable_local.clone();
                    return Ok(());
                }
                (kind, state) => bail!("set_local_description({kind:?}) in {state:?}"),
            }
            st.offers
        };
        self.gather_candidate(generation);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        {
            let mut st = lock(&self.state);
            match (desc.kind, st.signaling()) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    st.signaling = Some(SignalingState::HaveRemoteOffer);
                    st.remote = Some(desc);
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    st.signaling = Some(SignalingState::Stable);
                    st.remote = Some(desc);
                    st.stable_local = st.local.clone();
                }
                (kind, state) => bail!("set_remote_description({kind:?}) in {state:?}"),
            }
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut st = lock(&self.state);
        if st.remote.is_none() {
            bail!("add_ice_candidate without remote description");
        }
        st.applied_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        let st = lock(&self.state);
        if st.closed {
            SignalingState::Closed
        } else {
            st.signaling()
        }
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _init: ChannelInit,
    ) -> Result<Arc<dyn DataChannel>> {
        let channel = MockDataChannel::new(label, true);
        let first_negotiation = {
            let mut st = lock(&self.state);
            if st.closed {
                bail!("transport closed");
            }
            st.channels.push(channel.clone());
            st.local.is_none() && st.remote.is_none()
        };
        if first_negotiation {
            self.emit(TransportEvent::NegotiationNeeded);
        } else {
            self.pair_pending();
        }
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        let channels = {
            let mut st = lock(&self.state);
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            st.connected = false;
            std::mem::take(&mut st.channels)
        };
        for channel in channels {
            channel.shutdown();
        }
        self.network.remove(self);
        if let Some(peer) = self.network.peer_of(self) {
            peer.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
        }
        Ok(())
    }
}

struct ChannelInner {
    state: ChannelState,
    buffered: usize,
    low_threshold: usize,
    sent: u64,
}

pub struct MockDataChannel {
    id: u64,
    label: String,
    initiator: bool,
    inner: Mutex<ChannelInner>,
    slot: HandlerSlot,
    peer: Mutex<Weak<MockDataChannel>>,
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl MockDataChannel {
    fn new(label: &str, initiator: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            label: label.to_owned(),
            initiator,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Connecting,
                buffered: 0,
                low_threshold: 0,
                sent: 0,
            }),
            slot: HandlerSlot::default(),
            peer: Mutex::new(Weak::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn unpaired(&self) -> bool {
        lock(&self.peer).upgrade().is_none() && lock(&self.inner).state == ChannelState::Connecting
    }

    /// Frames successfully handed to the remote end.
    pub fn sent_count(&self) -> u64 {
        lock(&self.inner).sent
    }

    pub fn is_attached(&self) -> bool {
        self.slot.is_attached()
    }

    /// Pretend the send buffer holds `amount` bytes.
    pub fn set_buffered_amount(&self, amount: usize) {
        lock(&self.inner).buffered = amount;
    }

    /// Drop the buffered amount to `amount` and fire `bufferedamountlow` if
    /// it crossed the threshold.
    pub fn simulate_drain(&self, amount: usize) {
        let fire = {
            let mut inner = lock(&self.inner);
            let crossed = inner.buffered > inner.low_threshold && amount <= inner.low_threshold;
            inner.buffered = amount;
            crossed
        };
        if fire {
            self.dispatch(ChannelEvent::BufferedAmountLow);
        }
    }

    /// Raise an error event as the platform would.
    pub fn simulate_error(&self, reason: &str) {
        self.dispatch(ChannelEvent::Error(reason.to_owned()));
    }

    fn open(&self) {
        lock(&self.inner).state = ChannelState::Open;
        self.dispatch(ChannelEvent::Open);
    }

    /// Close without detaching: the handler, if any, sees `Closed`.
    fn shutdown(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Closed;
        }
        self.dispatch(ChannelEvent::Closed);
        if let Some(peer) = lock(&self.peer).upgrade() {
            peer.shutdown();
        }
    }

    fn dispatch(&self, event: ChannelEvent) {
        self.slot.dispatch(event);
    }

    fn deliver(&self, message: ChannelMessage) -> Result<()> {
        let peer = lock(&self.peer)
            .upgrade()
            .ok_or_else(|| anyhow!("channel {} has no remote end", self.label))?;
        if lock(&peer.inner).state != ChannelState::Open {
            bail!("remote end of {} not open", self.label);
        }
        lock(&self.inner).sent += 1;
        peer.dispatch(ChannelEvent::Message(message));
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    async fn buffered_amount(&self) -> usize {
        lock(&self.inner).buffered
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        lock(&self.inner).low_threshold = threshold;
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.state() != ChannelState::Open {
            bail!("channel {} not open", self.label);
        }
        self.deliver(ChannelMessage::Binary(data))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if self.state() != ChannelState::Open {
            bail!("channel {} not open", self.label);
        }
        self.deliver(ChannelMessage::Text(text))
    }

    fn attach(&self, handler: ChannelHandler) {
        self.slot.attach(handler);
    }

    fn detach(&self) {
        self.slot.detach();
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
