//! Perfect-negotiation state machine, one per remote peer.
//!
//! - The peer whose id sorts lower is polite. Both sides compute the same
//!   answer from the same two ids, whoever dialed first.
//! - An incoming offer collides when we are making an offer or are not
//!   stable. The impolite side ignores it; the polite side rolls back its
//!   own offer and answers.
//! - Remote ICE candidates queue per peer, FIFO, until the transport is
//!   stable with a remote description.
//! - ICE failure restarts ICE. Only a terminal connection state removes the
//!   peer and raises [`NegotiatorEvent::DeletePeer`].

use crate::core::config::RtcConfig;
use crate::core::connection::transport::{
    ConnectionState, IceCandidate, IceConnectionState, PeerEventSender, PeerTransport,
    PeerTransportFactory, SdpKind, SessionDescription, SignalingState,
};
use crate::core::error::TransferError;
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Polite,
    Impolite,
}

/// Role of `local` in its pair with `remote`.
pub fn role_for(local: Uuid, remote: Uuid) -> Role {
    if local < remote {
        Role::Polite
    } else {
        Role::Impolite
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// Local offer applied, waiting for an answer.
    Offering,
    /// Remote offer applied, answer in progress.
    Answering,
    Stable,
    Closed,
    Failed,
}

/// What happened to an incoming description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionOutcome {
    /// Remote answer applied.
    Applied,
    /// Remote offer applied and answered.
    Answered,
    /// Colliding offer dropped by the impolite side.
    Ignored,
    /// Own offer rolled back, remote offer answered.
    RolledBack,
}

/// Payload relayed through the signaling server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug, Clone)]
pub enum NegotiatorEvent {
    Signal {
        to: Uuid,
        room: Option<String>,
        payload: SignalPayload,
    },
    PeerConnected {
        peer: Uuid,
        initiator: bool,
    },
    DeletePeer {
        peer: Uuid,
    },
}

/// Per-peer negotiation record.
pub struct PeerEntry {
    pub peer: Uuid,
    pub public_key: [u8; 32],
    pub role: Role,
    pub state: NegotiationState,
    pub making_offer: bool,
    pub initiator: bool,
    pub connected: bool,
    pub rooms: BTreeSet<String>,
    pending_candidates: VecDeque<IceCandidate>,
    transport: Arc<dyn PeerTransport>,
}

impl PeerEntry {
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn any_room(&self) -> Option<String> {
        self.rooms.iter().next().cloned()
    }
}

/// Snapshot returned by [`ConnectionNegotiator::connect`].
#[derive(Clone)]
pub struct PeerConnection {
    pub peer: Uuid,
    pub role: Role,
    pub transport: Arc<dyn PeerTransport>,
}

/// Owns every [`PeerEntry`], keyed by remote peer id.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    peers: Arc<RwLock<HashMap<Uuid, Arc<Mutex<PeerEntry>>>>>,
}

impl ConnectionRegistry {
    pub async fn get(&self, peer: &Uuid) -> Option<Arc<Mutex<PeerEntry>>> {
        self.peers.read().await.get(peer).cloned()
    }

    pub async fn transport(&self, peer: &Uuid) -> Option<Arc<dyn PeerTransport>> {
        let entry = self.get(peer).await?;
        let entry = entry.lock().await;
        Some(entry.transport.clone())
    }

    pub async fn public_key(&self, peer: &Uuid) -> Option<[u8; 32]> {
        let entry = self.get(peer).await?;
        let key = entry.lock().await.public_key;
        Some(key)
    }

    pub async fn peers(&self) -> Vec<Uuid> {
        self.peers.read().await.keys().copied().collect()
    }

    pub async fn contains(&self, peer: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer)
    }

    async fn remove(&self, peer: &Uuid) -> Option<Arc<Mutex<PeerEntry>>> {
        self.peers.write().await.remove(peer)
    }
}

pub struct ConnectionNegotiator {
    local: Uuid,
    factory: Arc<dyn PeerTransportFactory>,
    registry: ConnectionRegistry,
    transport_events: PeerEventSender,
    out: mpsc::UnboundedSender<NegotiatorEvent>,
}

impl ConnectionNegotiator {
    pub fn new(
        local: Uuid,
        factory: Arc<dyn PeerTransportFactory>,
        registry: ConnectionRegistry,
        transport_events: PeerEventSender,
        out: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Self {
        Self {
            local,
            factory,
            registry,
            transport_events,
            out,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get or create the connection to `peer`. An existing connection only
    /// gains `room`.
    pub async fn connect(
        &self,
        peer: Uuid,
        public_key: [u8; 32],
        room: &str,
        rtc: &RtcConfig,
        initiator: bool,
    ) -> Result<PeerConnection> {
        if peer == self.local {
            anyhow::bail!("refusing to connect to self");
        }

        let mut peers = self.registry.peers.write().await;
        if let Some(existing) = peers.get(&peer) {
            let mut entry = existing.lock().await;
            if entry.rooms.insert(room.to_owned()) {
                debug!(event = "peer_room_added", peer = %peer, room = %room, "Room merged into existing connection");
            }
            return Ok(PeerConnection {
                peer,
                role: entry.role,
                transport: entry.transport.clone(),
            });
        }

        let transport = self
            .factory
            .create(self.local, peer, rtc, self.transport_events.clone())
            .await
            .with_context(|| format!("creating transport for {peer}"))?;
        let role = role_for(self.local, peer);
        let entry = PeerEntry {
            peer,
            public_key,
            role,
            state: NegotiationState::Idle,
            making_offer: false,
            initiator,
            connected: false,
            rooms: BTreeSet::from([room.to_owned()]),
            pending_candidates: VecDeque::new(),
            transport: transport.clone(),
        };
        peers.insert(peer, Arc::new(Mutex::new(entry)));
        info!(event = "peer_created", peer = %peer, role = ?role, initiator, room = %room, "Peer connection created");

        Ok(PeerConnection {
            peer,
            role,
            transport,
        })
    }

    /// Local side needs (re)negotiation: create and send an offer.
    pub async fn handle_negotiation_needed(&self, peer: Uuid) -> Result<()> {
        let entry = self.entry(peer).await?;
        let mut entry = entry.lock().await;
        if entry.transport.signaling_state() != SignalingState::Stable {
            debug!(event = "negotiation_deferred", peer = %peer, "Negotiation needed while not stable");
            return Ok(());
        }
        self.send_offer(&mut entry, false).await
    }

    async fn send_offer(&self, entry: &mut PeerEntry, ice_restart: bool) -> Result<()> {
        entry.making_offer = true;
        let result = async {
            let offer = entry.transport.create_offer(ice_restart).await?;
            entry.transport.set_local_description(offer.clone()).await?;
            Ok::<_, anyhow::Error>(offer)
        }
        .await;
        entry.making_offer = false;

        let offer = result.with_context(|| format!("offer to {}", entry.peer))?;
        entry.state = NegotiationState::Offering;
        self.signal(entry, SignalPayload::Description(offer));
        debug!(event = "offer_sent", peer = %entry.peer, ice_restart, "Offer sent");
        Ok(())
    }

    /// Apply a remote description, resolving offer collisions.
    pub async fn handle_description(
        &self,
        from: Uuid,
        public_key: [u8; 32],
        room: &str,
        rtc: &RtcConfig,
        desc: SessionDescription,
    ) -> Result<DescriptionOutcome> {
        if !self.registry.contains(&from).await {
            self.connect(from, public_key, room, rtc, false).await?;
        }
        let entry = self.entry(from).await?;
        let mut entry = entry.lock().await;
        entry.rooms.insert(room.to_owned());

        let transport = entry.transport.clone();
        let is_offer = desc.kind == SdpKind::Offer;
        let collision =
            is_offer && (entry.making_offer || transport.signaling_state() != SignalingState::Stable);

        if collision && entry.role == Role::Impolite {
            debug!(event = "offer_ignored", peer = %from, "Colliding offer ignored (impolite)");
            return Ok(DescriptionOutcome::Ignored);
        }
        if collision {
            transport
                .set_local_description(SessionDescription::rollback())
                .await
                .context("rollback")?;
            info!(event = "offer_rolled_back", peer = %from, "Own offer rolled back (polite)");
        }

        transport
            .set_remote_description(desc)
            .await
            .with_context(|| format!("remote description from {from}"))?;

        let outcome = if is_offer {
            entry.state = NegotiationState::Answering;
            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            self.signal(&entry, SignalPayload::Description(answer));
            if collision {
                DescriptionOutcome::RolledBack
            } else {
                DescriptionOutcome::Answered
            }
        } else {
            DescriptionOutcome::Applied
        };
        entry.state = NegotiationState::Stable;

        self.drain_candidates(&mut entry).await;
        Ok(outcome)
    }

    /// Apply or queue a remote ICE candidate.
    pub async fn handle_candidate(&self, from: Uuid, candidate: IceCandidate) -> Result<()> {
        let entry = self.entry(from).await?;
        let mut entry = entry.lock().await;
        entry.pending_candidates.push_back(candidate);
        self.drain_candidates(&mut entry).await;
        if !entry.pending_candidates.is_empty() {
            debug!(event = "candidate_queued", peer = %from, queued = entry.pending_candidates.len(), "ICE candidate queued");
        }
        Ok(())
    }

    async fn drain_candidates(&self, entry: &mut PeerEntry) {
        while entry.transport.signaling_state() == SignalingState::Stable
            && entry.transport.has_remote_description().await
        {
            let Some(candidate) = entry.pending_candidates.pop_front() else {
                break;
            };
            if let Err(e) = entry.transport.add_ice_candidate(candidate).await {
                warn!(event = "candidate_rejected", peer = %entry.peer, error = %e, "ICE candidate rejected");
            }
        }
    }

    /// Locally gathered candidate: relay it.
    pub async fn handle_local_candidate(&self, peer: Uuid, candidate: IceCandidate) -> Result<()> {
        let entry = self.entry(peer).await?;
        let entry = entry.lock().await;
        self.signal(&entry, SignalPayload::Candidate(candidate));
        Ok(())
    }

    pub async fn handle_ice_state(&self, peer: Uuid, state: IceConnectionState) -> Result<()> {
        if state != IceConnectionState::Failed {
            return Ok(());
        }
        let entry = self.entry(peer).await?;
        let mut entry = entry.lock().await;
        warn!(event = "ice_restart", peer = %peer, "ICE failed, restarting");
        if entry.transport.signaling_state() != SignalingState::Stable {
            return Ok(());
        }
        self.send_offer(&mut entry, true).await
    }

    pub async fn handle_connection_state(&self, peer: Uuid, state: ConnectionState) -> Result<()> {
        if state == ConnectionState::Connected {
            let entry = self.entry(peer).await?;
            let mut entry = entry.lock().await;
            if !entry.connected {
                entry.connected = true;
                entry.state = NegotiationState::Stable;
                info!(event = "peer_connected", peer = %peer, initiator = entry.initiator, "Peer connected");
                let _ = self.out.send(NegotiatorEvent::PeerConnected {
                    peer,
                    initiator: entry.initiator,
                });
            }
            return Ok(());
        }
        if state.is_terminal() {
            warn!(event = "peer_connection_lost", peer = %peer, state = ?state, "Peer connection reached terminal state");
            self.remove_peer(
                peer,
                if state == ConnectionState::Failed {
                    NegotiationState::Failed
                } else {
                    NegotiationState::Closed
                },
            )
            .await;
        }
        Ok(())
    }

    /// Remove `room` from the peer; close the peer when no rooms remain.
    pub async fn leave_room(&self, peer: Uuid, room: &str) -> Result<()> {
        let entry = self.entry(peer).await?;
        let empty = {
            let mut entry = entry.lock().await;
            entry.rooms.remove(room);
            entry.rooms.is_empty()
        };
        if empty {
            self.remove_peer(peer, NegotiationState::Closed).await;
        }
        Ok(())
    }

    /// Tear the peer down. Idempotent.
    pub async fn remove_peer(&self, peer: Uuid, final_state: NegotiationState) {
        let Some(entry) = self.registry.remove(&peer).await else {
            return;
        };
        let transport = {
            let mut entry = entry.lock().await;
            entry.state = final_state;
            entry.connected = false;
            entry.pending_candidates.clear();
            entry.transport.clone()
        };
        if let Err(e) = transport.close().await {
            debug!(event = "transport_close_failed", peer = %peer, error = %e, "Transport close failed");
        }
        info!(event = "peer_removed", peer = %peer, state = ?final_state, "Peer removed");
        let _ = self.out.send(NegotiatorEvent::DeletePeer { peer });
    }

    pub async fn close_all(&self) {
        for peer in self.registry.peers().await {
            self.remove_peer(peer, NegotiationState::Closed).await;
        }
    }

    pub async fn state(&self, peer: Uuid) -> Option<NegotiationState> {
        let entry = self.registry.get(&peer).await?;
        let state = entry.lock().await.state;
        Some(state)
    }

    async fn entry(&self, peer: Uuid) -> Result<Arc<Mutex<PeerEntry>>> {
        self.registry
            .get(&peer)
            .await
            .ok_or_else(|| TransferError::UnknownPeer(peer).into())
    }

    fn signal(&self, entry: &PeerEntry, payload: SignalPayload) {
        let _ = self.out.send(NegotiatorEvent::Signal {
            to: entry.peer,
            room: entry.any_room(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::mock::MockNetwork;
    use crate::core::connection::transport::{ChannelInit, PeerEvent, TransportEvent};

    struct Side {
        id: Uuid,
        neg: ConnectionNegotiator,
        transport_rx: mpsc::UnboundedReceiver<PeerEvent>,
        out_rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
    }

    fn side(net: &MockNetwork, id: Uuid) -> Side {
        let (ttx, transport_rx) = mpsc::unbounded_channel();
        let (otx, out_rx) = mpsc::unbounded_channel();
        Side {
            id,
            neg: ConnectionNegotiator::new(
                id,
                Arc::new(net.clone()),
                ConnectionRegistry::default(),
                ttx,
                otx,
            ),
            transport_rx,
            out_rx,
        }
    }

    /// Handle everything `me` has pending; returns whether anything happened.
    async fn step(me: &mut Side, other: &mut Side) -> bool {
        let rtc = RtcConfig::default();
        let mut progressed = false;
        while let Ok(ev) = me.transport_rx.try_recv() {
            progressed = true;
            match ev.event {
                TransportEvent::NegotiationNeeded => {
                    me.neg.handle_negotiation_needed(ev.peer).await.unwrap()
                }
                TransportEvent::IceCandidate(c) => {
                    me.neg.handle_local_candidate(ev.peer, c).await.unwrap()
                }
                TransportEvent::IceConnectionState(s) => {
                    me.neg.handle_ice_state(ev.peer, s).await.unwrap()
                }
                TransportEvent::ConnectionState(s) => {
                    me.neg.handle_connection_state(ev.peer, s).await.unwrap()
                }
                TransportEvent::DataChannel(_) => {}
            }
        }
        while let Ok(ev) = me.out_rx.try_recv() {
            progressed = true;
            if let NegotiatorEvent::Signal { payload, .. } = ev {
                match payload {
                    SignalPayload::Description(d) => {
                        other
                            .neg
                            .handle_description(me.id, [0u8; 32], "room", &rtc, d)
                            .await
                            .unwrap();
                    }
                    SignalPayload::Candidate(c) => {
                        other.neg.handle_candidate(me.id, c).await.unwrap();
                    }
                }
            }
        }
        progressed
    }

    /// Pump transport and signaling events between two sides until quiet.
    async fn pump(a: &mut Side, b: &mut Side) {
        loop {
            let forward = step(a, b).await;
            let backward = step(b, a).await;
            if !forward && !backward {
                break;
            }
        }
    }

    fn init() -> ChannelInit {
        ChannelInit {
            ordered: false,
            max_retransmits: Some(10),
        }
    }

    #[test]
    fn test_exactly_one_polite() {
        for _ in 0..64 {
            let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
            let roles = (role_for(a, b), role_for(b, a));
            assert!(matches!(
                roles,
                (Role::Polite, Role::Impolite) | (Role::Impolite, Role::Polite)
            ));
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let net = MockNetwork::new();
        let s = side(&net, Uuid::new_v4());
        let peer = Uuid::new_v4();
        let rtc = RtcConfig::default();

        let first = s.neg.connect(peer, [1; 32], "r1", &rtc, true).await.unwrap();
        let second = s.neg.connect(peer, [1; 32], "r2", &rtc, true).await.unwrap();
        assert!(Arc::ptr_eq(&first.transport, &second.transport));
        assert_eq!(s.neg.registry().peers().await.len(), 1);

        let entry = s.neg.registry().get(&peer).await.unwrap();
        let rooms: Vec<_> = entry.lock().await.rooms.iter().cloned().collect();
        assert_eq!(rooms, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[tokio::test]
    async fn test_single_offer_connects() {
        let net = MockNetwork::new();
        let mut a = side(&net, Uuid::new_v4());
        let mut b = side(&net, Uuid::new_v4());
        let rtc = RtcConfig::default();

        let conn = a.neg.connect(b.id, [0; 32], "room", &rtc, true).await.unwrap();
        conn.transport.create_data_channel("signaling", init()).await.unwrap();
        pump(&mut a, &mut b).await;

        assert_eq!(a.neg.state(b.id).await, Some(NegotiationState::Stable));
        assert_eq!(b.neg.state(a.id).await, Some(NegotiationState::Stable));
        assert!(net.transport(a.id, b.id).unwrap().is_connected());
        assert!(net.transport(b.id, a.id).unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_simultaneous_offers_settle() {
        for _ in 0..8 {
            let net = MockNetwork::new();
            let mut a = side(&net, Uuid::new_v4());
            let mut b = side(&net, Uuid::new_v4());
            let rtc = RtcConfig::default();

            let ta = a.neg.connect(b.id, [0; 32], "room", &rtc, true).await.unwrap();
            let tb = b.neg.connect(a.id, [0; 32], "room", &rtc, true).await.unwrap();
            ta.transport.create_data_channel("signaling", init()).await.unwrap();
            tb.transport.create_data_channel("signaling", init()).await.unwrap();

            // Both sides make their offer before seeing the other's.
            let ev_a = a.transport_rx.recv().await.unwrap();
            let ev_b = b.transport_rx.recv().await.unwrap();
            a.neg.handle_negotiation_needed(ev_a.peer).await.unwrap();
            b.neg.handle_negotiation_needed(ev_b.peer).await.unwrap();

            let offer_from = |s: &mut Side| loop {
                match s.out_rx.try_recv() {
                    Ok(NegotiatorEvent::Signal {
                        payload: SignalPayload::Description(d),
                        ..
                    }) => break d,
                    Ok(_) => continue,
                    Err(_) => panic!("no offer"),
                }
            };
            let offer_a = offer_from(&mut a);
            let offer_b = offer_from(&mut b);

            let out_b = b
                .neg
                .handle_description(a.id, [0; 32], "room", &rtc, offer_a)
                .await
                .unwrap();
            let out_a = a
                .neg
                .handle_description(b.id, [0; 32], "room", &rtc, offer_b)
                .await
                .unwrap();

            let (polite_outcome, impolite_outcome) = if role_for(a.id, b.id) == Role::Polite {
                (out_a, out_b)
            } else {
                (out_b, out_a)
            };
            assert_eq!(polite_outcome, DescriptionOutcome::RolledBack);
            assert_eq!(impolite_outcome, DescriptionOutcome::Ignored);

            pump(&mut a, &mut b).await;
            let ta = net.transport(a.id, b.id).unwrap();
            let tb = net.transport(b.id, a.id).unwrap();
            assert_eq!(ta.signaling_state(), SignalingState::Stable);
            assert_eq!(tb.signaling_state(), SignalingState::Stable);
            assert!(ta.is_connected() && tb.is_connected());
        }
    }

    #[tokio::test]
    async fn test_candidates_queue_until_stable_in_order() {
        let net = MockNetwork::new();
        let b = side(&net, Uuid::new_v4());
        let a_id = Uuid::new_v4();
        let rtc = RtcConfig::default();
        b.neg.connect(a_id, [0; 32], "room", &rtc, false).await.unwrap();

        let cand = |n: u8| IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        for n in 0..3 {
            b.neg.handle_candidate(a_id, cand(n)).await.unwrap();
        }
        let entry = b.neg.registry().get(&a_id).await.unwrap();
        assert_eq!(entry.lock().await.pending_candidates(), 3);

        let offer = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "remote".into(),
        };
        let outcome = b
            .neg
            .handle_description(a_id, [0; 32], "room", &rtc, offer)
            .await
            .unwrap();
        assert_eq!(outcome, DescriptionOutcome::Answered);
        assert_eq!(entry.lock().await.pending_candidates(), 0);

        let applied = net.transport(b.id, a_id).unwrap().applied_candidates();
        let names: Vec<_> = applied.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(names, ["candidate:0", "candidate:1", "candidate:2"]);
    }

    #[tokio::test]
    async fn test_ice_failure_restarts_instead_of_teardown() {
        let net = MockNetwork::new();
        let mut a = side(&net, Uuid::new_v4());
        let mut b = side(&net, Uuid::new_v4());
        let rtc = RtcConfig::default();
        let conn = a.neg.connect(b.id, [0; 32], "room", &rtc, true).await.unwrap();
        conn.transport.create_data_channel("signaling", init()).await.unwrap();
        pump(&mut a, &mut b).await;

        assert!(net.fail_ice(a.id, b.id));
        pump(&mut a, &mut b).await;

        assert_eq!(net.transport(a.id, b.id).unwrap().ice_restarts(), 1);
        assert!(a.neg.registry().contains(&b.id).await);
        assert_eq!(a.neg.state(b.id).await, Some(NegotiationState::Stable));
    }

    #[tokio::test]
    async fn test_terminal_state_deletes_peer() {
        let net = MockNetwork::new();
        let mut a = side(&net, Uuid::new_v4());
        let mut b = side(&net, Uuid::new_v4());
        let rtc = RtcConfig::default();
        let conn = a.neg.connect(b.id, [0; 32], "room", &rtc, true).await.unwrap();
        conn.transport.create_data_channel("signaling", init()).await.unwrap();
        pump(&mut a, &mut b).await;

        a.neg
            .handle_connection_state(b.id, ConnectionState::Failed)
            .await
            .unwrap();
        assert!(!a.neg.registry().contains(&b.id).await);
        let mut deleted = false;
        while let Ok(ev) = a.out_rx.try_recv() {
            if let NegotiatorEvent::DeletePeer { peer } = ev {
                deleted |= peer == b.id;
            }
        }
        assert!(deleted);
    }

    #[tokio::test]
    async fn test_leave_last_room_closes_peer() {
        let net = MockNetwork::new();
        let s = side(&net, Uuid::new_v4());
        let peer = Uuid::new_v4();
        let rtc = RtcConfig::default();
        s.neg.connect(peer, [0; 32], "r1", &rtc, false).await.unwrap();
        s.neg.connect(peer, [0; 32], "r2", &rtc, false).await.unwrap();

        s.neg.leave_room(peer, "r1").await.unwrap();
        assert!(s.neg.registry().contains(&peer).await);
        s.neg.leave_room(peer, "r2").await.unwrap();
        assert!(!s.neg.registry().contains(&peer).await);
    }
}
