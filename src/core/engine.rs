//! Node: owns every component and runs the event loop that connects them.
//!
//! All transport callbacks, channel events, receiver output and signaling
//! envelopes arrive on mpsc channels and are dispatched from one loop.
//! Handler errors are logged at the dispatch boundary and never stop the
//! loop.
//!
//! ```text
//!   signaling ──► negotiator ──► transport events ──┐
//!                     ▲                              ▼
//!                     └──────── signals ◄─────── Node loop ──► NodeEvent
//!   channels ──► ChannelNotice ──► receiver / ack tracker ──┘
//! ```

use crate::core::config::{NodeConfig, MAIN_CHANNEL_LABEL, SIGNALING_CHANNEL_LABEL};
use crate::core::connection::channels::{short, ChannelManager, ChannelNotice, ChannelSignal};
use crate::core::connection::negotiator::{
    ConnectionNegotiator, ConnectionRegistry, NegotiationState, NegotiatorEvent, SignalPayload,
};
use crate::core::connection::send_queue::MemorySendQueue;
use crate::core::connection::transport::{ChannelMessage, PeerEvent, PeerTransportFactory, TransportEvent};
use crate::core::error::{TransferError, TransferResult};
use crate::core::pipeline::ack::Ack;
use crate::core::pipeline::label::ChannelLabel;
use crate::core::pipeline::merkle::Hash;
use crate::core::pipeline::receiver::{ChunkReceiver, ReceiverOutput};
use crate::core::pipeline::sender::{AckOutcome, AckTracker, ChunkTransmitter, Recipient};
use crate::core::pipeline::splitter::{ChunkSplitter, MessageDraft, SplitParams};
use crate::core::security::Identity;
use crate::core::signaling::SignalMessage;
use crate::core::store::{self, ContentStore, MessageMeta};
use crate::utils::cancel::CancelSignal;
use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Events ───────────────────────────────────────────────────────────────────

/// Everything a node reports to its owner.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A local message was split and stored; the local copy is complete.
    MessageCreated {
        root: Hash,
        label: String,
        total_size: u64,
    },
    MessageProgress {
        peer: Uuid,
        root: Hash,
        saved: u64,
        total: u64,
    },
    SendProgress {
        peer: Uuid,
        root: Hash,
        acked: u32,
        total: u32,
    },
    /// An incoming message was reassembled and verified.
    MessageComplete { peer: Uuid, meta: MessageMeta },
    /// `peer` confirmed receipt of one of our messages.
    MessageDelivered { peer: Uuid, root: Hash },
    CorruptedTransfer {
        peer: Uuid,
        root: Hash,
        reason: String,
    },
    PeerConnected { peer: Uuid },
    DeletePeer { peer: Uuid },
}

// ── Setup ────────────────────────────────────────────────────────────────────

pub struct NodeSetup {
    pub id: Uuid,
    pub identity: Identity,
    pub config: NodeConfig,
    pub factory: Arc<dyn PeerTransportFactory>,
    pub store: Arc<dyn ContentStore>,
}

/// Both directions of the signaling connection.
pub struct SignalLink {
    pub outbound: mpsc::UnboundedSender<SignalMessage>,
    pub inbound: mpsc::UnboundedReceiver<SignalMessage>,
}

struct Inbox {
    transport: mpsc::UnboundedReceiver<PeerEvent>,
    negotiator: mpsc::UnboundedReceiver<NegotiatorEvent>,
    channels: mpsc::UnboundedReceiver<ChannelSignal>,
    receiver: mpsc::UnboundedReceiver<ReceiverOutput>,
    signaling: mpsc::UnboundedReceiver<SignalMessage>,
}

// ── Node ─────────────────────────────────────────────────────────────────────

pub struct Node {
    id: Uuid,
    identity: Arc<Identity>,
    config: NodeConfig,
    store: Arc<dyn ContentStore>,
    registry: ConnectionRegistry,
    negotiator: ConnectionNegotiator,
    channels: Arc<ChannelManager>,
    transmitter: Arc<ChunkTransmitter>,
    receiver: Arc<ChunkReceiver>,
    acks: Arc<AckTracker>,
    cancel: CancelSignal,
    rooms: RwLock<BTreeSet<String>>,
    signal_out: mpsc::UnboundedSender<SignalMessage>,
    events: mpsc::UnboundedSender<NodeEvent>,
    run_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Build a node and start its event loop.
    pub fn spawn(setup: NodeSetup, link: SignalLink) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>) {
        let NodeSetup {
            id,
            identity,
            config,
            factory,
            store,
        } = setup;
        let identity = Arc::new(identity);

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (negotiator_tx, negotiator_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let registry = ConnectionRegistry::default();
        let negotiator = ConnectionNegotiator::new(id, factory, registry.clone(), transport_tx, negotiator_tx);
        let channels = Arc::new(ChannelManager::new(
            registry.clone(),
            Arc::new(MemorySendQueue::new()),
            channel_tx,
            config.max_buffered_amount,
        ));
        let cancel = CancelSignal::new();
        let transmitter = Arc::new(ChunkTransmitter::new(identity.clone(), channels.clone(), cancel.clone()));
        let receiver = Arc::new(ChunkReceiver::new(identity.clone(), store.clone(), receiver_tx));

        let node = Arc::new(Self {
            id,
            identity,
            config,
            store,
            registry,
            negotiator,
            channels,
            transmitter,
            receiver,
            acks: Arc::new(AckTracker::new()),
            cancel,
            rooms: RwLock::new(BTreeSet::new()),
            signal_out: link.outbound,
            events: events_tx,
            run_loop: Mutex::new(None),
        });

        let inbox = Inbox {
            transport: transport_rx,
            negotiator: negotiator_rx,
            channels: channel_rx,
            receiver: receiver_rx,
            signaling: link.inbound,
        };
        let handle = tokio::spawn(node.clone().run(inbox));
        if let Ok(mut slot) = node.run_loop.try_lock() {
            *slot = Some(handle);
        }
        info!(event = "node_started", peer = %id, "Node started");
        (node, events_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public_key()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Signal shared by every outbound chunk loop of this node.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Whether the message at `root` still waits on any recipient's acks.
    pub async fn awaiting_acks(&self, root: &Hash) -> bool {
        self.acks.is_tracked(root).await
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn signal(&self, msg: SignalMessage) {
        if self.signal_out.send(msg).is_err() {
            warn!(event = "signaling_unavailable", "Signaling link closed, envelope dropped");
        }
    }

    async fn run(self: Arc<Self>, mut inbox: Inbox) {
        loop {
            let result = tokio::select! {
                Some(ev) = inbox.transport.recv() => self.on_transport(ev).await,
                Some(ev) = inbox.negotiator.recv() => self.on_negotiator(ev).await,
                Some(sig) = inbox.channels.recv() => self.on_channel_signal(sig).await,
                Some(out) = inbox.receiver.recv() => self.on_receiver(out).await,
                Some(msg) = inbox.signaling.recv() => self.on_signal(msg).await,
                else => break,
            };
            if let Err(e) = result {
                warn!(event = "handler_error", peer = %self.id, error = %e, "Event handler failed");
            }
        }
        debug!(event = "node_loop_stopped", peer = %self.id, "Node loop stopped");
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Ask the relay to put us in `room`.
    pub fn join_room(&self, room: &str) {
        self.signal(SignalMessage::RoomId {
            room_id: room.to_owned(),
        });
    }

    /// Leave `room`: channels serving only that room close, and peers left
    /// with no shared room are disconnected.
    pub async fn leave_room(&self, room: &str) -> Result<()> {
        self.rooms.write().await.remove(room);
        for peer in self.registry.peers().await {
            let serves = match self.registry.get(&peer).await {
                Some(entry) => entry.lock().await.rooms.contains(room),
                None => false,
            };
            if !serves {
                continue;
            }
            let closed = self.channels.release_room(peer, room).await;
            debug!(event = "room_released", peer = %peer, room = %room, channels = closed.len(), "Room released");
            self.negotiator.leave_room(peer, room).await?;
        }
        Ok(())
    }

    /// Split, store and send a message. With `to == None` it goes to every
    /// connected peer. Returns the message's Merkle root.
    pub async fn send_message(&self, draft: MessageDraft, to: Option<Uuid>) -> TransferResult<Hash> {
        let recipients = match to {
            Some(peer) => vec![peer],
            None => self.registry.peers().await,
        };
        let mut targets = Vec::with_capacity(recipients.len());
        for peer in recipients {
            let public_key = self
                .registry
                .public_key(&peer)
                .await
                .ok_or(TransferError::UnknownPeer(peer))?;
            targets.push(Recipient { peer, public_key });
        }

        let params = SplitParams::from(&self.config);
        let message = tokio::task::spawn_blocking(move || ChunkSplitter::split(&draft, &params))
            .await
            .map_err(|e| TransferError::AllocationFailed(e.to_string()))??;
        let message = Arc::new(message);

        let label = ChannelLabel::new(MAIN_CHANNEL_LABEL, message.root, message.content_hash, message.created_at)?
            .compile();
        message.persist(self.store.as_ref(), self.id, &label).await?;
        info!(
            event = "message_created",
            root = %hex::encode(&message.root[..8]),
            bytes = message.total_size,
            chunks = message.total_chunks,
            recipients = targets.len(),
            "Message created"
        );
        self.emit(NodeEvent::MessageCreated {
            root: message.root,
            label: label.clone(),
            total_size: message.total_size,
        });

        let peers: Vec<Uuid> = targets.iter().map(|r| r.peer).collect();
        self.acks.register(message.clone(), &label, &peers).await;

        for recipient in targets {
            let transmitter = self.transmitter.clone();
            let channels = self.channels.clone();
            let acks = self.acks.clone();
            let message = message.clone();
            let label = label.clone();
            tokio::spawn(async move {
                let report = transmitter.transmit(&message, &label, &recipient).await;
                if report.cancelled {
                    // No ack will follow; release the cached chunks and the channel.
                    acks.abandon(&message.root, recipient.peer).await;
                    channels.close_channel(recipient.peer, &label).await;
                }
            });
        }
        Ok(message.root)
    }

    /// Reassemble a stored message by index.
    pub async fn read_message(&self, root: &Hash) -> TransferResult<Vec<u8>> {
        store::read_message(self.store.as_ref(), root).await
    }

    pub async fn message_meta(&self, root: &Hash) -> TransferResult<Option<MessageMeta>> {
        self.store.get_message_meta(root).await
    }

    /// Close every peer and stop the event loop.
    pub async fn shutdown(&self) {
        self.negotiator.close_all().await;
        if let Some(handle) = self.run_loop.lock().await.take() {
            handle.abort();
        }
        info!(event = "node_stopped", peer = %self.id, "Node stopped");
    }

    // ── Transport ────────────────────────────────────────────────────────────

    async fn on_transport(&self, ev: PeerEvent) -> Result<()> {
        let PeerEvent { peer, event } = ev;
        match event {
            TransportEvent::NegotiationNeeded => self.negotiator.handle_negotiation_needed(peer).await,
            TransportEvent::IceCandidate(c) => self.negotiator.handle_local_candidate(peer, c).await,
            TransportEvent::IceConnectionState(s) => self.negotiator.handle_ice_state(peer, s).await,
            TransportEvent::ConnectionState(s) => self.negotiator.handle_connection_state(peer, s).await,
            TransportEvent::DataChannel(channel) => {
                let label = channel.label().to_owned();
                self.channels.adopt_channel(peer, channel).await;
                self.serve_peer_rooms(peer, &label).await;
                Ok(())
            }
        }
    }

    async fn serve_peer_rooms(&self, peer: Uuid, label: &str) {
        let rooms: Vec<String> = match self.registry.get(&peer).await {
            Some(entry) => entry.lock().await.rooms.iter().cloned().collect(),
            None => return,
        };
        for room in rooms {
            self.channels.serve_room(peer, label, &room).await;
        }
    }

    async fn open_channel(&self, peer: Uuid, label: &str) -> Result<()> {
        self.channels.open_channel(peer, label).await?;
        self.serve_peer_rooms(peer, label).await;
        Ok(())
    }

    // ── Negotiator ───────────────────────────────────────────────────────────

    async fn on_negotiator(&self, ev: NegotiatorEvent) -> Result<()> {
        match ev {
            NegotiatorEvent::Signal { to, room, payload } => {
                let msg = match payload {
                    SignalPayload::Description(description) => SignalMessage::Description {
                        from_peer_id: self.id,
                        from_peer_public_key: self.identity.public_key(),
                        to_peer_id: to,
                        room_id: room.unwrap_or_default(),
                        description,
                    },
                    SignalPayload::Candidate(candidate) => SignalMessage::Candidate {
                        from_peer_id: self.id,
                        to_peer_id: to,
                        room_id: room,
                        candidate,
                    },
                };
                self.signal(msg);
                Ok(())
            }
            NegotiatorEvent::PeerConnected { peer, initiator } => {
                self.emit(NodeEvent::PeerConnected { peer });
                if initiator {
                    self.open_channel(peer, MAIN_CHANNEL_LABEL).await?;
                }
                Ok(())
            }
            NegotiatorEvent::DeletePeer { peer } => {
                self.channels.remove_peer(peer).await;
                self.receiver.remove_peer(peer).await;
                self.acks.forget_peer(peer).await;
                self.emit(NodeEvent::DeletePeer { peer });
                Ok(())
            }
        }
    }

    // ── Channels ─────────────────────────────────────────────────────────────

    async fn on_channel_signal(&self, sig: ChannelSignal) -> Result<()> {
        let Some(notice) = self.channels.handle_signal(sig).await else {
            return Ok(());
        };
        match notice {
            ChannelNotice::Opened { peer, label } => {
                debug!(event = "channel_open", peer = %peer, label = %short(&label), "Channel open");
            }
            ChannelNotice::Message {
                peer,
                label,
                message: ChannelMessage::Binary(frame),
            } => {
                let sender_pk = self
                    .registry
                    .public_key(&peer)
                    .await
                    .ok_or(TransferError::UnknownPeer(peer))?;
                self.receiver.enqueue(peer, sender_pk, &label, frame).await;
            }
            ChannelNotice::Message {
                peer,
                message: ChannelMessage::Text(text),
                ..
            } => {
                let ack = Ack::from_json(&text)?;
                self.on_ack(peer, ack).await;
            }
            ChannelNotice::Closed { peer, label } => {
                debug!(event = "channel_gone", peer = %peer, label = %short(&label), "Channel closed");
            }
            ChannelNotice::PeerRemoved { peer } => {
                self.negotiator.remove_peer(peer, NegotiationState::Closed).await;
            }
        }
        Ok(())
    }

    // ── Receiver / acks ──────────────────────────────────────────────────────

    async fn on_receiver(&self, out: ReceiverOutput) -> Result<()> {
        match out {
            ReceiverOutput::Ack { peer, ack } => self.deliver_ack(peer, ack).await,
            ReceiverOutput::Progress {
                peer,
                root,
                saved,
                total,
            } => self.emit(NodeEvent::MessageProgress {
                peer,
                root,
                saved,
                total,
            }),
            ReceiverOutput::Complete { peer, meta } => self.emit(NodeEvent::MessageComplete { peer, meta }),
            ReceiverOutput::Corrupted { peer, root, reason } => {
                warn!(event = "corrupted_transfer", peer = %peer, root = %hex::encode(&root[..8]), reason = %reason, "Transfer corrupted");
                self.emit(NodeEvent::CorruptedTransfer { peer, root, reason });
            }
        }
        Ok(())
    }

    /// Acks go back on the message's channel; the relay is the fallback.
    async fn deliver_ack(&self, peer: Uuid, ack: Ack) {
        let text = ack.to_json();
        if self.channels.send_text(peer, &ack.label, text.clone()).await.is_ok() {
            return;
        }
        debug!(event = "ack_relayed", peer = %peer, label = %short(&ack.label), "No open channel, ack relayed");
        self.signal(SignalMessage::Message {
            from_peer_id: self.id,
            to_peer_id: peer,
            room_id: None,
            message: text,
        });
    }

    async fn on_ack(&self, peer: Uuid, ack: Ack) {
        match self.acks.handle_ack(peer, &ack).await {
            AckOutcome::ChunkAcked {
                peer,
                root,
                acked,
                total,
            } => self.emit(NodeEvent::SendProgress {
                peer,
                root,
                acked,
                total,
            }),
            AckOutcome::MessageComplete {
                peer,
                root,
                label,
                purged,
            } => {
                info!(event = "message_delivered", peer = %peer, root = %hex::encode(&root[..8]), purged, "Message delivered");
                self.channels.close_channel(peer, &label).await;
                self.emit(NodeEvent::MessageDelivered { peer, root });
            }
            AckOutcome::Duplicate => {
                debug!(event = "ack_duplicate", peer = %peer, "Duplicate ack");
            }
            AckOutcome::Unknown => {
                debug!(event = "ack_unknown", peer = %peer, label = %short(&ack.label), "Unrecognised ack ignored");
            }
        }
    }

    // ── Signaling ────────────────────────────────────────────────────────────

    fn answer_challenge(&self, challenge: &str) {
        self.signal(SignalMessage::Signature {
            peer_id: self.id,
            public_key: self.identity.public_key(),
            signature: self.identity.sign(challenge.as_bytes()),
        });
    }

    async fn on_signal(&self, msg: SignalMessage) -> Result<()> {
        match msg {
            SignalMessage::PeerId { peer_id, challenge } => {
                if peer_id != self.id {
                    warn!(event = "peer_id_mismatch", assigned = %peer_id, local = %self.id, "Relay echoed a different peer id");
                }
                self.answer_challenge(&challenge);
            }
            SignalMessage::Challenge { challenge } => self.answer_challenge(&challenge),
            SignalMessage::RoomId { room_id } => {
                info!(event = "room_joined", room = %room_id, "Joined room");
                self.rooms.write().await.insert(room_id.clone());
                self.signal(SignalMessage::Peers {
                    room_id,
                    peers: Vec::new(),
                });
            }
            SignalMessage::Peers { room_id, peers } => {
                for info in peers.into_iter().filter(|p| p.peer_id != self.id) {
                    let peer = info.peer_id;
                    if let Err(e) = self
                        .negotiator
                        .connect(peer, info.public_key, &room_id, &self.config.rtc, true)
                        .await
                    {
                        warn!(event = "peer_connect_failed", peer = %peer, room = %room_id, error = %e, "Could not connect to room member");
                        continue;
                    }
                    // The bootstrap channel is what triggers the first offer.
                    if let Err(e) = self.open_channel(peer, SIGNALING_CHANNEL_LABEL).await {
                        warn!(event = "bootstrap_channel_failed", peer = %peer, error = %e, "Could not open signaling channel");
                    }
                }
            }
            SignalMessage::Description {
                from_peer_id,
                from_peer_public_key,
                to_peer_id,
                room_id,
                description,
            } => {
                if to_peer_id != self.id {
                    return Ok(());
                }
                let outcome = self
                    .negotiator
                    .handle_description(from_peer_id, from_peer_public_key, &room_id, &self.config.rtc, description)
                    .await?;
                debug!(event = "description_handled", peer = %from_peer_id, outcome = ?outcome, "Description handled");
            }
            SignalMessage::Candidate {
                from_peer_id,
                to_peer_id,
                candidate,
                ..
            } => {
                if to_peer_id == self.id {
                    self.negotiator.handle_candidate(from_peer_id, candidate).await?;
                }
            }
            SignalMessage::Message {
                from_peer_id, message, ..
            } => {
                let ack = Ack::from_json(&message)?;
                self.on_ack(from_peer_id, ack).await;
            }
            SignalMessage::Connection {
                from_peer_id,
                from_peer_public_key,
                room_id,
                ..
            } => {
                self.negotiator
                    .connect(from_peer_id, from_peer_public_key, &room_id, &self.config.rtc, false)
                    .await?;
            }
            SignalMessage::Ping => self.signal(SignalMessage::Pong),
            SignalMessage::Pong => debug!(event = "signaling_pong", "Pong"),
            SignalMessage::Error { message } => {
                warn!(event = "signaling_error", message = %message, "Relay reported an error");
            }
            SignalMessage::Signature { .. } => {}
        }
        Ok(())
    }
}
