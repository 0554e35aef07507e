//! Channel manager: one data channel per `(peer, label)` with backpressure.
//!
//! Sends go straight to the wire while the channel's buffered amount is
//! under the high-water mark. Anything else (channel still connecting,
//! closed, or buffer full) lands in the [`SendQueue`]. The queue drains on
//! `open` and on `bufferedamountlow`, one random item at a time with a small
//! random delay, until the buffer fills again or the queue empties.
//!
//! Channel events reach the engine as [`ChannelSignal`]s and come back in
//! through [`ChannelManager::handle_signal`], so handler code never runs
//! inside transport callbacks.

use crate::core::config::{
    BUFFERED_AMOUNT_LOW_THRESHOLD, CHANNEL_MAX_RETRANSMITS, SEND_QUEUE_MAX_JITTER,
    SIGNALING_CHANNEL_LABEL,
};
use crate::core::connection::negotiator::ConnectionRegistry;
use crate::core::connection::send_queue::SendQueue;
use crate::core::connection::transport::{
    ChannelEvent, ChannelInit, ChannelMessage, ChannelState, DataChannel,
};
use crate::core::error::{TransferError, TransferResult};
use bytes::Bytes;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Raw event from one installed channel.
#[derive(Debug)]
pub struct ChannelSignal {
    pub peer: Uuid,
    pub label: String,
    /// Installation the event came from; stale close events are ignored.
    pub generation: u64,
    pub event: ChannelEvent,
}

pub type ChannelSignalSender = mpsc::UnboundedSender<ChannelSignal>;

/// What the engine needs to act on after a channel event.
#[derive(Debug)]
pub enum ChannelNotice {
    Opened { peer: Uuid, label: String },
    Message { peer: Uuid, label: String, message: ChannelMessage },
    Closed { peer: Uuid, label: String },
    /// The bootstrap channel went away; the whole peer must be removed.
    PeerRemoved { peer: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    NotFound,
    Closed,
    PeerRemoved,
}

struct ChannelEntry {
    channel: Arc<dyn DataChannel>,
    generation: u64,
    rooms: BTreeSet<String>,
    draining: Arc<AtomicBool>,
}

/// Owns every installed channel, keyed by `(peer, label)`.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<(Uuid, String), ChannelEntry>>,
}

impl ChannelRegistry {
    pub async fn get(&self, peer: Uuid, label: &str) -> Option<Arc<dyn DataChannel>> {
        self.channels
            .read()
            .await
            .get(&(peer, label.to_owned()))
            .map(|e| e.channel.clone())
    }

    pub async fn labels(&self, peer: Uuid) -> Vec<String> {
        self.channels
            .read()
            .await
            .keys()
            .filter(|(p, _)| *p == peer)
            .map(|(_, l)| l.clone())
            .collect()
    }

    async fn is_current(&self, peer: Uuid, label: &str, generation: u64) -> bool {
        self.channels
            .read()
            .await
            .get(&(peer, label.to_owned()))
            .is_some_and(|e| e.generation == generation)
    }

    async fn draining_flag(&self, peer: Uuid, label: &str) -> Option<(Arc<dyn DataChannel>, Arc<AtomicBool>)> {
        self.channels
            .read()
            .await
            .get(&(peer, label.to_owned()))
            .map(|e| (e.channel.clone(), e.draining.clone()))
    }

    async fn remove(&self, peer: Uuid, label: &str) -> Option<ChannelEntry> {
        self.channels.write().await.remove(&(peer, label.to_owned()))
    }
}

pub struct ChannelManager {
    connections: ConnectionRegistry,
    channels: ChannelRegistry,
    queue: Arc<dyn SendQueue>,
    signals: ChannelSignalSender,
    max_buffered: usize,
    next_generation: AtomicU64,
}

fn is_gone(state: ChannelState) -> bool {
    matches!(state, ChannelState::Closing | ChannelState::Closed)
}

impl ChannelManager {
    pub fn new(
        connections: ConnectionRegistry,
        queue: Arc<dyn SendQueue>,
        signals: ChannelSignalSender,
        max_buffered: usize,
    ) -> Self {
        Self {
            connections,
            channels: ChannelRegistry::default(),
            queue,
            signals,
            max_buffered,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Create (or reuse) the channel `label` to `peer`.
    pub async fn open_channel(&self, peer: Uuid, label: &str) -> TransferResult<Arc<dyn DataChannel>> {
        if let Some(existing) = self.channels.get(peer, label).await {
            if !is_gone(existing.state()) {
                return Ok(existing);
            }
        }

        let transport = self
            .connections
            .transport(&peer)
            .await
            .ok_or(TransferError::UnknownPeer(peer))?;
        let init = ChannelInit {
            ordered: false,
            max_retransmits: Some(CHANNEL_MAX_RETRANSMITS),
        };
        let channel = transport.create_data_channel(label, init).await.map_err(|e| {
            warn!(event = "channel_create_failed", peer = %peer, label = %label, error = %e, "Data channel creation failed");
            TransferError::ConnectionFailed(peer)
        })?;

        self.install(peer, channel.clone()).await;
        info!(event = "channel_opened", peer = %peer, label = %short(label), "Data channel opened");
        Ok(channel)
    }

    /// Take over a channel the remote side opened.
    pub async fn adopt_channel(&self, peer: Uuid, channel: Arc<dyn DataChannel>) {
        info!(event = "channel_adopted", peer = %peer, label = %short(channel.label()), "Remote data channel adopted");
        self.install(peer, channel).await;
    }

    async fn install(&self, peer: Uuid, channel: Arc<dyn DataChannel>) {
        let label = channel.label().to_owned();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        channel
            .set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
            .await;

        // Register before attaching so events from the backlog find the entry.
        let previous = self.channels.channels.write().await.insert(
            (peer, label.clone()),
            ChannelEntry {
                channel: channel.clone(),
                generation,
                rooms: BTreeSet::new(),
                draining: Arc::new(AtomicBool::new(false)),
            },
        );
        if let Some(previous) = previous {
            debug!(event = "channel_replaced", peer = %peer, label = %short(&label), old = previous.generation, new = generation, "Channel replaced");
        }

        let signals = self.signals.clone();
        channel.attach(Arc::new(move |event| {
            let _ = signals.send(ChannelSignal {
                peer,
                label: label.clone(),
                generation,
                event,
            });
        }));
    }

    /// Route a channel event. Drains run as their own tasks.
    pub async fn handle_signal(self: &Arc<Self>, signal: ChannelSignal) -> Option<ChannelNotice> {
        let ChannelSignal {
            peer,
            label,
            generation,
            event,
        } = signal;
        match event {
            ChannelEvent::Open => {
                self.spawn_drain(peer, label.clone());
                Some(ChannelNotice::Opened { peer, label })
            }
            ChannelEvent::BufferedAmountLow => {
                self.spawn_drain(peer, label);
                None
            }
            ChannelEvent::Message(message) => Some(ChannelNotice::Message {
                peer,
                label,
                message,
            }),
            ChannelEvent::Closed => self.teardown(peer, label, generation).await,
            ChannelEvent::Error(reason) => {
                warn!(event = "channel_error", peer = %peer, label = %short(&label), reason = %reason, "Data channel error, tearing down");
                self.teardown(peer, label, generation).await
            }
        }
    }

    async fn teardown(&self, peer: Uuid, label: String, generation: u64) -> Option<ChannelNotice> {
        if !self.channels.is_current(peer, &label, generation).await {
            return None;
        }
        match self.close_channel(peer, &label).await {
            CloseOutcome::PeerRemoved => Some(ChannelNotice::PeerRemoved { peer }),
            _ => Some(ChannelNotice::Closed { peer, label }),
        }
    }

    /// Send a frame, queueing it when the channel cannot take it now.
    pub async fn send(&self, peer: Uuid, label: &str, frame: Bytes) -> TransferResult<SendOutcome> {
        let channel = match self.channels.get(peer, label).await {
            Some(ch) if !is_gone(ch.state()) => ch,
            _ => {
                // Queue first: the open event drains the queue.
                self.queue.push(peer, label, frame).await;
                if let Err(e) = self.open_channel(peer, label).await {
                    self.queue.clear(peer, Some(label)).await;
                    return Err(e);
                }
                return Ok(SendOutcome::Queued);
            }
        };

        if channel.state() != ChannelState::Open
            || channel.buffered_amount().await >= self.max_buffered
        {
            self.queue.push(peer, label, frame).await;
            return Ok(SendOutcome::Queued);
        }

        match channel.send(frame.clone()).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(e) => {
                debug!(event = "send_deferred", peer = %peer, label = %short(label), error = %e, "Send failed, frame queued");
                self.queue.push(peer, label, frame).await;
                Ok(SendOutcome::Queued)
            }
        }
    }

    /// Send a short text message on an open channel. Never queued.
    pub async fn send_text(&self, peer: Uuid, label: &str, text: String) -> TransferResult<()> {
        let closed = || TransferError::ChannelClosed {
            peer,
            label: label.to_owned(),
        };
        let channel = self.channels.get(peer, label).await.ok_or_else(closed)?;
        if channel.state() != ChannelState::Open {
            return Err(closed());
        }
        channel.send_text(text).await.map_err(|_| closed())
    }

    fn spawn_drain(self: &Arc<Self>, peer: Uuid, label: String) {
        let manager = self.clone();
        tokio::spawn(async move { manager.drain(peer, &label).await });
    }

    /// Drain queued frames for `(peer, label)`. At most one drain runs per
    /// channel; a second caller returns immediately.
    pub async fn drain(&self, peer: Uuid, label: &str) -> usize {
        let Some((channel, draining)) = self.channels.draining_flag(peer, label).await else {
            return 0;
        };
        if draining.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let mut sent = 0;
        while channel.state() == ChannelState::Open
            && channel.buffered_amount().await < self.max_buffered
        {
            let Some(item) = self.queue.take_random(peer, label).await else {
                break;
            };
            let jitter = rand::thread_rng().gen_range(0..=SEND_QUEUE_MAX_JITTER.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            if let Err(e) = channel.send(item.frame.clone()).await {
                debug!(event = "drain_interrupted", peer = %peer, label = %short(label), error = %e, "Drain interrupted");
                // A frame for a channel that was closed or replaced is obsolete.
                let current = self
                    .channels
                    .draining_flag(peer, label)
                    .await
                    .is_some_and(|(_, flag)| Arc::ptr_eq(&flag, &draining));
                if current {
                    self.queue.restore(item).await;
                }
                break;
            }
            sent += 1;
        }
        draining.store(false, Ordering::Release);

        if sent > 0 {
            let left = self.queue.len(peer, label).await;
            debug!(event = "send_queue_drained", peer = %peer, label = %short(label), sent, left, "Send queue drained");
        }
        sent
    }

    pub async fn is_draining(&self, peer: Uuid, label: &str) -> bool {
        self.channels
            .draining_flag(peer, label)
            .await
            .is_some_and(|(_, flag)| flag.load(Ordering::Acquire))
    }

    pub async fn queued(&self, peer: Uuid, label: &str) -> usize {
        self.queue.len(peer, label).await
    }

    /// Forget queued frames for a channel whose transfer is over.
    pub async fn discard_queued(&self, peer: Uuid, label: &str) -> usize {
        self.queue.clear(peer, Some(label)).await
    }

    /// Detach handlers, then close. Frames still queued for the channel are
    /// dropped. Closing the bootstrap channel takes every other channel of
    /// the peer with it.
    pub async fn close_channel(&self, peer: Uuid, label: &str) -> CloseOutcome {
        let found = self.channels.remove(peer, label).await;
        let dropped = self.queue.clear(peer, Some(label)).await;
        if dropped > 0 {
            debug!(event = "send_queue_dropped", peer = %peer, label = %short(label), dropped, "Queued frames dropped with channel");
        }
        if let Some(entry) = &found {
            entry.channel.detach();
            if let Err(e) = entry.channel.close().await {
                debug!(event = "channel_close_failed", peer = %peer, label = %short(label), error = %e, "Channel close failed");
            }
            info!(event = "channel_closed", peer = %peer, label = %short(label), "Data channel closed");
        }

        if label == SIGNALING_CHANNEL_LABEL {
            self.remove_peer(peer).await;
            return CloseOutcome::PeerRemoved;
        }
        if found.is_some() {
            CloseOutcome::Closed
        } else {
            CloseOutcome::NotFound
        }
    }

    /// Close every channel of `peer` and drop its queue.
    pub async fn remove_peer(&self, peer: Uuid) {
        for label in self.channels.labels(peer).await {
            if let Some(entry) = self.channels.remove(peer, &label).await {
                entry.channel.detach();
                let _ = entry.channel.close().await;
            }
        }
        let dropped = self.queue.clear(peer, None).await;
        if dropped > 0 {
            debug!(event = "send_queue_dropped", peer = %peer, dropped, "Queued frames dropped with peer");
        }
    }

    /// Record that `label` serves `room`.
    pub async fn serve_room(&self, peer: Uuid, label: &str, room: &str) {
        if let Some(entry) = self
            .channels
            .channels
            .write()
            .await
            .get_mut(&(peer, label.to_owned()))
        {
            entry.rooms.insert(room.to_owned());
        }
    }

    /// Drop `room` from every channel of `peer`; channels left serving no
    /// room are closed. The bootstrap channel is left to peer teardown.
    pub async fn release_room(&self, peer: Uuid, room: &str) -> Vec<String> {
        let emptied: Vec<String> = {
            let mut channels = self.channels.channels.write().await;
            channels
                .iter_mut()
                .filter(|((p, l), _)| *p == peer && l != SIGNALING_CHANNEL_LABEL)
                .filter_map(|((_, l), e)| (e.rooms.remove(room) && e.rooms.is_empty()).then(|| l.clone()))
                .collect()
        };
        for label in &emptied {
            self.close_channel(peer, label).await;
        }
        emptied
    }
}

/// Compiled labels are long; logs only need their head.
pub fn short(label: &str) -> &str {
    label.get(..24).unwrap_or(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{RtcConfig, MAX_BUFFERED_AMOUNT};
    use crate::core::connection::mock::MockNetwork;
    use crate::core::connection::negotiator::ConnectionNegotiator;
    use crate::core::connection::send_queue::MemorySendQueue;
    use crate::core::connection::transport::{PeerEvent, TransportEvent};
    use tokio::time::timeout;

    struct Fixture {
        id: Uuid,
        manager: Arc<ChannelManager>,
        signals: mpsc::UnboundedReceiver<ChannelSignal>,
        transport_rx: mpsc::UnboundedReceiver<PeerEvent>,
        _neg: ConnectionNegotiator,
    }

    async fn fixture(net: &MockNetwork, id: Uuid, peer: Uuid) -> Fixture {
        let (ttx, transport_rx) = mpsc::unbounded_channel();
        let (otx, _orx) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::default();
        let neg = ConnectionNegotiator::new(id, Arc::new(net.clone()), registry.clone(), ttx, otx);
        neg.connect(peer, [0; 32], "room", &RtcConfig::default(), false)
            .await
            .unwrap();
        let (stx, signals) = mpsc::unbounded_channel();
        let manager = Arc::new(ChannelManager::new(
            registry,
            Arc::new(MemorySendQueue::new()),
            stx,
            MAX_BUFFERED_AMOUNT,
        ));
        Fixture {
            id,
            manager,
            signals,
            transport_rx,
            _neg: neg,
        }
    }

    /// Two managers over a connected mock link.
    async fn connected() -> (MockNetwork, Fixture, Fixture) {
        let net = MockNetwork::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let fa = fixture(&net, a, b).await;
        let fb = fixture(&net, b, a).await;

        let ta = net.transport(a, b).unwrap();
        let tb = net.transport(b, a).unwrap();
        use crate::core::connection::transport::PeerTransport;
        let offer = ta.create_offer(false).await.unwrap();
        ta.set_local_description(offer.clone()).await.unwrap();
        tb.set_remote_description(offer).await.unwrap();
        let answer = tb.create_answer().await.unwrap();
        tb.set_local_description(answer.clone()).await.unwrap();
        ta.set_remote_description(answer).await.unwrap();
        (net, fa, fb)
    }

    /// Adopt channels announced to `f` and handle its pending signals.
    async fn settle(f: &mut Fixture) -> Vec<ChannelNotice> {
        while let Ok(ev) = f.transport_rx.try_recv() {
            if let TransportEvent::DataChannel(ch) = ev.event {
                f.manager.adopt_channel(ev.peer, ch).await;
            }
        }
        let mut notices = Vec::new();
        while let Ok(sig) = f.signals.try_recv() {
            if let Some(n) = f.manager.handle_signal(sig).await {
                notices.push(n);
            }
        }
        notices
    }

    async fn wait_queue_empty(f: &Fixture, peer: Uuid, label: &str) {
        timeout(Duration::from_secs(2), async {
            while f.manager.queued(peer, label).await > 0
                || f.manager.is_draining(peer, label).await
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue drained");
    }

    fn messages(notices: &[ChannelNotice]) -> Vec<Bytes> {
        notices
            .iter()
            .filter_map(|n| match n {
                ChannelNotice::Message {
                    message: ChannelMessage::Binary(b),
                    ..
                } => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_lazy_open_queues_then_drains_on_open() {
        let (_net, mut a, mut b) = connected().await;

        let outcome = a
            .manager
            .send(b.id, "main", Bytes::from_static(b"frame-1"))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Queued);

        let notices = settle(&mut a).await;
        assert!(notices
            .iter()
            .any(|n| matches!(n, ChannelNotice::Opened { label, .. } if label == "main")));
        wait_queue_empty(&a, b.id, "main").await;

        let received = messages(&settle(&mut b).await);
        assert_eq!(received, vec![Bytes::from_static(b"frame-1")]);

        // Now open: sends go straight through.
        let outcome = a
            .manager
            .send(b.id, "main", Bytes::from_static(b"frame-2"))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(messages(&settle(&mut b).await).len(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_queues_until_buffer_low() {
        let (net, mut a, mut b) = connected().await;
        a.manager.open_channel(b.id, "main").await.unwrap();
        settle(&mut a).await;
        settle(&mut b).await;

        let mock = net.channel(a.id, b.id, "main").unwrap();
        mock.set_buffered_amount(MAX_BUFFERED_AMOUNT);
        for i in 0..5u8 {
            let outcome = a.manager.send(b.id, "main", Bytes::from(vec![i])).await.unwrap();
            assert_eq!(outcome, SendOutcome::Queued);
        }
        assert_eq!(a.manager.queued(b.id, "main").await, 5);
        assert!(messages(&settle(&mut b).await).is_empty());

        mock.simulate_drain(0);
        settle(&mut a).await;
        wait_queue_empty(&a, b.id, "main").await;

        let mut got: Vec<u8> = messages(&settle(&mut b).await).iter().map(|m| m[0]).collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_drops_queued_frames() {
        let (net, mut a, mut b) = connected().await;
        a.manager.open_channel(b.id, "main").await.unwrap();
        settle(&mut a).await;
        settle(&mut b).await;

        net.channel(a.id, b.id, "main")
            .unwrap()
            .set_buffered_amount(MAX_BUFFERED_AMOUNT);
        for i in 0..3u8 {
            a.manager.send(b.id, "main", Bytes::from(vec![i])).await.unwrap();
        }
        assert_eq!(a.manager.queued(b.id, "main").await, 3);

        assert_eq!(a.manager.close_channel(b.id, "main").await, CloseOutcome::Closed);
        assert_eq!(a.manager.queued(b.id, "main").await, 0);
        assert_eq!(a.manager.drain(b.id, "main").await, 0);
        assert!(messages(&settle(&mut b).await).is_empty());
    }

    #[tokio::test]
    async fn test_drain_can_be_spawned() {
        fn assert_send<T: Send>(_: &T) {}
        let net = MockNetwork::new();
        let f = fixture(&net, Uuid::new_v4(), Uuid::new_v4()).await;
        let drain = f.manager.drain(Uuid::new_v4(), "main");
        assert_send(&drain);
        assert_eq!(drain.await, 0);
    }

    #[tokio::test]
    async fn test_closing_signaling_removes_peer() {
        let (net, mut a, mut b) = connected().await;
        for label in [SIGNALING_CHANNEL_LABEL, "main", "extra"] {
            a.manager.open_channel(b.id, label).await.unwrap();
        }
        settle(&mut a).await;
        settle(&mut b).await;
        let main = net.channel(a.id, b.id, "main").unwrap();

        let outcome = a.manager.close_channel(b.id, SIGNALING_CHANNEL_LABEL).await;
        assert_eq!(outcome, CloseOutcome::PeerRemoved);
        assert!(a.manager.registry().labels(b.id).await.is_empty());
        assert_eq!(main.state(), ChannelState::Closed);
        assert!(!main.is_attached(), "handlers cleared before close");

        // The remote side sees its ends close; its signaling close removes the peer there too.
        let notices = settle(&mut b).await;
        assert!(notices
            .iter()
            .any(|n| matches!(n, ChannelNotice::PeerRemoved { .. })));
    }

    #[tokio::test]
    async fn test_error_is_treated_as_close() {
        let (net, mut a, mut b) = connected().await;
        a.manager.open_channel(b.id, "main").await.unwrap();
        settle(&mut a).await;
        settle(&mut b).await;

        net.channel(a.id, b.id, "main").unwrap().simulate_error("sctp reset");
        let notices = settle(&mut a).await;
        assert!(notices
            .iter()
            .any(|n| matches!(n, ChannelNotice::Closed { label, .. } if label == "main")));
        assert!(a.manager.registry().get(b.id, "main").await.is_none());
    }

    #[tokio::test]
    async fn test_release_room_closes_emptied_channels() {
        let (_net, mut a, b) = connected().await;
        a.manager.open_channel(b.id, "one").await.unwrap();
        a.manager.open_channel(b.id, "two").await.unwrap();
        settle(&mut a).await;
        a.manager.serve_room(b.id, "one", "r1").await;
        a.manager.serve_room(b.id, "two", "r1").await;
        a.manager.serve_room(b.id, "two", "r2").await;

        let closed = a.manager.release_room(b.id, "r1").await;
        assert_eq!(closed, vec!["one".to_string()]);
        assert!(a.manager.registry().get(b.id, "two").await.is_some());
    }

    #[test]
    fn test_short_label() {
        assert_eq!(short("main"), "main");
        assert_eq!(short(&"a".repeat(100)).len(), 24);
    }
}
