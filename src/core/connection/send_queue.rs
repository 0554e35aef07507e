//! Overflow queue for frames a channel cannot take right now.
//!
//! Items are keyed by `(peer, label, position)`. Positions grow per queue so
//! an item put back after a failed send keeps its identity. Drains take a
//! random item, not the oldest one.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SendQueueItem {
    pub position: u64,
    pub label: String,
    pub peer: Uuid,
    pub frame: Bytes,
}

#[async_trait]
pub trait SendQueue: Send + Sync {
    /// Append a frame; returns its position.
    async fn push(&self, peer: Uuid, label: &str, frame: Bytes) -> u64;

    /// Remove and return a random queued item for `(peer, label)`.
    async fn take_random(&self, peer: Uuid, label: &str) -> Option<SendQueueItem>;

    /// Put back an item whose send failed.
    async fn restore(&self, item: SendQueueItem);

    async fn len(&self, peer: Uuid, label: &str) -> usize;

    /// Drop everything queued for `peer`, or only for `label` when given.
    async fn clear(&self, peer: Uuid, label: Option<&str>) -> usize;
}

#[derive(Default)]
struct Queues {
    next_position: u64,
    items: HashMap<(Uuid, String), BTreeMap<u64, Bytes>>,
}

/// In-memory [`SendQueue`].
#[derive(Default)]
pub struct MemorySendQueue {
    inner: Mutex<Queues>,
}

impl MemorySendQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SendQueue for MemorySendQueue {
    async fn push(&self, peer: Uuid, label: &str, frame: Bytes) -> u64 {
        let mut q = self.inner.lock().await;
        let position = q.next_position;
        q.next_position += 1;
        q.items
            .entry((peer, label.to_owned()))
            .or_default()
            .insert(position, frame);
        position
    }

    async fn take_random(&self, peer: Uuid, label: &str) -> Option<SendQueueItem> {
        let mut q = self.inner.lock().await;
        let key = (peer, label.to_owned());
        let items = q.items.get_mut(&key)?;
        let nth = rand::thread_rng().gen_range(0..items.len().max(1));
        let position = *items.keys().nth(nth)?;
        let frame = items.remove(&position)?;
        if items.is_empty() {
            q.items.remove(&key);
        }
        Some(SendQueueItem {
            position,
            label: label.to_owned(),
            peer,
            frame,
        })
    }

    async fn restore(&self, item: SendQueueItem) {
        self.inner
            .lock()
            .await
            .items
            .entry((item.peer, item.label))
            .or_default()
            .insert(item.position, item.frame);
    }

    async fn len(&self, peer: Uuid, label: &str) -> usize {
        self.inner
            .lock()
            .await
            .items
            .get(&(peer, label.to_owned()))
            .map_or(0, BTreeMap::len)
    }

    async fn clear(&self, peer: Uuid, label: Option<&str>) -> usize {
        let mut q = self.inner.lock().await;
        let keys: Vec<_> = q
            .items
            .keys()
            .filter(|(p, l)| *p == peer && label.map_or(true, |want| l.as_str() == want))
            .cloned()
            .collect();
        keys.iter()
            .filter_map(|k| q.items.remove(k))
            .map(|m| m.len())
            .sum()
    }
}
