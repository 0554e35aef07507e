//! Content-addressed store for chunk bytes and message metadata.
//!
//! Chunks are keyed by `(merkle root, chunk index)` and hold only the real
//! sub-range of the padded chunk. Message metadata is keyed by root.
//! Writes to distinct indices never conflict; rewriting the same index is
//! idempotent because its content is fixed by the Merkle commitment.

use crate::core::error::{TransferError, TransferResult};
use crate::core::pipeline::chunk::MessageType;
use crate::core::pipeline::merkle::Hash;
use crate::core::security::crypto;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Receiver- or sender-side record of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub root: Hash,
    pub content_hash: Hash,
    /// Remote peer for received messages, local peer for sent ones.
    pub peer: Uuid,
    pub total_size: u64,
    pub saved_size: u64,
    pub total_chunks: u32,
    pub message_type: MessageType,
    pub filename: String,
    /// Compiled label of the channel the message travels on.
    pub channel: String,
    pub created_at: u64,
}

impl MessageMeta {
    pub fn is_complete(&self) -> bool {
        self.saved_size == self.total_size
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put_chunk(&self, root: &Hash, index: u32, bytes: Bytes) -> TransferResult<()>;

    async fn get_chunk(&self, root: &Hash, index: u32) -> TransferResult<Option<Bytes>>;

    async fn put_message_meta(&self, meta: MessageMeta) -> TransferResult<()>;

    async fn get_message_meta(&self, root: &Hash) -> TransferResult<Option<MessageMeta>>;

    /// Drop a message's metadata and every chunk stored under its root.
    async fn delete_message(&self, root: &Hash) -> TransferResult<()>;
}

/// In-process store. Used by the CLI and by tests.
#[derive(Default)]
pub struct MemoryStore {
    chunks: RwLock<HashMap<Hash, HashMap<u32, Bytes>>>,
    messages: RwLock<HashMap<Hash, MessageMeta>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put_chunk(&self, root: &Hash, index: u32, bytes: Bytes) -> TransferResult<()> {
        self.chunks
            .write()
            .await
            .entry(*root)
            .or_default()
            .insert(index, bytes);
        Ok(())
    }

    async fn get_chunk(&self, root: &Hash, index: u32) -> TransferResult<Option<Bytes>> {
        Ok(self
            .chunks
            .read()
            .await
            .get(root)
            .and_then(|m| m.get(&index))
            .cloned())
    }

    async fn put_message_meta(&self, meta: MessageMeta) -> TransferResult<()> {
        self.messages.write().await.insert(meta.root, meta);
        Ok(())
    }

    async fn get_message_meta(&self, root: &Hash) -> TransferResult<Option<MessageMeta>> {
        Ok(self.messages.read().await.get(root).cloned())
    }

    async fn delete_message(&self, root: &Hash) -> TransferResult<()> {
        self.messages.write().await.remove(root);
        self.chunks.write().await.remove(root);
        Ok(())
    }
}

/// Reassemble a stored message by chunk index. Absent indices count as empty
/// (decoys that arrived after completion are never stored); a gap in the real
/// data shows up as a size mismatch.
pub async fn read_message(store: &dyn ContentStore, root: &Hash) -> TransferResult<Vec<u8>> {
    let meta = store
        .get_message_meta(root)
        .await?
        .ok_or_else(|| TransferError::Store(format!("no message {}", hex::encode(&root[..8]))))?;

    let mut out = Vec::with_capacity(meta.total_size as usize);
    for index in 0..meta.total_chunks {
        if let Some(chunk) = store.get_chunk(root, index).await? {
            out.extend_from_slice(&chunk);
        }
    }

    if out.len() as u64 != meta.total_size {
        return Err(TransferError::Store(format!(
            "reassembled {} bytes, expected {}",
            out.len(),
            meta.total_size
        )));
    }
    Ok(out)
}

/// Reassemble and check the content hash recorded for the message.
pub async fn read_verified(store: &dyn ContentStore, root: &Hash) -> TransferResult<Vec<u8>> {
    let data = read_message(store, root).await?;
    let meta = store
        .get_message_meta(root)
        .await?
        .ok_or_else(|| TransferError::Store("message vanished".into()))?;
    if crypto::hash(&data) != meta.content_hash {
        return Err(TransferError::Store("content hash mismatch".into()));
    }
    Ok(data)
}
