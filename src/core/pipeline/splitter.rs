//! Chunk splitter: message bytes to padded chunks committed by a Merkle root.
//!
//! The message is spread over `total_chunks = max(min_chunks, ceil(n / fill))`
//! chunks, where `fill = floor(chunk_size * percentage_filled_chunk)`. Each
//! chunk is a `chunk_size` buffer of random bytes with the real slice placed
//! at a random offset inside the unfilled budget. Chunks that receive no real
//! bytes are decoys (`chunk_start == chunk_end`).

use crate::core::config::{
    NodeConfig, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE, MIN_CHUNKS, MIN_CHUNK_SIZE,
};
use crate::core::error::{TransferError, TransferResult};
use crate::core::pipeline::chunk::{ChunkMetadata, MessageType};
use crate::core::pipeline::merkle::{Hash, MerkleTree};
use crate::core::security::crypto;
use crate::core::store::{ContentStore, MessageMeta};
use bytes::Bytes;
use rand::{Rng, RngCore};
use uuid::Uuid;

/// A message waiting to be split.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub message_type: MessageType,
    pub filename: String,
    pub data: Vec<u8>,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Text,
            filename: String::new(),
            data: text.into().into_bytes(),
        }
    }

    pub fn file(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            message_type: MessageType::File,
            filename: filename.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SplitParams {
    pub min_chunks: u32,
    pub chunk_size: usize,
    pub percentage_filled_chunk: f64,
    pub schema_version: u16,
}

impl From<&NodeConfig> for SplitParams {
    fn from(cfg: &NodeConfig) -> Self {
        Self {
            min_chunks: cfg.min_chunks,
            chunk_size: cfg.chunk_size,
            percentage_filled_chunk: cfg.percentage_filled_chunk,
            schema_version: cfg.schema_version,
        }
    }
}

impl Default for SplitParams {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

impl SplitParams {
    fn validate(&self) -> TransferResult<()> {
        if !(self.percentage_filled_chunk > 0.0 && self.percentage_filled_chunk <= 1.0) {
            return Err(TransferError::InvalidParameters(format!(
                "percentage_filled_chunk {} outside (0, 1]",
                self.percentage_filled_chunk
            )));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(TransferError::InvalidParameters(format!(
                "chunk_size {} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]",
                self.chunk_size
            )));
        }
        if self.min_chunks < MIN_CHUNKS {
            return Err(TransferError::InvalidParameters(format!(
                "min_chunks {} below {MIN_CHUNKS}",
                self.min_chunks
            )));
        }
        Ok(())
    }

    /// Real bytes a single chunk may carry.
    fn fill(&self) -> usize {
        ((self.chunk_size as f64 * self.percentage_filled_chunk).floor() as usize).max(1)
    }
}

/// One chunk ready for encryption. Cached for the lifetime of the transfer so
/// retransmissions never recompute hashes or proofs.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub metadata: ChunkMetadata,
    /// `chunk_size` bytes: random padding around the real slice.
    pub padded: Bytes,
    /// SHA-512 of `padded`.
    pub leaf: Hash,
    /// Encoded fixed-length Merkle proof.
    pub proof: Bytes,
}

impl PreparedChunk {
    pub fn real_bytes(&self) -> Bytes {
        self.padded
            .slice(self.metadata.chunk_start as usize..self.metadata.chunk_end as usize)
    }
}

#[derive(Debug, Clone)]
pub struct SplitMessage {
    pub root: Hash,
    pub content_hash: Hash,
    pub total_size: u64,
    pub total_chunks: u32,
    pub message_type: MessageType,
    pub filename: String,
    pub created_at: u64,
    pub chunks: Vec<PreparedChunk>,
}

impl SplitMessage {
    pub fn chunk_hashes(&self) -> Vec<Hash> {
        self.chunks.iter().map(|c| c.leaf).collect()
    }

    /// Store the real sub-range of every chunk plus the message record, so
    /// the sender's own copy reads back as complete.
    pub async fn persist(
        &self,
        store: &dyn ContentStore,
        owner: Uuid,
        channel: &str,
    ) -> TransferResult<()> {
        for chunk in &self.chunks {
            store
                .put_chunk(&self.root, chunk.metadata.chunk_index, chunk.real_bytes())
                .await?;
        }
        store
            .put_message_meta(MessageMeta {
                root: self.root,
                content_hash: self.content_hash,
                peer: owner,
                total_size: self.total_size,
                saved_size: self.total_size,
                total_chunks: self.total_chunks,
                message_type: self.message_type,
                filename: self.filename.clone(),
                channel: channel.to_owned(),
                created_at: self.created_at,
            })
            .await
    }
}

pub struct ChunkSplitter;

impl ChunkSplitter {
    /// Split `draft` into padded chunks. CPU-bound; callers on the runtime
    /// should run it under `spawn_blocking` for large messages.
    pub fn split(draft: &MessageDraft, params: &SplitParams) -> TransferResult<SplitMessage> {
        params.validate()?;
        let data = &draft.data;
        if data.is_empty() {
            return Err(TransferError::EmptyMessage);
        }
        if data.len() as u64 > MAX_MESSAGE_SIZE {
            return Err(TransferError::InvalidParameters(format!(
                "message of {} bytes exceeds {MAX_MESSAGE_SIZE}",
                data.len()
            )));
        }

        let total_size = data.len();
        let fill = params.fill();
        let total_chunks = params.min_chunks.max(total_size.div_ceil(fill) as u32);
        let k = total_chunks as usize;
        let (base, extra) = (total_size / k, total_size % k);
        let budget = params.chunk_size - fill;
        let created_at = chrono::Utc::now().timestamp_millis().max(0) as u64;

        let mut rng = rand::thread_rng();
        let mut metas = Vec::with_capacity(k);
        let mut padded = Vec::with_capacity(k);
        let mut offset = 0usize;

        for index in 0..k {
            let len = base + usize::from(index < extra);
            let start = rng.gen_range(0..=budget);

            let mut buf = vec![0u8; params.chunk_size];
            rng.fill_bytes(&mut buf);
            buf[start..start + len].copy_from_slice(&data[offset..offset + len]);
            offset += len;

            metas.push(ChunkMetadata {
                schema_version: params.schema_version,
                message_type: draft.message_type,
                total_size: total_size as u64,
                created_at,
                chunk_start: start as u32,
                chunk_end: (start + len) as u32,
                chunk_index: index as u32,
                total_chunks,
                filename: draft.filename.clone(),
            });
            padded.push(Bytes::from(buf));
        }

        let leaves: Vec<Hash> = padded.iter().map(|p| crypto::hash(p)).collect();
        let tree = MerkleTree::build(&leaves)?;

        let mut chunks = Vec::with_capacity(k);
        for (index, (metadata, padded)) in metas.into_iter().zip(padded).enumerate() {
            let proof = tree
                .proof(index)
                .ok_or_else(|| TransferError::HashFailed(format!("no proof for {index}")))?;
            chunks.push(PreparedChunk {
                metadata,
                padded,
                leaf: leaves[index],
                proof: Bytes::from(proof.encode()),
            });
        }

        Ok(SplitMessage {
            root: *tree.root(),
            content_hash: crypto::hash(data),
            total_size: total_size as u64,
            total_chunks,
            message_type: draft.message_type,
            filename: draft.filename.clone(),
            created_at,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{HASH_LEN, PROOF_LEN};
    use crate::core::pipeline::merkle::{verify_proof, MerkleProof};
    use crate::core::store::{read_message, MemoryStore};

    fn reassemble(split: &SplitMessage) -> Vec<u8> {
        let mut chunks: Vec<_> = split.chunks.iter().collect();
        chunks.sort_by_key(|c| c.metadata.chunk_index);
        chunks.iter().flat_map(|c| c.real_bytes().to_vec()).collect()
    }

    #[test]
    fn test_hello_has_three_chunks() {
        let split = ChunkSplitter::split(&MessageDraft::text("hello"), &SplitParams::default())
            .unwrap();
        assert!(split.total_chunks >= 3);
        assert_eq!(split.root.len(), HASH_LEN);
        for chunk in &split.chunks {
            assert_eq!(chunk.proof.len(), PROOF_LEN);
            let proof = MerkleProof::decode(&chunk.proof).unwrap();
            assert!(verify_proof(&chunk.leaf, &split.root, &proof));
        }
        assert_eq!(reassemble(&split), b"hello");
    }

    #[test]
    fn test_roundtrip_and_padding_invariant() {
        let mut rng = rand::thread_rng();
        for _ in 0..24 {
            let params = SplitParams {
                min_chunks: rng.gen_range(3..8),
                chunk_size: rng.gen_range(MIN_CHUNK_SIZE..=8 * 1024),
                percentage_filled_chunk: rng.gen_range(0.05..=1.0),
                schema_version: 1,
            };
            let mut data = vec![0u8; rng.gen_range(1..64 * 1024)];
            rng.fill_bytes(&mut data);

            let split = ChunkSplitter::split(&MessageDraft::file("f.bin", data.clone()), &params)
                .unwrap();
            assert!(split.total_chunks >= 3);
            assert_eq!(split.chunks.len(), split.total_chunks as usize);
            for c in &split.chunks {
                let m = &c.metadata;
                assert!(m.chunk_start <= m.chunk_end);
                assert!(m.chunk_end as usize <= params.chunk_size);
                assert!(m.real_len() <= m.total_size);
                assert_eq!(c.padded.len(), params.chunk_size);
            }
            assert_eq!(reassemble(&split), data);
        }
    }

    #[test]
    fn test_decoys_for_tiny_messages() {
        let split =
            ChunkSplitter::split(&MessageDraft::text("a"), &SplitParams::default()).unwrap();
        assert_eq!(split.total_chunks, 3);
        let decoys = split
            .chunks
            .iter()
            .filter(|c| c.metadata.chunk_start == c.metadata.chunk_end)
            .count();
        assert_eq!(decoys, 2);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let draft = MessageDraft::text("hello");
        let ok = SplitParams::default();

        assert!(matches!(
            ChunkSplitter::split(&MessageDraft::text(""), &ok),
            Err(TransferError::EmptyMessage)
        ));
        for pct in [0.0, -0.5, 1.5, f64::NAN] {
            let p = SplitParams { percentage_filled_chunk: pct, ..ok };
            assert!(ChunkSplitter::split(&draft, &p).is_err(), "pct {pct}");
        }
        for size in [MIN_CHUNK_SIZE - 1, MAX_CHUNK_SIZE + 1] {
            let p = SplitParams { chunk_size: size, ..ok };
            assert!(ChunkSplitter::split(&draft, &p).is_err(), "size {size}");
        }
        let p = SplitParams { min_chunks: 2, ..ok };
        assert!(ChunkSplitter::split(&draft, &p).is_err());
    }

    #[tokio::test]
    async fn test_persist_reads_back() {
        let store = MemoryStore::new();
        let data = b"persisted message body".to_vec();
        let split =
            ChunkSplitter::split(&MessageDraft::file("a.txt", data.clone()), &SplitParams::default())
                .unwrap();
        split.persist(&store, Uuid::new_v4(), "main").await.unwrap();

        assert_eq!(read_message(&store, &split.root).await.unwrap(), data);
        let meta = store.get_message_meta(&split.root).await.unwrap().unwrap();
        assert!(meta.is_complete());
        assert_eq!(meta.filename, "a.txt");
    }
}
