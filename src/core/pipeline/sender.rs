//! Chunk transmitter and sender-side acknowledgement tracking.
//!
//! ```text
//! SplitMessage ──► shuffle indices ──► per chunk: ephemeral key, sign,
//!                  (per recipient)      seal(AAD = root), frame ──► ChannelManager
//! ```
//!
//! Every chunk gets its own ephemeral keypair whose public half is signed
//! with the long-term identity. A failure on one chunk skips that chunk
//! only. The cancel signal is checked once per chunk.

use crate::core::connection::channels::{short, ChannelManager, SendOutcome};
use crate::core::error::TransferResult;
use crate::core::pipeline::ack::{Ack, AckKind};
use crate::core::pipeline::chunk::{write_plaintext, ChunkBitmap};
use crate::core::pipeline::frame::build_frame;
use crate::core::pipeline::label::ChannelLabel;
use crate::core::pipeline::merkle::Hash;
use crate::core::pipeline::splitter::{PreparedChunk, SplitMessage};
use crate::core::security::crypto::{self, EphemeralKeypair};
use crate::core::security::Identity;
use crate::utils::cancel::CancelSignal;
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Frame sealing ──────────────────────────────────────────────────────────────

/// Encrypt one prepared chunk for `recipient_pk`.
///
/// `scratch` holds the plaintext while sealing and is reused across calls.
pub fn seal_chunk(
    identity: &Identity,
    root: &Hash,
    chunk: &PreparedChunk,
    recipient_pk: &[u8; 32],
    scratch: &mut Vec<u8>,
) -> TransferResult<Bytes> {
    let ephemeral = EphemeralKeypair::generate();
    let ephemeral_pk = ephemeral.public_key();
    let signature = identity.sign(&ephemeral_pk);

    let metadata = chunk.metadata.encode()?;
    write_plaintext(scratch, &metadata, &chunk.proof, &chunk.padded);

    let nonce = crypto::random_nonce();
    let sealed = crypto::seal(scratch, recipient_pk, &ephemeral.secret_key(), &nonce, root)?;
    Ok(build_frame(&ephemeral_pk, &signature, &nonce, &sealed))
}

// ── Transmitter ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Recipient {
    pub peer: Uuid,
    pub public_key: [u8; 32],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransmitReport {
    pub sent: u32,
    pub queued: u32,
    pub skipped: u32,
    pub cancelled: bool,
}

pub struct ChunkTransmitter {
    identity: Arc<Identity>,
    channels: Arc<ChannelManager>,
    cancel: CancelSignal,
}

impl ChunkTransmitter {
    pub fn new(identity: Arc<Identity>, channels: Arc<ChannelManager>, cancel: CancelSignal) -> Self {
        Self {
            identity,
            channels,
            cancel,
        }
    }

    /// Send every chunk of `message` to one recipient on channel `label`, in
    /// a freshly shuffled order.
    pub async fn transmit(
        &self,
        message: &SplitMessage,
        label: &str,
        recipient: &Recipient,
    ) -> TransmitReport {
        let mut order: Vec<usize> = (0..message.chunks.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut report = TransmitReport::default();
        let mut scratch = Vec::new();
        for index in order {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                info!(event = "transmit_cancelled", peer = %recipient.peer, label = %short(label), sent = report.sent, "Transfer cancelled");
                break;
            }

            let chunk = &message.chunks[index];
            let frame = match seal_chunk(
                &self.identity,
                &message.root,
                chunk,
                &recipient.public_key,
                &mut scratch,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(event = "chunk_seal_failed", peer = %recipient.peer, index, error = %e, "Chunk skipped");
                    report.skipped += 1;
                    continue;
                }
            };

            match self.channels.send(recipient.peer, label, frame).await {
                Ok(SendOutcome::Sent) => report.sent += 1,
                Ok(SendOutcome::Queued) => report.queued += 1,
                Err(e) => {
                    warn!(event = "chunk_send_failed", peer = %recipient.peer, index, error = %e, "Chunk skipped");
                    report.skipped += 1;
                }
            }
        }

        debug!(
            event = "transmit_done",
            peer = %recipient.peer,
            label = %short(label),
            sent = report.sent,
            queued = report.queued,
            skipped = report.skipped,
            "Chunk loop finished"
        );
        report
    }
}

// ── Ack tracking ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    ChunkAcked {
        peer: Uuid,
        root: Hash,
        acked: u32,
        total: u32,
    },
    /// `peer` confirmed the whole message. `purged` is set once every
    /// recipient has done so and the cached chunks were dropped.
    MessageComplete {
        peer: Uuid,
        root: Hash,
        label: String,
        purged: bool,
    },
    Duplicate,
    Unknown,
}

struct RecipientProgress {
    acked: ChunkBitmap,
    complete: bool,
}

struct OutgoingTransfer {
    message: Arc<SplitMessage>,
    label: String,
    /// Real-content hash to chunk indices. Decoys share one hash.
    by_hash: HashMap<Hash, Vec<u32>>,
    recipients: HashMap<Uuid, RecipientProgress>,
}

impl OutgoingTransfer {
    fn all_complete(&self) -> bool {
        self.recipients.values().all(|r| r.complete)
    }
}

/// Outgoing messages still waiting for acknowledgement, keyed by Merkle
/// root. Holds the prepared chunks until every recipient has confirmed.
#[derive(Default)]
pub struct AckTracker {
    transfers: Mutex<HashMap<Hash, OutgoingTransfer>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, message: Arc<SplitMessage>, label: &str, recipients: &[Uuid]) {
        let mut by_hash: HashMap<Hash, Vec<u32>> = HashMap::new();
        for chunk in &message.chunks {
            by_hash
                .entry(crypto::hash(&chunk.real_bytes()))
                .or_default()
                .push(chunk.metadata.chunk_index);
        }
        let recipients = recipients
            .iter()
            .map(|peer| {
                (
                    *peer,
                    RecipientProgress {
                        acked: ChunkBitmap::new(message.total_chunks),
                        complete: false,
                    },
                )
            })
            .collect();
        let root = message.root;
        self.transfers.lock().await.insert(
            root,
            OutgoingTransfer {
                message,
                label: label.to_owned(),
                by_hash,
                recipients,
            },
        );
    }

    /// Cached chunks of a message still in flight.
    pub async fn message(&self, root: &Hash) -> Option<Arc<SplitMessage>> {
        self.transfers
            .lock()
            .await
            .get(root)
            .map(|t| t.message.clone())
    }

    pub async fn is_tracked(&self, root: &Hash) -> bool {
        self.transfers.lock().await.contains_key(root)
    }

    pub async fn handle_ack(&self, from: Uuid, ack: &Ack) -> AckOutcome {
        let Ok(label) = ChannelLabel::parse(&ack.label) else {
            return AckOutcome::Unknown;
        };
        let Ok(hash) = ack.hash_bytes() else {
            return AckOutcome::Unknown;
        };

        let mut transfers = self.transfers.lock().await;
        let Some(transfer) = transfers.get_mut(&label.root) else {
            return AckOutcome::Unknown;
        };
        let total = transfer.message.total_chunks;
        let Some(progress) = transfer.recipients.get_mut(&from) else {
            return AckOutcome::Unknown;
        };

        match ack.kind {
            AckKind::Message => {
                if hash != transfer.message.content_hash {
                    return AckOutcome::Unknown;
                }
                if progress.complete {
                    return AckOutcome::Duplicate;
                }
                progress.complete = true;
                let channel = transfer.label.clone();
                let purged = transfer.all_complete();
                if purged {
                    transfers.remove(&label.root);
                    debug!(event = "transfer_purged", root = %hex::encode(&label.root[..8]), "All recipients done, chunks dropped");
                }
                AckOutcome::MessageComplete {
                    peer: from,
                    root: label.root,
                    label: channel,
                    purged,
                }
            }
            AckKind::Chunk => {
                let Some(indices) = transfer.by_hash.get(&hash) else {
                    return AckOutcome::Unknown;
                };
                let Some(index) = indices.iter().copied().find(|i| !progress.acked.is_set(*i)) else {
                    return AckOutcome::Duplicate;
                };
                progress.acked.set(index);
                AckOutcome::ChunkAcked {
                    peer: from,
                    root: label.root,
                    acked: progress.acked.received_count(),
                    total,
                }
            }
        }
    }

    /// Stop waiting on `peer` for the message at `root`, whose send loop
    /// gave up. Returns `true` when that dropped the whole transfer.
    pub async fn abandon(&self, root: &Hash, peer: Uuid) -> bool {
        let mut transfers = self.transfers.lock().await;
        let Some(transfer) = transfers.get_mut(root) else {
            return false;
        };
        transfer.recipients.remove(&peer);
        if !transfer.all_complete() {
            return false;
        }
        transfers.remove(root);
        debug!(event = "transfer_abandoned", root = %hex::encode(&root[..8]), "No recipient left, chunks dropped");
        true
    }

    /// Stop waiting on `peer`. Transfers whose remaining recipients are all
    /// done are dropped.
    pub async fn forget_peer(&self, peer: Uuid) {
        let mut transfers = self.transfers.lock().await;
        for transfer in transfers.values_mut() {
            transfer.recipients.remove(&peer);
        }
        transfers.retain(|_, t| !t.all_complete());
    }
}
