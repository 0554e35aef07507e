//! Error taxonomy for the transfer pipeline.
//!
//! Chunk-level failures (`AuthenticationFailed`, `DecryptionFailed`,
//! `ProofInvalid`, `MalformedFrame`) are dropped and logged by the receive
//! loop; they never abort a stream. Negotiation collisions are resolved
//! inside the negotiator and have no variant here.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Ephemeral key signature did not verify against the sender identity.
    #[error("ephemeral key signature rejected")]
    AuthenticationFailed,

    /// AEAD tag mismatch (wrong key, wrong associated data, or tampering).
    #[error("decryption failed")]
    DecryptionFailed,

    /// Merkle proof did not verify against the channel-bound root.
    #[error("merkle proof invalid for chunk {index}")]
    ProofInvalid { index: u32 },

    /// Key generation or buffer allocation failed inside the crypto engine.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("hash failed: {0}")]
    HashFailed(String),

    /// Peer connection reached a terminal state.
    #[error("connection to {0} failed")]
    ConnectionFailed(Uuid),

    /// Channel closed while a frame was being handed off.
    #[error("channel {label} to {peer} closed")]
    ChannelClosed { peer: Uuid, label: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("empty message")]
    EmptyMessage,

    #[error("unknown peer {0}")]
    UnknownPeer(Uuid),

    #[error("store error: {0}")]
    Store(String),
}

impl TransferError {
    /// Whether the error only affects a single chunk and the stream continues.
    pub fn is_chunk_local(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::DecryptionFailed
                | Self::ProofInvalid { .. }
                | Self::MalformedFrame(_)
                | Self::AllocationFailed(_)
                | Self::HashFailed(_)
        )
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
