//! Centralized configuration constants for sealdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Runtime overrides go through [`NodeConfig`], whose
//! `Default` impl is built from these constants.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Wire format ──────────────────────────────────────────────────────────────

/// Current chunk metadata schema version.
pub const SCHEMA_VERSION: u16 = 1;

/// Ed25519 public key length (ephemeral and long-term).
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 keypair length (`secret seed || public key`).
pub const SECRET_KEY_LEN: usize = 64;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// AES-256-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// AES-256-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// SHA-512 digest length. Merkle roots, chunk hashes and content hashes
/// all use this size.
pub const HASH_LEN: usize = 64;

/// Longest filename carried in chunk metadata (bytes, UTF-8).
pub const MAX_FILENAME_LEN: usize = 255;

/// Fixed size of an encoded [`ChunkMetadata`](crate::core::pipeline::chunk::ChunkMetadata).
///
/// `2 + 2 + 8 + 8 + 4 + 4 + 4 + 4 + 1 + 255`
pub const METADATA_LEN: usize = 292;

/// Deepest Merkle tree a proof can describe. 2^24 chunks is far beyond any
/// message the splitter accepts.
pub const MERKLE_MAX_DEPTH: usize = 24;

/// Fixed encoded proof length: one step-count byte followed by
/// `MERKLE_MAX_DEPTH` slots of `side (1) || sibling hash (64)`.
///
/// Every proof is padded to this length so frame sizes never leak tree depth.
pub const PROOF_LEN: usize = 1 + MERKLE_MAX_DEPTH * (1 + HASH_LEN);

/// Bytes a wire frame spends outside of the padded chunk itself.
pub const FRAME_OVERHEAD: usize =
    PUBLIC_KEY_LEN + SIGNATURE_LEN + NONCE_LEN + TAG_LEN + METADATA_LEN + PROOF_LEN;

/// Largest binary message sent on a data channel.
///
/// webrtc-rs defaults its SCTP receive side to 64 KB; browsers interoperate
/// reliably up to the same figure.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

// ── Chunking ─────────────────────────────────────────────────────────────────

/// Default padded chunk size in bytes (32 KB).
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Smallest padded chunk size the splitter accepts.
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest padded chunk size that still fits a frame.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - FRAME_OVERHEAD;

/// Minimum number of chunks for any message. One- or two-chunk transfers
/// reveal size and order trivially, so the splitter never goes below three.
pub const MIN_CHUNKS: u32 = 3;

/// Default fraction of every padded chunk that carries real bytes.
pub const PERCENTAGE_FILLED_CHUNK: f64 = 0.75;

/// Largest message the splitter accepts (bytes).
pub const MAX_MESSAGE_SIZE: u64 = 256 * 1024 * 1024;

// ── Channels / Backpressure ──────────────────────────────────────────────────

/// Label of the bootstrap channel. Closing it tears down the whole peer.
pub const SIGNALING_CHANNEL_LABEL: &str = "signaling";

/// Label of the default channel the initiator opens once connected.
pub const MAIN_CHANNEL_LABEL: &str = "main";

/// High water mark for a data channel's send buffer (bytes). At or above
/// this value frames go to the send queue instead of the wire.
pub const MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;

/// `bufferedamountlow` threshold. Crossing below it drains the send queue.
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 256 * 1024;

/// Partial-reliability retransmit budget for data channels.
pub const CHANNEL_MAX_RETRANSMITS: u16 = 10;

/// Upper bound of the random delay inserted between drained queue items.
pub const SEND_QUEUE_MAX_JITTER: Duration = Duration::from_millis(8);

// ── Receiving ────────────────────────────────────────────────────────────────

/// Length of the frame prefix used as a duplicate-enqueue fingerprint.
pub const FRAME_FINGERPRINT_LEN: usize = 16;

/// Fingerprints remembered per receive context before the oldest is evicted.
pub const SEEN_FINGERPRINTS: usize = 4096;

/// Raw frames held per receive context before new frames are dropped.
pub const MAX_PENDING_FRAMES: usize = 1024;

/// Proof failures for one Merkle root before a corrupted-transfer warning.
pub const PROOF_FAILURE_THRESHOLD: u32 = 3;

// ── Signaling ────────────────────────────────────────────────────────────────

/// Interval between liveness pings to the signaling relay.
pub const SIGNALING_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Timeout for the initial WebSocket connect to the signaling relay.
pub const SIGNALING_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ── ICE ──────────────────────────────────────────────────────────────────────

/// Public STUN server used when no ICE servers are configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

// ── Runtime configuration ────────────────────────────────────────────────────

/// One ICE server entry (STUN or TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Peer connection configuration handed to the transport factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_URL.into()],
                username: String::new(),
                credential: String::new(),
            }],
        }
    }
}

/// Runtime knobs for a [`Node`](crate::core::engine::Node).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chunk_size: usize,
    pub percentage_filled_chunk: f64,
    pub min_chunks: u32,
    pub schema_version: u16,
    pub max_buffered_amount: usize,
    pub rtc: RtcConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            percentage_filled_chunk: PERCENTAGE_FILLED_CHUNK,
            min_chunks: MIN_CHUNKS,
            schema_version: SCHEMA_VERSION,
            max_buffered_amount: MAX_BUFFERED_AMOUNT,
            rtc: RtcConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_budget_fits_default_chunk() {
        assert!(CHUNK_SIZE + FRAME_OVERHEAD <= MAX_FRAME_SIZE);
        assert!(MIN_CHUNK_SIZE < MAX_CHUNK_SIZE);
    }

    #[test]
    fn metadata_len_matches_layout() {
        assert_eq!(METADATA_LEN, 2 + 2 + 8 + 8 + 4 * 4 + 1 + MAX_FILENAME_LEN);
    }
}
