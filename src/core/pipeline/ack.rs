//! Acknowledgements, sent as JSON text on the message channel or relayed
//! through signaling.

use crate::core::error::{TransferError, TransferResult};
use crate::core::pipeline::merkle::Hash;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    /// Carries the SHA-512 of one chunk's real bytes.
    Chunk,
    /// Carries the content hash of the whole message.
    Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Compiled label of the channel the acknowledged message travels on.
    pub label: String,
    pub kind: AckKind,
    /// Hex encoded hash.
    pub hash: String,
}

impl Ack {
    pub fn chunk(label: &str, hash: &Hash) -> Self {
        Self {
            label: label.to_owned(),
            kind: AckKind::Chunk,
            hash: hex::encode(hash),
        }
    }

    pub fn message(label: &str, content_hash: &Hash) -> Self {
        Self {
            label: label.to_owned(),
            kind: AckKind::Message,
            hash: hex::encode(content_hash),
        }
    }

    pub fn hash_bytes(&self) -> TransferResult<Hash> {
        let mut out = [0u8; 64];
        hex::decode_to_slice(&self.hash, &mut out)
            .map_err(|_| TransferError::MalformedFrame("ack hash"))?;
        Ok(out)
    }

    pub fn to_json(&self) -> String {
        // Plain strings and a unit enum always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(text: &str) -> TransferResult<Self> {
        serde_json::from_str(text).map_err(|_| TransferError::MalformedFrame("ack json"))
    }
}
