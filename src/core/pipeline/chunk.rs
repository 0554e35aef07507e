//! Chunk metadata and the decrypted plaintext layout.
//!
//! Every chunk plaintext is:
//!
//! ```text
//! metadata (METADATA_LEN) || merkle proof (PROOF_LEN) || padded chunk (chunk_size)
//! ```
//!
//! Metadata is a fixed-size big-endian record so the filename length never
//! changes the size of a frame.

use crate::core::config::{MAX_FILENAME_LEN, METADATA_LEN, PROOF_LEN};
use crate::core::error::{TransferError, TransferResult};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// What the reassembled bytes represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
}

impl MessageType {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Text => 0,
            Self::File => 1,
        }
    }

    pub fn from_u16(v: u16) -> TransferResult<Self> {
        match v {
            0 => Ok(Self::Text),
            1 => Ok(Self::File),
            _ => Err(TransferError::MalformedFrame("message type")),
        }
    }
}

/// Per-chunk metadata carried inside the encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub schema_version: u16,
    pub message_type: MessageType,
    /// Size of the whole message in bytes.
    pub total_size: u64,
    /// Creation time, unix milliseconds.
    pub created_at: u64,
    /// Real data lives at `[chunk_start, chunk_end)` inside the padded chunk.
    pub chunk_start: u32,
    pub chunk_end: u32,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub filename: String,
}

impl ChunkMetadata {
    /// Number of real bytes carried by the chunk.
    pub fn real_len(&self) -> u64 {
        u64::from(self.chunk_end.saturating_sub(self.chunk_start))
    }

    pub fn encode(&self) -> TransferResult<[u8; METADATA_LEN]> {
        let name = self.filename.as_bytes();
        if name.len() > MAX_FILENAME_LEN {
            return Err(TransferError::InvalidParameters(format!(
                "filename is {} bytes, limit {MAX_FILENAME_LEN}",
                name.len()
            )));
        }

        let mut out = [0u8; METADATA_LEN];
        let mut buf = &mut out[..];
        buf.put_u16(self.schema_version);
        buf.put_u16(self.message_type.as_u16());
        buf.put_u64(self.total_size);
        buf.put_u64(self.created_at);
        buf.put_u32(self.chunk_start);
        buf.put_u32(self.chunk_end);
        buf.put_u32(self.chunk_index);
        buf.put_u32(self.total_chunks);
        buf.put_u8(name.len() as u8);
        buf.put_slice(name);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> TransferResult<Self> {
        if bytes.len() != METADATA_LEN {
            return Err(TransferError::MalformedFrame("metadata length"));
        }
        let u16_at = |o: usize| u16::from_be_bytes([bytes[o], bytes[o + 1]]);
        let u32_at = |o: usize| {
            u32::from_be_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
        };
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[o..o + 8]);
            u64::from_be_bytes(b)
        };

        let name_len = bytes[36] as usize;
        let filename = std::str::from_utf8(&bytes[37..37 + name_len])
            .map_err(|_| TransferError::MalformedFrame("filename utf-8"))?
            .to_owned();

        Ok(Self {
            schema_version: u16_at(0),
            message_type: MessageType::from_u16(u16_at(2))?,
            total_size: u64_at(4),
            created_at: u64_at(12),
            chunk_start: u32_at(20),
            chunk_end: u32_at(24),
            chunk_index: u32_at(28),
            total_chunks: u32_at(32),
            filename,
        })
    }

    /// Enforce the padding invariant for a chunk of `chunk_size` bytes.
    pub fn validate(&self, chunk_size: usize) -> TransferResult<()> {
        if self.chunk_start > self.chunk_end || self.chunk_end as usize > chunk_size {
            return Err(TransferError::MalformedFrame("chunk range"));
        }
        if self.real_len() > self.total_size {
            return Err(TransferError::MalformedFrame("chunk larger than message"));
        }
        if self.total_chunks == 0 || self.chunk_index >= self.total_chunks {
            return Err(TransferError::MalformedFrame("chunk index"));
        }
        Ok(())
    }
}

/// Borrowed view over a decrypted chunk plaintext.
#[derive(Debug)]
pub struct ChunkPlaintext<'a> {
    pub metadata: ChunkMetadata,
    pub proof: &'a [u8],
    pub padded: &'a [u8],
}

impl<'a> ChunkPlaintext<'a> {
    pub fn parse(plaintext: &'a [u8]) -> TransferResult<Self> {
        if plaintext.len() <= METADATA_LEN + PROOF_LEN {
            return Err(TransferError::MalformedFrame("plaintext too short"));
        }
        let (meta, rest) = plaintext.split_at(METADATA_LEN);
        let (proof, padded) = rest.split_at(PROOF_LEN);
        let metadata = ChunkMetadata::decode(meta)?;
        metadata.validate(padded.len())?;
        Ok(Self {
            metadata,
            proof,
            padded,
        })
    }

    /// The real bytes inside the padded chunk.
    pub fn real_bytes(&self) -> &'a [u8] {
        &self.padded[self.metadata.chunk_start as usize..self.metadata.chunk_end as usize]
    }
}

/// Assemble `metadata || proof || padded` into `out`, reusing its allocation.
pub fn write_plaintext(
    out: &mut Vec<u8>,
    metadata: &[u8; METADATA_LEN],
    proof: &[u8],
    padded: &[u8],
) {
    out.clear();
    out.reserve(METADATA_LEN + proof.len() + padded.len());
    out.put_slice(metadata);
    out.put_slice(proof);
    out.put_slice(padded);
}

/// Chunk bitmap for tracking accepted chunk indices of one message.
#[derive(Debug, Clone)]
pub struct ChunkBitmap {
    pub total_chunks: u32,
    bits: Vec<u64>,
}

impl ChunkBitmap {
    pub fn new(total_chunks: u32) -> Self {
        let words = (total_chunks as usize).div_ceil(64);
        Self {
            total_chunks,
            bits: vec![0u64; words],
        }
    }

    /// Mark a chunk as received. Returns `false` if it already was.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.total_chunks {
            return false;
        }
        let (word, bit) = ((index / 64) as usize, index % 64);
        let fresh = (self.bits[word] >> bit) & 1 == 0;
        self.bits[word] |= 1u64 << bit;
        fresh
    }

    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.total_chunks {
            return false;
        }
        let (word, bit) = ((index / 64) as usize, index % 64);
        (self.bits[word] >> bit) & 1 == 1
    }

    pub fn received_count(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks).filter(|i| !self.is_set(*i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkMetadata {
        ChunkMetadata {
            schema_version: 1,
            message_type: MessageType::File,
            total_size: 5,
            created_at: 1_700_000_000_000,
            chunk_start: 10,
            chunk_end: 12,
            chunk_index: 1,
            total_chunks: 3,
            filename: "héllo.txt".into(),
        }
    }

    #[test]
    fn test_metadata_layout() {
        let meta = sample();
        let bytes = meta.encode().unwrap();
        assert_eq!(bytes.len(), METADATA_LEN);
        assert_eq!(&bytes[0..2], &[0, 1]);
        assert_eq!(&bytes[2..4], &[0, 1]);
        assert_eq!(bytes[36] as usize, "héllo.txt".len());
        assert_eq!(ChunkMetadata::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_filename_too_long() {
        let mut meta = sample();
        meta.filename = "x".repeat(MAX_FILENAME_LEN + 1);
        assert!(meta.encode().is_err());
        meta.filename = "x".repeat(MAX_FILENAME_LEN);
        assert!(meta.encode().is_ok());
    }

    #[test]
    fn test_validate_ranges() {
        let mut meta = sample();
        assert!(meta.validate(16).is_ok());
        assert!(meta.validate(11).is_err());

        meta.chunk_start = 13;
        assert!(meta.validate(16).is_err());

        let mut meta = sample();
        meta.chunk_end = 16;
        assert!(meta.validate(16).is_err(), "11 real bytes > total_size 5");

        let mut meta = sample();
        meta.chunk_index = 3;
        assert!(meta.validate(16).is_err());
    }

    #[test]
    fn test_plaintext_parse() {
        let meta = sample();
        let proof = vec![0u8; PROOF_LEN];
        let mut padded = vec![0xAAu8; 16];
        padded[10] = b'h';
        padded[11] = b'i';

        let mut out = Vec::new();
        write_plaintext(&mut out, &meta.encode().unwrap(), &proof, &padded);
        let parsed = ChunkPlaintext::parse(&out).unwrap();
        assert_eq!(parsed.metadata, meta);
        assert_eq!(parsed.padded.len(), 16);
        assert_eq!(parsed.real_bytes(), b"hi");

        assert!(ChunkPlaintext::parse(&out[..METADATA_LEN + PROOF_LEN]).is_err());
    }

    #[test]
    fn test_bitmap() {
        let mut bm = ChunkBitmap::new(100);
        assert_eq!(bm.received_count(), 0);
        assert!(!bm.is_complete());

        assert!(bm.set(0));
        assert!(bm.set(50));
        assert!(bm.set(99));
        assert!(!bm.set(50), "second set reports duplicate");
        assert!(!bm.set(100), "out of range");
        assert_eq!(bm.received_count(), 3);
        assert!(bm.is_set(0));
        assert!(!bm.is_set(1));
        assert_eq!(bm.missing_chunks().len(), 97);
    }
}
