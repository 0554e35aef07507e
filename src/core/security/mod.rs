//! Security module: long-term identity and the per-chunk crypto engine.
//!
//! Provides:
//! - Long-term Ed25519 identity (signaling challenge, ephemeral key binding)
//! - Per-chunk ephemeral keys, X25519 agreement and AES-256-GCM sealing
//! - SHA-512 hashing used by the Merkle tree and content addressing

pub mod crypto;
pub mod identity;

pub use identity::Identity;
