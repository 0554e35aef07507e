//! Long-term Ed25519 identity for peer authentication.
//!
//! Each peer holds a persistent Ed25519 keypair used to:
//! - Answer the signaling relay's ownership challenge
//! - Sign every per-chunk ephemeral public key
//! - Receive chunks (the public half is the AEAD recipient key)

use crate::core::config::{PUBLIC_KEY_LEN, SECRET_KEY_LEN, SIGNATURE_LEN};
use crate::core::security::crypto;
use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};

/// Long-term identity keypair.
#[derive(Clone)]
pub struct Identity {
    key: SigningKey,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild an identity from its 64-byte keypair encoding.
    pub fn from_secret_bytes(bytes: &[u8; SECRET_KEY_LEN]) -> Result<Self> {
        let key = SigningKey::from_keypair_bytes(bytes)
            .map_err(|e| anyhow!("invalid identity keypair: {e}"))?;
        Ok(Self { key })
    }

    /// Load an identity file, creating it if missing.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let data = std::fs::read(path)
                .with_context(|| format!("reading identity {}", path.display()))?;
            let bytes: [u8; SECRET_KEY_LEN] = data.as_slice().try_into().map_err(|_| {
                anyhow!("invalid identity file: expected {SECRET_KEY_LEN} bytes, got {}", data.len())
            })?;
            return Self::from_secret_bytes(&bytes);
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, identity.secret_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(identity)
    }

    /// `~/.sealdrop/identity.key`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("No home dir"))?;
        Ok(home.join(".sealdrop").join("identity.key"))
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.verifying_key().to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_LEN] {
        self.key.to_keypair_bytes()
    }

    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.key.sign(data).to_bytes()
    }

    /// Verify `sig` over `data` against a peer's long-term key.
    pub fn verify(data: &[u8], sig: &[u8; SIGNATURE_LEN], signer: &[u8; PUBLIC_KEY_LEN]) -> bool {
        crypto::verify(data, sig, signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generate() {
        let id = Identity::generate();
        assert_ne!(id.public_key(), [0u8; 32]);
        assert_ne!(Identity::generate().public_key(), id.public_key());
    }

    #[test]
    fn test_sign_and_verify() {
        let id = Identity::generate();
        let sig = id.sign(b"challenge");
        assert!(Identity::verify(b"challenge", &sig, &id.public_key()));
        assert!(!Identity::verify(b"challenge", &sig, &Identity::generate().public_key()));
    }

    #[test]
    fn test_load_or_create_persists() {
        let dir = std::env::temp_dir()
            .join("sealdrop_test")
            .join(uuid::Uuid::new_v4().to_string());
        let path = dir.join("identity.key");

        let created = Identity::load_or_create(&path).unwrap();
        let loaded = Identity::load_or_create(&path).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());
        assert_eq!(std::fs::read(&path).unwrap().len(), SECRET_KEY_LEN);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rejects_truncated_file() {
        let dir = std::env::temp_dir()
            .join("sealdrop_test")
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("identity.key");
        std::fs::write(&path, [7u8; 10]).unwrap();

        assert!(Identity::load_or_create(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
