//! Crypto engine: SHA-512 hashing, ephemeral signing keys, and AEAD.
//!
//! AEAD keys are agreed per chunk:
//!
//! ```text
//! shared = X25519(scalar(sender_sk64), montgomery(recipient_pk32))
//! key    = HKDF-SHA-512(ikm = shared, salt = sort(pk_a, pk_b), info = "sealdrop-chunk-v1")
//! frame  = AES-256-GCM(key, nonce12, plaintext, aad)
//! ```
//!
//! Both sides hold Ed25519 keys; they are mapped onto Curve25519 so a single
//! keypair both signs and agrees keys. The derivation is symmetric, so
//! `open(seal(m, pk_b, sk_a), pk_a, sk_b)` recovers `m`.

use crate::core::config::{HASH_LEN, NONCE_LEN, PUBLIC_KEY_LEN, SECRET_KEY_LEN, SIGNATURE_LEN};
use crate::core::error::{TransferError, TransferResult};
use aes_gcm::aead::{Aead, AeadInPlace, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

const KDF_INFO: &[u8] = b"sealdrop-chunk-v1";

// ── Hashing ──────────────────────────────────────────────────────────────────

/// SHA-512 of `data`.
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let digest = Sha512::digest(data);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

/// SHA-512 over the concatenation of `parts`, without materialising it.
pub fn hash_parts(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Fresh random nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

// ── Signing ──────────────────────────────────────────────────────────────────

/// Single-use signing keypair generated per chunk.
pub struct EphemeralKeypair {
    key: SigningKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.verifying_key().to_bytes()
    }

    pub fn secret_key(&self) -> [u8; SECRET_KEY_LEN] {
        self.key.to_keypair_bytes()
    }
}

/// Sign `msg` with a 64-byte Ed25519 keypair.
pub fn sign(msg: &[u8], sk: &[u8; SECRET_KEY_LEN]) -> TransferResult<[u8; SIGNATURE_LEN]> {
    let key = SigningKey::from_keypair_bytes(sk)
        .map_err(|e| TransferError::AllocationFailed(format!("bad signing key: {e}")))?;
    Ok(key.sign(msg).to_bytes())
}

/// Verify an Ed25519 signature. Malformed keys verify as `false`.
pub fn verify(msg: &[u8], sig: &[u8; SIGNATURE_LEN], pk: &[u8; PUBLIC_KEY_LEN]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(pk) else {
        return false;
    };
    vk.verify_strict(msg, &Signature::from_bytes(sig)).is_ok()
}

// ── Key agreement ────────────────────────────────────────────────────────────

fn derive_key(
    peer_pk: &[u8; PUBLIC_KEY_LEN],
    own_sk: &[u8; SECRET_KEY_LEN],
) -> TransferResult<[u8; 32]> {
    let own = SigningKey::from_keypair_bytes(own_sk).map_err(|_| TransferError::DecryptionFailed)?;
    let peer = VerifyingKey::from_bytes(peer_pk).map_err(|_| TransferError::DecryptionFailed)?;

    let secret = StaticSecret::from(own.to_scalar_bytes());
    let point = X25519PublicKey::from(peer.to_montgomery().to_bytes());
    let shared = secret.diffie_hellman(&point);
    if !shared.was_contributory() {
        return Err(TransferError::DecryptionFailed);
    }

    let own_pk = own.verifying_key().to_bytes();
    let mut salt = [own_pk, *peer_pk];
    salt.sort();

    let hk = Hkdf::<Sha512>::new(Some(&salt.concat()), shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(KDF_INFO, &mut key)
        .map_err(|e| TransferError::HashFailed(e.to_string()))?;
    Ok(key)
}

// ── AEAD ─────────────────────────────────────────────────────────────────────

/// Encrypt `plaintext` for `recipient_pk`. Output is `ciphertext || tag`.
pub fn seal(
    plaintext: &[u8],
    recipient_pk: &[u8; PUBLIC_KEY_LEN],
    sender_sk: &[u8; SECRET_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ad: &[u8],
) -> TransferResult<Vec<u8>> {
    let key = derive_key(recipient_pk, sender_sk)
        .map_err(|e| TransferError::AllocationFailed(e.to_string()))?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| TransferError::AllocationFailed(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad: ad })
        .map_err(|_| TransferError::AllocationFailed("aead seal".into()))
}

/// Decrypt `ciphertext || tag` from `sender_pk`.
pub fn open(
    ciphertext: &[u8],
    sender_pk: &[u8; PUBLIC_KEY_LEN],
    recipient_sk: &[u8; SECRET_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ad: &[u8],
) -> TransferResult<Vec<u8>> {
    let mut buf = ciphertext.to_vec();
    open_in_place(&mut buf, sender_pk, recipient_sk, nonce, ad)?;
    Ok(buf)
}

/// Decrypt in place into a caller-owned scratch buffer. On success `buf`
/// holds the plaintext; on failure its contents are unspecified.
pub fn open_in_place(
    buf: &mut Vec<u8>,
    sender_pk: &[u8; PUBLIC_KEY_LEN],
    recipient_sk: &[u8; SECRET_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ad: &[u8],
) -> TransferResult<()> {
    let key = derive_key(sender_pk, recipient_sk)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| TransferError::DecryptionFailed)?;
    cipher
        .decrypt_in_place(Nonce::from_slice(nonce), ad, buf)
        .map_err(|_| TransferError::DecryptionFailed)
}
