//! Binary wire frame.
//!
//! ```text
//! ephemeral pk (32) || ephemeral signature (64) || nonce (12) || ciphertext || tag (16)
//! ```
//!
//! The signature is made by the sender's long-term identity over the
//! ephemeral public key.

use crate::core::config::{NONCE_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN, TAG_LEN};
use crate::core::error::{TransferError, TransferResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Bytes in front of the sealed payload.
pub const HEADER_LEN: usize = PUBLIC_KEY_LEN + SIGNATURE_LEN + NONCE_LEN;

/// Smallest frame that can hold a header and an empty AEAD payload.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TAG_LEN;

/// Borrowed view over a received frame.
#[derive(Debug)]
pub struct WireFrame<'a> {
    pub ephemeral_pk: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
    pub nonce: [u8; NONCE_LEN],
    /// `ciphertext || tag`
    pub sealed: &'a [u8],
}

impl<'a> WireFrame<'a> {
    pub fn parse(frame: &'a [u8]) -> TransferResult<Self> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(TransferError::MalformedFrame("frame too short"));
        }
        let (pk, rest) = frame.split_at(PUBLIC_KEY_LEN);
        let (sig, rest) = rest.split_at(SIGNATURE_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let mut frame = Self {
            ephemeral_pk: [0u8; PUBLIC_KEY_LEN],
            signature: [0u8; SIGNATURE_LEN],
            nonce: [0u8; NONCE_LEN],
            sealed,
        };
        frame.ephemeral_pk.copy_from_slice(pk);
        frame.signature.copy_from_slice(sig);
        frame.nonce.copy_from_slice(nonce);
        Ok(frame)
    }
}

/// Assemble a frame ready for the data channel.
pub fn build_frame(
    ephemeral_pk: &[u8; PUBLIC_KEY_LEN],
    signature: &[u8; SIGNATURE_LEN],
    nonce: &[u8; NONCE_LEN],
    sealed: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + sealed.len());
    buf.put_slice(ephemeral_pk);
    buf.put_slice(signature);
    buf.put_slice(nonce);
    buf.put_slice(sealed);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_fields() {
        let sealed = vec![9u8; 40];
        let frame = build_frame(&[1u8; 32], &[2u8; 64], &[3u8; 12], &sealed);
        assert_eq!(frame.len(), HEADER_LEN + 40);

        let parsed = WireFrame::parse(&frame).unwrap();
        assert_eq!(parsed.ephemeral_pk, [1u8; 32]);
        assert_eq!(parsed.signature, [2u8; 64]);
        assert_eq!(parsed.nonce, [3u8; 12]);
        assert_eq!(parsed.sealed, &sealed[..]);
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(WireFrame::parse(&[0u8; MIN_FRAME_LEN - 1]).is_err());
        assert!(WireFrame::parse(&[0u8; MIN_FRAME_LEN]).is_ok());
    }
}
