//! Signaling envelope exchanged with the relay server.
//!
//! One JSON object per message, tagged by `type`. Keys and signatures are
//! hex encoded. The relay only routes by `toPeerId`; it never looks inside
//! descriptions, candidates or relayed messages.

pub mod websocket;

use crate::core::connection::transport::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use websocket::SignalingClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: Uuid,
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Server greeting: confirms our id and asks us to prove key ownership.
    PeerId { peer_id: Uuid, challenge: String },
    /// Server asks for a fresh proof.
    Challenge { challenge: String },
    /// Answer to a challenge: Ed25519 signature over the challenge bytes.
    Signature {
        peer_id: Uuid,
        #[serde(with = "hex::serde")]
        public_key: [u8; 32],
        #[serde(with = "hex::serde")]
        signature: [u8; 64],
    },
    /// Join request from the client, confirmation from the server.
    RoomId { room_id: String },
    /// Roster request (empty `peers`) or response.
    Peers {
        room_id: String,
        #[serde(default)]
        peers: Vec<PeerInfo>,
    },
    Description {
        from_peer_id: Uuid,
        #[serde(with = "hex::serde")]
        from_peer_public_key: [u8; 32],
        to_peer_id: Uuid,
        room_id: String,
        description: SessionDescription,
    },
    Candidate {
        from_peer_id: Uuid,
        to_peer_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        candidate: IceCandidate,
    },
    /// Relayed channel payload, used for acknowledgements when no channel
    /// to the peer is open.
    Message {
        from_peer_id: Uuid,
        to_peer_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        message: String,
    },
    /// Introduction of a peer that just joined the room.
    Connection {
        from_peer_id: Uuid,
        #[serde(with = "hex::serde")]
        from_peer_public_key: [u8; 32],
        to_peer_id: Uuid,
        room_id: String,
    },
    Ping,
    Pong,
    Error { message: String },
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PeerId { .. } => "peerId",
            Self::Challenge { .. } => "challenge",
            Self::Signature { .. } => "signature",
            Self::RoomId { .. } => "roomId",
            Self::Peers { .. } => "peers",
            Self::Description { .. } => "description",
            Self::Candidate { .. } => "candidate",
            Self::Message { .. } => "message",
            Self::Connection { .. } => "connection",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    /// Addressee of a peer-to-peer relay message.
    pub fn recipient(&self) -> Option<Uuid> {
        match self {
            Self::Description { to_peer_id, .. }
            | Self::Candidate { to_peer_id, .. }
            | Self::Message { to_peer_id, .. }
            | Self::Connection { to_peer_id, .. } => Some(*to_peer_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::transport::SdpKind;

    #[test]
    fn test_tags_and_field_names() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(SignalMessage::RoomId { room_id: "r".into() }).unwrap();
        assert_eq!(json["type"], "roomId");
        assert_eq!(json["roomId"], "r");

        let desc = SignalMessage::Description {
            from_peer_id: id,
            from_peer_public_key: [1u8; 32],
            to_peer_id: id,
            room_id: "r".into(),
            description: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            },
        };
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "description");
        assert_eq!(json["fromPeerPublicKey"], hex::encode([1u8; 32]));
        assert_eq!(json["description"]["type"], "offer");
        assert_eq!(desc.recipient(), Some(id));

        let ping: SignalMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, SignalMessage::Ping);
    }

    #[test]
    fn test_roster_request_without_peers() {
        let msg: SignalMessage = serde_json::from_str(r#"{"type":"peers","roomId":"lobby"}"#).unwrap();
        assert_eq!(
            msg,
            SignalMessage::Peers {
                room_id: "lobby".into(),
                peers: vec![]
            }
        );
        assert_eq!(msg.kind(), "peers");
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"signature","peerId":"{id}","publicKey":"abcd","signature":"00"}}"#);
        assert!(serde_json::from_str::<SignalMessage>(&raw).is_err());
    }
}
