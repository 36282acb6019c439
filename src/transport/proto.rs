//! Protobuf messages carried on the wire.
//!
//! ```text
//! BytesValue     { bytes value = 1; }
//! PublicKey      { oneof sum { bytes ed25519 = 1; bytes secp256k1 = 2; bytes bls12381 = 3; } }
//! AuthSigMessage { PublicKey pub_key = 1; bytes sig = 2; }
//!
//! Packet    { oneof sum { PacketPing packet_ping = 1;
//!                         PacketPong packet_pong = 2;
//!                         PacketMsg  packet_msg  = 3; } }
//! PacketMsg { int32 channel_id = 1; bool eof = 2; bytes data = 3; }
//! ```
//!
//! Messages travel with a varint length prefix.

use bytes::Bytes;
use prost::Message;

use crate::core::PacketError;

/// Longest varint encoding of a length prefix.
pub const MAX_VARINT_LEN: usize = 10;

// =============================================================================
// HANDSHAKE MESSAGES
// =============================================================================

/// Wrapper for the ephemeral key exchange.
#[derive(Clone, PartialEq, Message)]
pub struct BytesValue {
    /// Wrapped bytes.
    #[prost(bytes = "bytes", tag = "1")]
    pub value: Bytes,
}

/// An identity key of any supported type.
#[derive(Clone, PartialEq, Message)]
pub struct PublicKey {
    /// The key, tagged by type.
    #[prost(oneof = "public_key::Sum", tags = "1, 2, 3")]
    pub sum: Option<public_key::Sum>,
}

/// Variants of [`PublicKey`].
pub mod public_key {
    use bytes::Bytes;

    /// Key bytes by type.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Sum {
        /// An Ed25519 key.
        #[prost(bytes = "bytes", tag = "1")]
        Ed25519(Bytes),
        /// A secp256k1 key.
        #[prost(bytes = "bytes", tag = "2")]
        Secp256k1(Bytes),
        /// A BLS12-381 key.
        #[prost(bytes = "bytes", tag = "3")]
        Bls12381(Bytes),
    }
}

impl PublicKey {
    /// Wrap an Ed25519 key.
    pub fn ed25519(key: impl Into<Bytes>) -> Self {
        Self {
            sum: Some(public_key::Sum::Ed25519(key.into())),
        }
    }

    /// Human-readable key type.
    pub fn type_name(&self) -> &'static str {
        match &self.sum {
            Some(public_key::Sum::Ed25519(_)) => "ed25519",
            Some(public_key::Sum::Secp256k1(_)) => "secp256k1",
            Some(public_key::Sum::Bls12381(_)) => "bls12_381",
            None => "none",
        }
    }
}

/// Identity and challenge signature sent over the encrypted channel.
#[derive(Clone, PartialEq, Message)]
pub struct AuthSigMessage {
    /// Identity key of the sender.
    #[prost(message, optional, tag = "1")]
    pub pub_key: Option<PublicKey>,
    /// Signature over the handshake challenge.
    #[prost(bytes = "bytes", tag = "2")]
    pub sig: Bytes,
}

// =============================================================================
// PACKETS
// =============================================================================

/// Liveness check.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct PacketPing {}

/// Reply to a ping.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct PacketPong {}

/// One chunk of a channel message.
#[derive(Clone, PartialEq, Message)]
pub struct PacketMsg {
    /// Channel the chunk belongs to.
    #[prost(int32, tag = "1")]
    pub channel_id: i32,
    /// Whether this chunk completes the message.
    #[prost(bool, tag = "2")]
    pub eof: bool,
    /// Chunk payload.
    #[prost(bytes = "bytes", tag = "3")]
    pub data: Bytes,
}

/// A unit of the multiplexed wire protocol.
#[derive(Clone, PartialEq, Message)]
pub struct Packet {
    /// The packet, tagged by kind.
    #[prost(oneof = "packet::Sum", tags = "1, 2, 3")]
    pub sum: Option<packet::Sum>,
}

/// Variants of [`Packet`].
pub mod packet {
    /// Packet kinds.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Sum {
        /// A ping.
        #[prost(message, tag = "1")]
        PacketPing(super::PacketPing),
        /// A pong.
        #[prost(message, tag = "2")]
        PacketPong(super::PacketPong),
        /// A message chunk.
        #[prost(message, tag = "3")]
        PacketMsg(super::PacketMsg),
    }
}

// =============================================================================
// FRAMING
// =============================================================================

/// Encode `msg` with its varint length prefix.
pub fn encode_delimited<M: Message>(msg: &M) -> Vec<u8> {
    msg.encode_length_delimited_to_vec()
}

/// Decode the length prefix at the front of `src` without consuming it.
///
/// Returns the body length and the prefix length, or `None` while the
/// prefix is still incomplete.
pub fn peek_length_delimiter(src: &[u8]) -> Result<Option<(usize, usize)>, PacketError> {
    let terminated = src.iter().take(MAX_VARINT_LEN).any(|b| b & 0x80 == 0);
    if !terminated && src.len() < MAX_VARINT_LEN {
        return Ok(None);
    }
    let len = prost::decode_length_delimiter(src)?;
    Ok(Some((len, prost::length_delimiter_len(len))))
}

/// Fail if a declared length is over `max`.
pub fn check_delimited_len(len: usize, max: usize) -> Result<(), PacketError> {
    if len > max {
        return Err(PacketError::MessageTooLarge {
            len: len as u64,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_value_wire_format() {
        let msg = encode_delimited(&BytesValue {
            value: Bytes::from_static(&[0xaa; 32]),
        });
        assert_eq!(&msg[..3], &[0x22, 0x0a, 0x20]);
        assert_eq!(msg.len(), 35);

        let decoded = BytesValue::decode_length_delimited(&msg[..]).unwrap();
        assert_eq!(&decoded.value[..], &[0xaa; 32]);
    }

    #[test]
    fn test_bytes_value_skips_unknown_fields() {
        // field 7 varint 42, then field 1 "key"
        let raw = [0x38, 42, 0x0a, 3, b'k', b'e', b'y'];
        assert_eq!(&BytesValue::decode(&raw[..]).unwrap().value[..], b"key");
    }

    #[test]
    fn test_auth_sig_message_wire_format() {
        let msg = AuthSigMessage {
            pub_key: Some(PublicKey::ed25519(Bytes::from_static(&[1u8; 32]))),
            sig: Bytes::from_static(&[2u8; 64]),
        };
        let encoded = msg.encode_to_vec();
        assert_eq!(&encoded[..4], &[0x0a, 0x22, 0x0a, 0x20]);
        assert_eq!(AuthSigMessage::decode(&encoded[..]).unwrap(), msg);
    }

    #[test]
    fn test_public_key_type_names() {
        let key = PublicKey {
            sum: Some(public_key::Sum::Secp256k1(Bytes::from_static(&[3u8; 33]))),
        };
        let decoded = PublicKey::decode(&key.encode_to_vec()[..]).unwrap();
        assert_eq!(decoded.type_name(), "secp256k1");
        assert_eq!(PublicKey::default().type_name(), "none");
    }

    #[test]
    fn test_peek_length_delimiter() {
        assert_eq!(peek_length_delimiter(&[]).unwrap(), None);
        assert_eq!(peek_length_delimiter(&[0xac]).unwrap(), None);
        assert_eq!(
            peek_length_delimiter(&[0xac, 0x02, 0xff]).unwrap(),
            Some((300, 2))
        );
    }

    #[test]
    fn test_peek_length_delimiter_overflow() {
        assert!(matches!(
            peek_length_delimiter(&[0xff; 11]),
            Err(PacketError::Decode(_))
        ));
    }

    #[test]
    fn test_truncated_field() {
        // field 1, declared length 10, five bytes present
        let raw = [0x0a, 10, b's', b'h', b'o', b'r', b't'];
        assert!(BytesValue::decode(&raw[..]).is_err());
    }
}
