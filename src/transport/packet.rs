//! Multiplexer packets and their length-delimited codec.
//!
//! [`Packet`] is the domain view of [`proto::Packet`]; the codec frames each
//! one with a varint length prefix and bounds it before decoding.

use bytes::{Buf, Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use super::proto::{self, PacketMsg, PacketPing, PacketPong, packet::Sum};
use crate::core::PacketError;

/// A unit of the multiplexed wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Liveness check.
    Ping,
    /// Reply to a ping.
    Pong,
    /// One chunk of a channel message.
    Msg {
        /// Channel the chunk belongs to.
        channel_id: u8,
        /// Whether this chunk completes the message.
        eof: bool,
        /// Chunk payload.
        data: Bytes,
    },
}

impl Packet {
    /// Create a message chunk packet.
    pub fn msg(channel_id: u8, eof: bool, data: impl Into<Bytes>) -> Self {
        Packet::Msg {
            channel_id,
            eof,
            data: data.into(),
        }
    }

    /// Wire representation.
    pub fn to_proto(&self) -> proto::Packet {
        let sum = match self {
            Packet::Ping => Sum::PacketPing(PacketPing {}),
            Packet::Pong => Sum::PacketPong(PacketPong {}),
            Packet::Msg {
                channel_id,
                eof,
                data,
            } => Sum::PacketMsg(PacketMsg {
                channel_id: i32::from(*channel_id),
                eof: *eof,
                data: data.clone(),
            }),
        };
        proto::Packet { sum: Some(sum) }
    }

    /// Convert a decoded wire packet.
    ///
    /// `max_payload` bounds the data of a message chunk.
    pub fn from_proto(packet: proto::Packet, max_payload: usize) -> Result<Self, PacketError> {
        match packet.sum {
            Some(Sum::PacketPing(_)) => Ok(Packet::Ping),
            Some(Sum::PacketPong(_)) => Ok(Packet::Pong),
            Some(Sum::PacketMsg(msg)) => {
                let channel_id = u8::try_from(msg.channel_id)
                    .map_err(|_| PacketError::ChannelIdOutOfRange(i64::from(msg.channel_id)))?;
                if msg.data.len() > max_payload {
                    return Err(PacketError::PayloadTooLarge {
                        len: msg.data.len(),
                        max: max_payload,
                    });
                }
                Ok(Packet::Msg {
                    channel_id,
                    eof: msg.eof,
                    data: msg.data,
                })
            }
            None => Err(PacketError::UnknownPacketType),
        }
    }

    /// Encoded size without the length prefix.
    pub fn encoded_len(&self) -> usize {
        self.to_proto().encoded_len()
    }

    /// Decode a packet body.
    pub fn decode(body: Bytes, max_payload: usize) -> Result<Self, PacketError> {
        Self::from_proto(proto::Packet::decode(body)?, max_payload)
    }
}

/// Largest encoded packet, including its length prefix, for a payload cap.
pub fn max_packet_msg_size(max_payload: usize) -> usize {
    let msg = PacketMsg {
        channel_id: i32::from(u8::MAX),
        eof: true,
        data: Bytes::new(),
    }
    .encoded_len()
        + 1
        + prost::length_delimiter_len(max_payload)
        + max_payload;
    let packet = 1 + prost::length_delimiter_len(msg) + msg;
    prost::length_delimiter_len(packet) + packet
}

/// Length-delimited [`Packet`] codec.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_payload: usize,
    max_size: usize,
}

impl PacketCodec {
    /// Create a codec for packets carrying at most `max_payload` data bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            max_size: max_packet_msg_size(max_payload),
        }
    }

    /// Largest accepted packet, including its length prefix.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Largest data chunk per packet.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
        let Some((len, prefix)) = proto::peek_length_delimiter(src)? else {
            return Ok(None);
        };
        proto::check_delimited_len(len, self.max_size)?;

        let total = prefix + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(prefix);
        let body = src.split_to(len).freeze();
        Packet::decode(body, self.max_payload).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), PacketError> {
        <Self as Encoder<&Packet>>::encode(self, &packet, dst)
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, packet: &Packet, dst: &mut BytesMut) -> Result<(), PacketError> {
        let packet = packet.to_proto();
        let len = packet.encoded_len();
        dst.reserve(prost::length_delimiter_len(len) + len);
        packet.encode_length_delimited(dst)?;
        Ok(())
    }
}
