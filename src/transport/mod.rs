//! Transport layer
//!
//! This module implements the connection stack over any async byte stream:
//!
//! - **Secret connection**: [`SecretConnection`] runs the station-to-station
//!   handshake and seals all traffic in fixed-size frames
//! - **Packet codec**: [`PacketCodec`] frames [`Packet`]s with a varint length
//! - **Multiplexing**: [`MConnection`] schedules prioritized channels over one
//!   secret connection, with ping/pong liveness and rate limiting
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Reactors (channel users)         │
//! ├─────────────────────────────────────────┤
//! │     MConnection: channels, ping/pong    │  ← connection.rs
//! ├─────────────────────────────────────────┤
//! │         Packets (varint framed)         │  ← packet.rs
//! ├─────────────────────────────────────────┤
//! │   SecretConnection: sealed 1028 frames  │  ← secret.rs
//! ├─────────────────────────────────────────┤
//! │       TCP or any AsyncRead + Write      │
//! └─────────────────────────────────────────┘
//! ```

mod channel;
mod connection;
mod packet;
pub mod proto;
mod secret;
mod status;
mod timer;

pub use connection::{ChannelHandle, ConnectionPhase, MConnection, OnReceive};
pub use packet::{Packet, PacketCodec, max_packet_msg_size};
pub use secret::{
    RawStream, SecretConnection, SecretReadHalf, SecretReader, SecretWriteHalf, SecretWriter,
};
pub use status::{ChannelStatus, Status};
