//! Error types for the secret connection and the multiplexer.

use thiserror::Error;

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The remote ephemeral key is a low-order point.
    #[error("remote ephemeral key is a low-order point")]
    LowOrderPoint,

    /// A public key had the wrong length or encoding.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The remote identity is not an Ed25519 key.
    #[error("unexpected public key type: {0}")]
    UnexpectedPubKeyType(String),

    /// The remote signature over the challenge did not verify.
    #[error("challenge verification failed")]
    ChallengeVerification,

    /// HKDF expansion failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Nonce counter exhausted - connection must terminate.
    #[error("nonce counter exhausted - connection must terminate")]
    CounterExhaustion,
}

/// Errors decoding the protobuf wire format.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The message bytes were not valid protobuf.
    #[cfg(feature = "transport")]
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The output buffer could not hold the message.
    #[cfg(feature = "transport")]
    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    /// A length prefix exceeded the allowed size.
    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge {
        /// Declared length.
        len: u64,
        /// Allowed length.
        max: usize,
    },

    /// A packet payload exceeded the configured maximum.
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Allowed length.
        max: usize,
    },

    /// A packet carried none of the known variants.
    #[error("unknown packet type")]
    UnknownPacketType,

    /// A channel id did not fit in a byte.
    #[error("channel id out of range: {0}")]
    ChannelIdOutOfRange(i64),

    /// A required field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the secret connection and the multiplexer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Packet codec error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A decrypted frame declared more than the maximum chunk.
    #[error("chunk length {0} exceeds frame capacity")]
    ChunkTooBig(usize),

    /// No pong arrived within the pong timeout.
    #[error("pong timeout")]
    PongTimeout,

    /// A packet arrived for an unregistered channel.
    #[error("unknown channel {0:#04x}")]
    UnknownChannel(u8),

    /// A reassembled message exceeded the channel capacity.
    #[error("message on channel {channel_id:#04x} exceeds {capacity} bytes")]
    MessageTooBig {
        /// Channel id.
        channel_id: u8,
        /// Channel receive capacity.
        capacity: usize,
    },

    /// The send queue of a channel is full.
    #[error("send queue of channel {0:#04x} is full")]
    QueueFull(u8),

    /// A channel was registered twice.
    #[error("channel {0:#04x} already registered")]
    DuplicateChannel(u8),

    /// The connection was already started.
    #[error("connection already started")]
    AlreadyStarted,

    /// The connection is not running.
    #[error("connection is not running")]
    NotRunning,

    /// The connection was closed locally.
    #[error("connection closed: {0}")]
    Closed(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ConnectionError {
    /// Whether this error is the peer closing the stream.
    pub fn is_eof(&self) -> bool {
        match self {
            ConnectionError::Io(err) | ConnectionError::Packet(PacketError::Io(err)) => {
                err.kind() == std::io::ErrorKind::UnexpectedEof
            }
            _ => false,
        }
    }
}
