//! Wire and timing constants.
//!
//! The frame sizes and handshake labels are part of the wire protocol and
//! MUST NOT be changed. The remaining values are defaults.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// ChaCha20-Poly1305 key size.
pub const AEAD_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size.
pub const AEAD_NONCE_SIZE: usize = 12;

/// Offset of the little-endian counter inside the nonce.
pub const NONCE_COUNTER_OFFSET: usize = 4;

/// X25519 and Ed25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of the authentication challenge.
pub const CHALLENGE_SIZE: usize = 32;

/// HKDF output: receive key, send key and 32 bytes nothing reads.
pub const KEY_MATERIAL_SIZE: usize = 2 * AEAD_KEY_SIZE + CHALLENGE_SIZE;

// =============================================================================
// SEALED FRAME LAYOUT
// =============================================================================

/// Little-endian chunk length prefix inside a frame.
pub const DATA_LEN_SIZE: usize = 4;

/// Maximum plaintext bytes carried by one frame.
pub const DATA_MAX_SIZE: usize = 1024;

/// Plaintext frame size: length prefix plus a zero-padded chunk.
pub const TOTAL_FRAME_SIZE: usize = DATA_MAX_SIZE + DATA_LEN_SIZE;

/// Frame size on the wire.
pub const SEALED_FRAME_SIZE: usize = TOTAL_FRAME_SIZE + AEAD_TAG_SIZE;

/// Socket write buffer used by the secret connection.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 128 * 1024;

/// Socket read buffer used by the secret connection.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 65 * 1024;

/// Upper bound for a length-delimited handshake message.
pub const MAX_HANDSHAKE_MSG_SIZE: usize = 1024 * 1024;

// =============================================================================
// HANDSHAKE LABELS
// =============================================================================

/// HKDF info string for key and challenge derivation.
pub const KEY_AND_CHALLENGE_GEN_INFO: &[u8] = b"TENDERMINT_SECRET_CONNECTION_KEY_AND_CHALLENGE_GEN";

/// Transcript domain separator.
pub const TRANSCRIPT_DOMAIN: &[u8] = b"TENDERMINT_SECRET_CONNECTION_TRANSCRIPT_HASH";

/// Transcript label for the lesser ephemeral key.
pub const LABEL_EPHEMERAL_LOWER_PUBLIC_KEY: &[u8] = b"EPHEMERAL_LOWER_PUBLIC_KEY";

/// Transcript label for the greater ephemeral key.
pub const LABEL_EPHEMERAL_UPPER_PUBLIC_KEY: &[u8] = b"EPHEMERAL_UPPER_PUBLIC_KEY";

/// Transcript label for the Diffie-Hellman secret.
pub const LABEL_DH_SECRET: &[u8] = b"DH_SECRET";

/// Transcript label the signed challenge is extracted under.
pub const LABEL_SECRET_CONNECTION_MAC: &[u8] = b"SECRET_CONNECTION_MAC";

/// Bound on the whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

// =============================================================================
// MULTIPLEXED CONNECTION
// =============================================================================

/// Largest payload a single packet may carry.
pub const DEFAULT_MAX_PACKET_MSG_PAYLOAD_SIZE: usize = 1024;

/// Packets written per wake-up of the send loop.
pub const NUM_BATCH_PACKET_MSGS: usize = 10;

/// Packet write buffer; filling it writes through to the secret connection.
pub const MIN_WRITE_BUFFER_SIZE: usize = 65536;

/// Initial capacity of the packet read buffer.
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Interval between `recently_sent` decays.
pub const UPDATE_STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Factor applied to `recently_sent` at each decay.
pub const RECENTLY_SENT_DECAY: f64 = 0.8;

/// Delay between the first buffered packet and the flush.
pub const DEFAULT_FLUSH_THROTTLE: Duration = Duration::from_millis(10);

/// Send rate limit in bytes per second.
pub const DEFAULT_SEND_RATE: i64 = 512_000;

/// Receive rate limit in bytes per second.
pub const DEFAULT_RECV_RATE: i64 = 512_000;

/// Interval between pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Time allowed for a pong after a ping.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(45);

// =============================================================================
// CHANNEL DEFAULTS
// =============================================================================

/// Scheduling weight of a channel.
pub const DEFAULT_PRIORITY: u32 = 1;

/// Messages a channel may queue before senders block.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1;

/// Initial capacity of the reassembly buffer.
pub const DEFAULT_RECV_BUFFER_CAPACITY: usize = 4096;

/// Largest message a channel reassembles (21 MiB).
pub const DEFAULT_RECV_MESSAGE_CAPACITY: usize = 22_020_096;

/// Reassembled messages a channel buffers when no receive callback is set.
pub const RECV_QUEUE_CAPACITY: usize = 100;

// =============================================================================
// FLOW RATE
// =============================================================================

/// Granularity of the shared flow-rate clock.
pub const CLOCK_RATE: Duration = Duration::from_millis(20);

/// Default sampling period of a monitor.
pub const DEFAULT_SAMPLE_RATE: Duration = Duration::from_millis(100);

/// Default EMA window of a monitor.
pub const DEFAULT_WINDOW_SIZE: Duration = Duration::from_secs(1);

/// Shortest sleep taken by a blocking limit.
pub const MIN_LIMIT_WAIT: Duration = Duration::from_millis(5);

/// Cap on the estimated remaining transfer time.
pub const TIME_REM_LIMIT: Duration = Duration::from_secs(999 * 3600 + 59 * 60 + 59);
