//! # MConnection transport
//!
//! An authenticated, encrypted, multiplexed peer connection:
//!
//! - **Secret connection**: station-to-station handshake over ephemeral
//!   X25519 keys, authenticated with Ed25519 identities, followed by
//!   ChaCha20-Poly1305 sealed fixed-size frames
//! - **Multiplexing**: many prioritized logical channels share one stream,
//!   scheduled by recent traffic relative to priority
//! - **Liveness**: periodic ping with a pong deadline
//! - **Rate limiting**: send and receive throughput capped by a flow monitor
//!
//! ## Feature Flags
//!
//! - `crypto` (default): Keys, key agreement, frame cipher
//! - `transport` (default): Flow monitor, secret connection, multiplexer
//!
//! ## Modules
//!
//! - [`core`]: Constants, configuration and error types (always included)
//! - [`crypto`]: Security primitives (requires `crypto` feature)
//! - [`flowrate`]: Throughput monitor and limiter (requires `transport` feature)
//! - [`transport`]: Connection stack (requires `transport` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use mconn_transport::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ConnectionError> {
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let (alice, bob) = (IdentityKeypair::generate(), IdentityKeypair::generate());
//!
//! let (a, b) = tokio::try_join!(
//!     SecretConnection::make(a, &alice),
//!     SecretConnection::make(b, &bob),
//! )?;
//! assert_eq!(a.remote_pub_key(), &bob.public_key());
//! assert_eq!(b.remote_pub_key(), &alice.public_key());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Crypto layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

// Flow rate monitoring (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod flowrate;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    #[cfg(feature = "crypto")]
    pub use crate::crypto::{IdentityKeypair, VerifyingKey};

    #[cfg(feature = "transport")]
    pub use crate::flowrate::Monitor;

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        ChannelHandle, ChannelStatus, ConnectionPhase, MConnection, Packet, PacketCodec,
        SecretConnection, Status,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{ChannelDescriptor, ConnectionError, CryptoError, MConnConfig, PacketError};

#[cfg(feature = "crypto")]
pub use crypto::IdentityKeypair;

#[cfg(feature = "transport")]
pub use transport::{ChannelHandle, MConnection, SecretConnection};
