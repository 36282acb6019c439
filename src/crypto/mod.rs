//! Security layer
//!
//! Implements the cryptographic primitives of a secret connection:
//! - Identity (Ed25519) and ephemeral (X25519) keys
//! - Station-to-station key agreement and merlin challenge transcript
//! - ChaCha20-Poly1305 frame sealing
//! - Per-direction nonce counters

mod aead;
mod handshake;
mod keys;
mod nonce;

pub use aead::*;
pub use handshake::*;
pub use keys::*;
pub use nonce::*;

pub use ed25519_dalek::{Signature, VerifyingKey};
