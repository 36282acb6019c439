//! ChaCha20-Poly1305 frame sealing
//!
//! Every frame on a secret connection has the same size on the wire:
//! ```text
//! [ chunk_len (4, LE) | chunk (chunk_len) | zero padding | tag (16) ]
//!   \________________ 1028 bytes ________________/
//! ```
//! Frames are sealed with an empty AAD under a per-direction key and a nonce
//! that advances once per frame.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use zeroize::Zeroize;

use super::nonce::NonceCounter;
use crate::core::{
    AEAD_KEY_SIZE, AEAD_TAG_SIZE, CryptoError, DATA_LEN_SIZE, DATA_MAX_SIZE, SEALED_FRAME_SIZE,
    TOTAL_FRAME_SIZE,
};

/// A plaintext frame.
pub type Frame = [u8; TOTAL_FRAME_SIZE];

/// A sealed frame as sent on the wire.
pub type SealedFrame = [u8; SEALED_FRAME_SIZE];

/// A directional session key for AEAD operations.
///
/// Zeroized on drop for security.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; AEAD_KEY_SIZE],
}

impl SessionKey {
    /// Create a new session key from bytes.
    pub fn from_bytes(key: [u8; AEAD_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Create a session key from a slice of exactly 32 bytes.
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; AEAD_KEY_SIZE] = key
            .try_into()
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(Self { key })
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; AEAD_KEY_SIZE] {
        &self.key
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Write a chunk into a plaintext frame, zero-padding the remainder.
///
/// # Panics
/// Panics if `chunk` is longer than [`DATA_MAX_SIZE`]; callers split first.
pub fn encode_frame(chunk: &[u8], frame: &mut Frame) {
    assert!(chunk.len() <= DATA_MAX_SIZE, "chunk exceeds frame capacity");
    frame.fill(0);
    frame[..DATA_LEN_SIZE].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
    frame[DATA_LEN_SIZE..DATA_LEN_SIZE + chunk.len()].copy_from_slice(chunk);
}

/// Read the declared chunk length of a plaintext frame.
pub fn frame_chunk_len(frame: &[u8]) -> usize {
    let mut len = [0u8; DATA_LEN_SIZE];
    len.copy_from_slice(&frame[..DATA_LEN_SIZE]);
    u32::from_le_bytes(len) as usize
}

/// One direction of a secret connection: a key and its nonce.
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
    nonce: NonceCounter,
}

impl FrameCipher {
    /// Create a cipher with the nonce counter at zero.
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            nonce: NonceCounter::new(),
        }
    }

    /// Number of frames processed so far.
    pub fn counter(&self) -> u64 {
        self.nonce.counter()
    }

    /// Seal a chunk of at most [`DATA_MAX_SIZE`] bytes into `sealed`.
    pub fn seal_chunk(&mut self, chunk: &[u8], sealed: &mut SealedFrame) -> Result<(), CryptoError> {
        let mut frame = [0u8; TOTAL_FRAME_SIZE];
        encode_frame(chunk, &mut frame);
        self.seal_frame(&frame, sealed)
    }

    /// Seal a prepared plaintext frame into `sealed`.
    pub fn seal_frame(&mut self, frame: &Frame, sealed: &mut SealedFrame) -> Result<(), CryptoError> {
        let (body, tag_out) = sealed.split_at_mut(TOTAL_FRAME_SIZE);
        body.copy_from_slice(frame);

        let nonce = self.nonce.current();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", body)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        tag_out.copy_from_slice(&tag);

        self.nonce.increment()
    }

    /// Open a sealed frame in place.
    ///
    /// On success the first [`TOTAL_FRAME_SIZE`] bytes of `sealed` hold the
    /// plaintext frame.
    pub fn open_frame(&mut self, sealed: &mut SealedFrame) -> Result<(), CryptoError> {
        let (body, tag) = sealed.split_at_mut(TOTAL_FRAME_SIZE);
        debug_assert_eq!(tag.len(), AEAD_TAG_SIZE);

        let nonce = self.nonce.current();
        self.cipher
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), b"", body, Tag::from_slice(tag))
            .map_err(|_| CryptoError::DecryptionFailed)?;

        self.nonce.increment()
    }
}
