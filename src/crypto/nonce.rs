//! Nonce construction for ChaCha20-Poly1305
//!
//! Each direction of a secret connection keeps its own 96-bit nonce:
//! - Zeros (4 bytes)
//! - Counter (8 bytes, little-endian)
//!
//! The counter starts at zero and advances once per sealed or opened frame.
//! It never wraps; exhausting it terminates the connection.

use crate::core::{AEAD_NONCE_SIZE, CryptoError, NONCE_COUNTER_OFFSET};

/// Construct a 12-byte ChaCha20-Poly1305 nonce.
///
/// Layout:
/// ```text
/// [ zeros (4) | counter (8) ]
/// ```
pub fn construct_nonce(counter: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[NONCE_COUNTER_OFFSET..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Parse the counter back out of a nonce.
pub fn parse_nonce(nonce: &[u8; AEAD_NONCE_SIZE]) -> u64 {
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&nonce[NONCE_COUNTER_OFFSET..]);
    u64::from_le_bytes(counter)
}

/// A per-direction nonce counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceCounter {
    counter: u64,
}

impl NonceCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Create a counter at a given value.
    pub fn from_counter(counter: u64) -> Self {
        Self { counter }
    }

    /// Current counter value.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// The nonce for the current counter value.
    pub fn current(&self) -> [u8; AEAD_NONCE_SIZE] {
        construct_nonce(self.counter)
    }

    /// Advance to the next nonce.
    ///
    /// Fails instead of wrapping so a nonce is never reused.
    pub fn increment(&mut self) -> Result<(), CryptoError> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhaustion)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_construction() {
        let nonce = construct_nonce(0x0102030405060708);
        assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..12], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(parse_nonce(&nonce), 0x0102030405060708);
    }

    #[test]
    fn test_counter_increments_little_endian() {
        let mut nonce = NonceCounter::from_counter(255);
        nonce.increment().unwrap();
        assert_eq!(nonce.counter(), 256);
        assert_eq!(&nonce.current()[4..6], &[0x00, 0x01]);
    }

    #[test]
    fn test_counter_exhaustion() {
        let mut nonce = NonceCounter::from_counter(u64::MAX);
        assert_eq!(nonce.increment(), Err(CryptoError::CounterExhaustion));
        assert_eq!(nonce.counter(), u64::MAX);
    }
}
