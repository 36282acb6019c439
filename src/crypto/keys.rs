//! Identity and ephemeral key management
//!
//! A node is identified by a long-term Ed25519 keypair. Every connection
//! additionally generates a fresh X25519 keypair for forward secrecy.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::core::{CryptoError, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

/// Curve25519 points of small order, including non-canonical encodings.
///
/// A Diffie-Hellman exchange against any of these yields a secret the remote
/// side fully controls.
const LOW_ORDER_POINTS: [[u8; PUBLIC_KEY_SIZE]; 12] = [
    // 0 (order 4)
    [0x00; 32],
    // 1 (order 1)
    [
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ],
    // order 8
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    // order 8
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    // p - 1 (order 2)
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p (order 4)
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p + 1 (order 1)
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p + order-8 point
    [
        0xcd, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x80,
    ],
    // p + order-8 point
    [
        0x4c, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0xd7,
    ],
    // 2p - 1 (order 2)
    [
        0xd9, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff,
    ],
    // 2p (order 4)
    [
        0xda, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff,
    ],
    // 2p + 1 (order 1)
    [
        0xdb, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff,
    ],
];

/// Whether `key` is one of the known small-order curve points.
pub fn is_low_order_point(key: &[u8; PUBLIC_KEY_SIZE]) -> bool {
    LOW_ORDER_POINTS.iter().any(|point| point == key)
}

/// A long-term Ed25519 identity keypair.
///
/// The signing key is zeroized on drop by `ed25519-dalek`.
#[derive(Clone)]
pub struct IdentityKeypair {
    signing: SigningKey,
}

impl IdentityKeypair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte secret seed.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// Get the public identity key.
    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign a handshake challenge.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Parse a remote Ed25519 identity key.
pub fn parse_identity_key(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let key: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidPublicKey(format!("expected {PUBLIC_KEY_SIZE} bytes, got {}", bytes.len()))
    })?;
    VerifyingKey::from_bytes(&key).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Verify a signature made by `key` over `message`.
pub fn verify_signature(
    key: &VerifyingKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(CryptoError::ChallengeVerification);
    }
    let signature =
        Signature::from_slice(signature).map_err(|_| CryptoError::ChallengeVerification)?;
    key.verify(message, &signature)
        .map_err(|_| CryptoError::ChallengeVerification)
}

/// A single-use X25519 keypair for one handshake.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl EphemeralKeypair {
    /// Generate a new random ephemeral keypair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Compute the shared secret, consuming the private half.
    ///
    /// Rejects low-order remote keys and non-contributory results.
    pub fn diffie_hellman(
        self,
        remote: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        if is_low_order_point(remote) {
            return Err(CryptoError::LowOrderPoint);
        }
        let shared = self.secret.diffie_hellman(&PublicKey::from(*remote));
        if !shared.was_contributory() {
            return Err(CryptoError::LowOrderPoint);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl std::fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_agreement() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        let alice_pub = *alice.public_key();
        let bob_pub = *bob.public_key();

        let s1 = alice.diffie_hellman(&bob_pub).unwrap();
        let s2 = bob.diffie_hellman(&alice_pub).unwrap();
        assert_eq!(*s1, *s2);
    }

    #[test]
    fn test_low_order_points_rejected() {
        for point in LOW_ORDER_POINTS {
            let local = EphemeralKeypair::generate();
            assert_eq!(
                local.diffie_hellman(&point).unwrap_err(),
                CryptoError::LowOrderPoint
            );
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = IdentityKeypair::generate();
        let signature = identity.sign(b"challenge");
        let public = parse_identity_key(identity.public_key().as_bytes()).unwrap();

        assert!(verify_signature(&public, b"challenge", &signature.to_bytes()).is_ok());
        assert_eq!(
            verify_signature(&public, b"other", &signature.to_bytes()),
            Err(CryptoError::ChallengeVerification)
        );
        assert_eq!(
            verify_signature(&public, b"challenge", &[0u8; 10]),
            Err(CryptoError::ChallengeVerification)
        );
    }

    #[test]
    fn test_identity_from_secret_is_deterministic() {
        let a = IdentityKeypair::from_secret_bytes(&[7u8; 32]);
        let b = IdentityKeypair::from_secret_bytes(&[7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_rfc8032_vector() {
        let secret: [u8; 32] =
            hex::decode("9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60")
                .unwrap()
                .try_into()
                .unwrap();
        let identity = IdentityKeypair::from_secret_bytes(&secret);
        assert_eq!(
            hex::encode(identity.public_key().as_bytes()),
            "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a"
        );
        assert_eq!(
            hex::encode(identity.sign(b"").to_bytes()),
            "e5564300c360ac729086e2cc806e828a84877f1eb8e5d974d873e065224901555fb8821590a33bacc61e39701cf9b46bd25bf5f0595bbe24655141438e7a100b"
        );
    }

    #[test]
    fn test_parse_identity_key_length() {
        assert!(matches!(
            parse_identity_key(&[1u8; 31]),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }
}
