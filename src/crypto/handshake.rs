//! Station-to-station key agreement
//!
//! Both sides send a fresh X25519 public key. The keys are sorted so both
//! sides agree on which is "lower", then:
//!
//! 1. `dh = X25519(local_eph_priv, remote_eph_pub)`, rejecting low-order points
//! 2. `okm = HKDF-SHA256(ikm = dh, salt = none, info = KEY_AND_CHALLENGE_GEN_INFO)`, 96 bytes
//! 3. the side with the lower key receives with `okm[0..32]` and sends with
//!    `okm[32..64]`; the other side mirrors this
//! 4. a merlin transcript absorbs both keys and `dh`, and the challenge both
//!    sides sign is extracted from it
//!
//! The identity exchange that follows runs over the encrypted channel.

use hkdf::Hkdf;
use merlin::Transcript;
use sha2::Sha256;
use zeroize::Zeroize;

use super::aead::SessionKey;
use super::keys::EphemeralKeypair;
use crate::core::{
    AEAD_KEY_SIZE, CHALLENGE_SIZE, CryptoError, KEY_AND_CHALLENGE_GEN_INFO, KEY_MATERIAL_SIZE,
    LABEL_DH_SECRET, LABEL_EPHEMERAL_LOWER_PUBLIC_KEY, LABEL_EPHEMERAL_UPPER_PUBLIC_KEY,
    LABEL_SECRET_CONNECTION_MAC, PUBLIC_KEY_SIZE, TRANSCRIPT_DOMAIN,
};

/// Order two keys lexicographically.
pub fn sort32<'a>(
    a: &'a [u8; PUBLIC_KEY_SIZE],
    b: &'a [u8; PUBLIC_KEY_SIZE],
) -> (&'a [u8; PUBLIC_KEY_SIZE], &'a [u8; PUBLIC_KEY_SIZE]) {
    if a < b { (a, b) } else { (b, a) }
}

/// Directional keys from the HKDF expansion.
pub struct DerivedSecrets {
    /// Key for frames from the remote side.
    pub recv_key: SessionKey,
    /// Key for frames to the remote side.
    pub send_key: SessionKey,
}

/// Expand a Diffie-Hellman secret into directional keys.
///
/// `loc_is_least` is whether the local ephemeral key sorted first.
pub fn derive_secrets(dh_secret: &[u8; 32], loc_is_least: bool) -> Result<DerivedSecrets, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, dh_secret);
    let mut key_material = [0u8; KEY_MATERIAL_SIZE];
    hk.expand(KEY_AND_CHALLENGE_GEN_INFO, &mut key_material)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let first = SessionKey::from_slice(&key_material[..AEAD_KEY_SIZE]);
    let second = SessionKey::from_slice(&key_material[AEAD_KEY_SIZE..2 * AEAD_KEY_SIZE]);
    key_material.zeroize();
    let (first, second) = (first?, second?);

    let (recv_key, send_key) = if loc_is_least {
        (first, second)
    } else {
        (second, first)
    };
    Ok(DerivedSecrets { recv_key, send_key })
}

/// Challenge both sides sign, bound to the sorted ephemeral keys and the
/// shared secret.
pub fn transcript_challenge(
    lo: &[u8; PUBLIC_KEY_SIZE],
    hi: &[u8; PUBLIC_KEY_SIZE],
    dh_secret: &[u8; 32],
) -> [u8; CHALLENGE_SIZE] {
    let mut transcript = Transcript::new(TRANSCRIPT_DOMAIN);
    transcript.append_message(LABEL_EPHEMERAL_LOWER_PUBLIC_KEY, lo);
    transcript.append_message(LABEL_EPHEMERAL_UPPER_PUBLIC_KEY, hi);
    transcript.append_message(LABEL_DH_SECRET, dh_secret);

    let mut challenge = [0u8; CHALLENGE_SIZE];
    transcript.challenge_bytes(LABEL_SECRET_CONNECTION_MAC, &mut challenge);
    challenge
}

/// Everything the encrypted phase of the handshake needs.
pub struct HandshakeSecrets {
    /// Key for frames from the remote side.
    pub recv_key: SessionKey,
    /// Key for frames to the remote side.
    pub send_key: SessionKey,
    /// Challenge each side signs with its identity key.
    pub challenge: [u8; CHALLENGE_SIZE],
}

/// The ephemeral half of a handshake in progress.
#[derive(Debug)]
pub struct KeyAgreement {
    ephemeral: EphemeralKeypair,
}

impl KeyAgreement {
    /// Start a key agreement with a fresh ephemeral key.
    pub fn generate() -> Self {
        Self {
            ephemeral: EphemeralKeypair::generate(),
        }
    }

    /// The ephemeral public key to send to the remote side.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.ephemeral.public_key()
    }

    /// Finish the agreement with the remote ephemeral key.
    pub fn complete(self, remote: &[u8; PUBLIC_KEY_SIZE]) -> Result<HandshakeSecrets, CryptoError> {
        let local = *self.ephemeral.public_key();
        let (lo, hi) = sort32(&local, remote);
        let loc_is_least = &local == lo;

        let dh_secret = self.ephemeral.diffie_hellman(remote)?;
        let secrets = derive_secrets(&dh_secret, loc_is_least)?;

        Ok(HandshakeSecrets {
            recv_key: secrets.recv_key,
            send_key: secrets.send_key,
            challenge: transcript_challenge(lo, hi, &dh_secret),
        })
    }
}
