//! The server's signing key.

use k256::ecdsa::signature::Signer as _;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Holds a signing key and signs arbitrary byte blobs. The auth manager
/// signs through this so the key itself never leaves its owner.
pub trait Signer: Send + Sync {
    /// DER-encoded ECDSA signature over SHA-256 of `msg`.
    fn sign(&self, msg: &[u8]) -> Vec<u8>;
    /// Compressed SEC1 encoding of the public key.
    fn pubkey(&self) -> Vec<u8>;
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("invalid secp256k1 private key")]
    BadKey,
}

/// A [`Signer`] backed by an in-memory secp256k1 key.
#[derive(Clone)]
pub struct KeySigner {
    key: SigningKey,
}

impl KeySigner {
    /// Generate a new random key.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Load from raw private-key bytes (32 bytes, big endian).
    pub fn from_slice(b: &[u8]) -> Result<Self, SignerError> {
        let key = SigningKey::from_slice(b).map_err(|_| SignerError::BadKey)?;
        Ok(Self { key })
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.key.verifying_key()
    }
}

impl Signer for KeySigner {
    fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let sig: Signature = self.key.sign(msg);
        sig.to_der().as_bytes().to_vec()
    }

    fn pubkey(&self) -> Vec<u8> {
        self.key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }
}
