//! Account identity: ID derivation and client signature checks.

use k256::ecdsa::signature::Verifier as _;
use k256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};

use spindrift_core::ids::AccountId;

/// Derive the account ID from a compressed public key:
/// `SHA-256(SHA-256(pubkey))`.
pub fn account_id(pubkey: &[u8]) -> AccountId {
    let inner = Sha256::digest(pubkey);
    let outer = Sha256::digest(inner);
    AccountId(outer.into())
}

/// Verify a DER-encoded ECDSA signature over SHA-256 of `msg` under a
/// compressed SEC1 public key. Any malformed input verifies false.
pub fn verify_sig(pubkey: &[u8], msg: &[u8], der_sig: &[u8]) -> bool {
    let Ok(vk) = VerifyingKey::from_sec1_bytes(pubkey) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(der_sig) else {
        return false;
    };
    // Tolerate high-S encodings from foreign signers.
    let sig = sig.normalize_s().unwrap_or(sig);
    vk.verify(msg, &sig).is_ok()
}
