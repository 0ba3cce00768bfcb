//! Signing and account identity for the spindrift DEX server.
//!
//! Accounts are named by a hash of their compressed secp256k1 public key;
//! all signatures are DER-encoded ECDSA over the SHA-256 digest of the
//! covered bytes.

pub mod account;
pub mod signer;

pub use account::{account_id, verify_sig};
pub use signer::{KeySigner, Signer, SignerError};
