//! Node identity system.
//!
//! A node is identified by a 40-bit [`Address`] derived from its secp256k1
//! public key through a small proof-of-work: the key is ground against a
//! nonce until SHA-384(pubkey || nonce) meets the work criterion, and the
//! address is read from the tail of that digest. Anyone holding the public
//! key and nonce can re-run the derivation, so identities are locally
//! validatable without a third party.
//!
//! Two identities agree on a long-term [`SymmetricKey`] via ECDH; per-use
//! subkeys (HELLO HMAC, dictionary encryption) are derived from it with
//! HKDF-SHA384.

mod address;
mod keys;
mod symmetric;

use thiserror::Error;

pub use address::{Address, ADDRESS_LENGTH};
pub use keys::{Identity, IDENTITY_MARSHAL_SIZE};
pub use symmetric::{SymmetricKey, SYMMETRIC_KEY_SIZE};

/// Work criterion: the first digest byte must be below this bound.
pub(crate) const POW_THRESHOLD: u8 = 32;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unknown identity key type: 0x{0:02x}")]
    UnknownKeyType(u8),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(#[from] secp256k1::Error),

    #[error("identity truncated: {0}")]
    Truncated(#[from] crate::buf::BufError),

    #[error("address does not satisfy the work criterion")]
    ProofOfWorkFailed,

    #[error("key agreement requires local secret key material")]
    AgreementFailed,

    #[error("invalid address string: {0}")]
    InvalidAddressString(String),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}
