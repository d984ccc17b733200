//! Proof-of-work identity: secp256k1 keypair plus derived address.

use std::fmt;

use rand::RngCore;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha384};

use super::{Address, IdentityError, ADDRESS_LENGTH, POW_THRESHOLD};
use crate::buf::{Reader, Writer};

/// Wire key-type byte for secp256k1 identities.
const KEY_TYPE_SECP256K1: u8 = 0x00;

/// Marshalled size: address + type byte + compressed public key + work nonce.
pub const IDENTITY_MARSHAL_SIZE: usize = ADDRESS_LENGTH + 1 + 33 + 8;

/// A node identity: public key material plus the derived [`Address`].
///
/// Identities learned from the wire carry no secret key; only the local
/// node's identity can perform key agreement. Equality is by full key
/// material, never by address alone.
#[derive(Clone)]
pub struct Identity {
    public: PublicKey,
    pow_nonce: u64,
    address: Address,
    secret: Option<SecretKey>,
}

impl Identity {
    /// Generate a new identity, grinding the work nonce until the derived
    /// address satisfies the work criterion.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        loop {
            let mut secret_bytes = [0u8; 32];
            rand::rng().fill_bytes(&mut secret_bytes);
            let secret = match SecretKey::from_slice(&secret_bytes) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let public = PublicKey::from_secret_key(&secp, &secret);
            for pow_nonce in 0..=u16::MAX as u64 {
                if let Some(address) = derive_address(&public, pow_nonce) {
                    return Self {
                        public,
                        pow_nonce,
                        address,
                        secret: Some(secret),
                    };
                }
            }
        }
    }

    /// Reconstruct a full identity from a stored secret key and work nonce.
    pub fn from_secret(secret: SecretKey, pow_nonce: u64) -> Result<Self, IdentityError> {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret);
        let address = derive_address(&public, pow_nonce).ok_or(IdentityError::ProofOfWorkFailed)?;
        Ok(Self {
            public,
            pow_nonce,
            address,
            secret: Some(secret),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Re-run the address derivation and check the work criterion. Cheap,
    /// requires no secret material.
    pub fn locally_validate(&self) -> bool {
        derive_address(&self.public, self.pow_nonce) == Some(self.address)
    }

    /// ECDH agreement producing the raw long-term key shared with `other`.
    ///
    /// Returns `None` when this identity has no secret key. Symmetric:
    /// `a.agree(b) == b.agree(a)`.
    pub fn agree(&self, other: &Identity) -> Option<[u8; 48]> {
        let secret = self.secret.as_ref()?;
        let shared = SharedSecret::new(&other.public, secret);
        let hk = hkdf::Hkdf::<Sha384>::new(None, &shared.secret_bytes());
        let mut key = [0u8; 48];
        hk.expand(b"weft identity key", &mut key)
            .expect("48 bytes is a valid HKDF-SHA384 output length");
        Some(key)
    }

    /// Write the wire form: address, key type, compressed key, work nonce.
    pub fn marshal(&self, w: &mut Writer<'_>) -> Result<(), crate::buf::BufError> {
        w.write_bytes(&self.address.to_bytes())?;
        w.write_u8(KEY_TYPE_SECP256K1)?;
        w.write_bytes(&self.public.serialize())?;
        w.write_u64(self.pow_nonce)
    }

    /// Parse the wire form. Structural validation only; callers learning an
    /// identity from an untrusted source must also run `locally_validate`.
    pub fn unmarshal(r: &mut Reader<'_>) -> Result<Self, IdentityError> {
        let mut addr_bytes = [0u8; ADDRESS_LENGTH];
        addr_bytes.copy_from_slice(r.read_bytes(ADDRESS_LENGTH)?);
        let key_type = r.read_u8()?;
        if key_type != KEY_TYPE_SECP256K1 {
            return Err(IdentityError::UnknownKeyType(key_type));
        }
        let public = PublicKey::from_slice(r.read_bytes(33)?)?;
        let pow_nonce = r.read_u64()?;
        Ok(Self {
            public,
            pow_nonce,
            address: Address::from_bytes(&addr_bytes),
            secret: None,
        })
    }
}

/// Derive the address for a (key, nonce) pair, or `None` if the pair fails
/// the work criterion or lands in a reserved address range.
fn derive_address(public: &PublicKey, pow_nonce: u64) -> Option<Address> {
    let mut hasher = Sha384::new();
    hasher.update(public.serialize());
    hasher.update(pow_nonce.to_be_bytes());
    let digest = hasher.finalize();
    if digest[0] >= POW_THRESHOLD {
        return None;
    }
    let mut addr_bytes = [0u8; ADDRESS_LENGTH];
    addr_bytes.copy_from_slice(&digest[digest.len() - ADDRESS_LENGTH..]);
    let address = Address::from_bytes(&addr_bytes);
    address.is_valid().then_some(address)
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public && self.pow_nonce == other.pow_nonce
    }
}

impl Eq for Identity {}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("has_secret", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}
