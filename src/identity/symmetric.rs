//! Long-term per-peer symmetric key and its derived subkeys.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;
use sha2::Sha384;

use super::Address;

/// Size of the raw identity-agreement key.
pub const SYMMETRIC_KEY_SIZE: usize = 48;

/// Long-term symmetric key shared with one peer, derived from identity
/// agreement.
///
/// Holds the raw key used for per-packet key derivation plus HKDF-SHA384
/// subkeys for the versioned HELLO exchange, and generates 64-bit message
/// IDs from a monotonic odometer. The top ID bit encodes the direction of
/// travel so both ends of a key can generate IDs without collision.
pub struct SymmetricKey {
    key: [u8; SYMMETRIC_KEY_SIZE],
    cipher_key: [u8; 32],
    hello_hmac_key: [u8; SYMMETRIC_KEY_SIZE],
    dictionary_key: [u8; 32],
    odometer: AtomicU64,
}

impl SymmetricKey {
    pub fn new(raw: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        let hk = hkdf::Hkdf::<Sha384>::new(None, &raw);
        let mut hello_hmac_key = [0u8; SYMMETRIC_KEY_SIZE];
        hk.expand(b"weft hello hmac", &mut hello_hmac_key)
            .expect("48 bytes is a valid HKDF-SHA384 output length");
        let mut dictionary_key = [0u8; 32];
        hk.expand(b"weft hello dictionary", &mut dictionary_key)
            .expect("32 bytes is a valid HKDF-SHA384 output length");
        let mut cipher_key = [0u8; 32];
        cipher_key.copy_from_slice(&raw[..32]);
        Self {
            key: raw,
            cipher_key,
            hello_hmac_key,
            dictionary_key,
            // Random start so packet IDs are not predictable across restarts.
            odometer: AtomicU64::new(rand::rng().next_u64() & 0x7fff_ffff_ffff_ffff),
        }
    }

    /// The raw agreement key.
    pub fn raw(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.key
    }

    /// First 32 bytes of the raw key, the input to per-packet key derivation.
    pub fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    /// HMAC-SHA384 key for HELLO and OK(HELLO) at protocol version 11+.
    pub fn hello_hmac_key(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.hello_hmac_key
    }

    /// AES-256 key for the encrypted HELLO dictionary section.
    pub fn dictionary_key(&self) -> &[u8; 32] {
        &self.dictionary_key
    }

    /// Next 64-bit message/packet ID for a packet travelling `from -> to`.
    pub fn next_message(&self, from: Address, to: Address) -> u64 {
        let direction = (from.to_u64() > to.to_u64()) as u64;
        (self.odometer.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff_ffff_ffff)
            | (direction << 63)
    }
}
