//! Symmetric primitives for packet authentication and encryption.
//!
//! Three concerns live here: the Salsa20/12+Poly1305 legacy cipher pair used
//! for per-packet MAC and payload encryption, HMAC-SHA384 and AES-256-CTR
//! used by the versioned HELLO exchange, and LZ4 payload (de)compression.
//!
//! The Poly1305 wrapper buffers to block boundaries internally, so feeding
//! it a packet in arbitrary fragment-sized chunks yields the same tag as one
//! pass over the assembled bytes.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::{Block, Key, Poly1305};
use salsa20::Salsa12;
use sha2::Sha384;
use subtle::ConstantTimeEq;

use crate::buf::StreamTransform;

/// Size of a Poly1305 one-time key.
pub const POLY1305_KEY_SIZE: usize = 32;

/// Size of a full Poly1305 tag. Packets carry only the first 8 bytes.
pub const POLY1305_MAC_SIZE: usize = 16;

/// Size of an HMAC-SHA384 tag.
pub const HMAC_SHA384_SIZE: usize = 48;

/// Size of the AES-CTR nonce used for HELLO dictionary encryption.
pub const DICTIONARY_NONCE_SIZE: usize = 12;

type Aes256Ctr = ctr::Ctr32BE<Aes256>;
type HmacSha384 = Hmac<Sha384>;

/// Streaming Poly1305 with internal block buffering.
///
/// Chunk boundaries do not affect the tag; the final partial block is
/// zero-padded.
pub struct Poly1305Stream {
    mac: Poly1305,
    pending: [u8; 16],
    pending_len: usize,
}

impl Poly1305Stream {
    pub fn new(key: &[u8; POLY1305_KEY_SIZE]) -> Self {
        Self {
            mac: Poly1305::new(Key::from_slice(key)),
            pending: [0u8; 16],
            pending_len: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = (16 - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len == 16 {
                self.mac
                    .update(std::slice::from_ref(Block::from_slice(&self.pending)));
                self.pending_len = 0;
            }
        }
        let mut blocks = data.chunks_exact(16);
        for block in &mut blocks {
            self.mac
                .update(std::slice::from_ref(Block::from_slice(block)));
        }
        let rem = blocks.remainder();
        self.pending[..rem.len()].copy_from_slice(rem);
        self.pending_len = rem.len();
    }

    pub fn finish(mut self) -> [u8; POLY1305_MAC_SIZE] {
        if self.pending_len > 0 {
            self.mac.update_padded(&self.pending[..self.pending_len]);
        }
        let tag = self.mac.finalize();
        let mut out = [0u8; POLY1305_MAC_SIZE];
        out.copy_from_slice(&tag);
        out
    }
}

/// Initialise Salsa20/12 with the per-packet key and packet-ID IV, take the
/// first 32 keystream bytes as the Poly1305 one-time key, and return the
/// cipher positioned just past them.
fn salsa_with_mac_key(key: &[u8; 32], iv: &[u8; 8]) -> (Salsa12, [u8; POLY1305_KEY_SIZE]) {
    let mut salsa =
        Salsa12::new_from_slices(key, iv).expect("Salsa20 key and IV sizes are fixed");
    let mut mac_key = [0u8; POLY1305_KEY_SIZE];
    salsa.apply_keystream(&mut mac_key);
    (salsa, mac_key)
}

/// Fused decrypt-and-authenticate stream for the encrypted cipher suite.
///
/// Poly1305 absorbs the ciphertext; the destination receives the Salsa20/12
/// decryption. Keystream position continues from byte 32, directly after the
/// MAC key.
pub struct SalsaPolyStream {
    salsa: Salsa12,
    mac: Poly1305Stream,
}

impl SalsaPolyStream {
    pub fn new(per_packet_key: &[u8; 32], iv: &[u8; 8]) -> Self {
        let (salsa, mac_key) = salsa_with_mac_key(per_packet_key, iv);
        Self {
            salsa,
            mac: Poly1305Stream::new(&mac_key),
        }
    }

    pub fn finish(self) -> [u8; POLY1305_MAC_SIZE] {
        self.mac.finish()
    }
}

impl StreamTransform for SalsaPolyStream {
    fn apply(&mut self, dst: &mut [u8], src: &[u8]) {
        self.mac.update(src);
        dst.copy_from_slice(src);
        self.salsa.apply_keystream(dst);
    }
}

/// Authenticate-only stream for the unencrypted cipher suite: bytes are
/// copied unchanged while Poly1305 absorbs them.
pub struct PolyStream {
    mac: Poly1305Stream,
}

impl PolyStream {
    pub fn new(per_packet_key: &[u8; 32], iv: &[u8; 8]) -> Self {
        let (_, mac_key) = salsa_with_mac_key(per_packet_key, iv);
        Self {
            mac: Poly1305Stream::new(&mac_key),
        }
    }

    pub fn finish(self) -> [u8; POLY1305_MAC_SIZE] {
        self.mac.finish()
    }
}

impl StreamTransform for PolyStream {
    fn apply(&mut self, dst: &mut [u8], src: &[u8]) {
        self.mac.update(src);
        dst.copy_from_slice(src);
    }
}

/// One-shot Poly1305 over `data` with the key drawn from the Salsa20/12
/// keystream, for contiguous packets that need MAC verification only.
pub fn poly1305_packet_mac(
    per_packet_key: &[u8; 32],
    iv: &[u8; 8],
    data: &[u8],
) -> [u8; POLY1305_MAC_SIZE] {
    let (_, mac_key) = salsa_with_mac_key(per_packet_key, iv);
    let mut mac = Poly1305Stream::new(&mac_key);
    mac.update(data);
    mac.finish()
}

/// Encrypt (or decrypt) `data` in place with Salsa20/12, keystream starting
/// at byte 32, and return the Poly1305 tag over the ciphertext. Used on the
/// send side where the packet is already contiguous.
pub fn salsa_poly_armor_in_place(
    per_packet_key: &[u8; 32],
    iv: &[u8; 8],
    data: &mut [u8],
    encrypt: bool,
) -> [u8; POLY1305_MAC_SIZE] {
    let (mut salsa, mac_key) = salsa_with_mac_key(per_packet_key, iv);
    let mut mac = Poly1305Stream::new(&mac_key);
    if encrypt {
        salsa.apply_keystream(data);
        mac.update(data);
    } else {
        mac.update(data);
    }
    mac.finish()
}

/// HMAC-SHA384 over `data`.
pub fn hmac_sha384(key: &[u8], data: &[u8]) -> [u8; HMAC_SHA384_SIZE] {
    let mut m = <HmacSha384 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    m.update(data);
    let tag = m.finalize().into_bytes();
    let mut out = [0u8; HMAC_SHA384_SIZE];
    out.copy_from_slice(&tag);
    out
}

/// AES-256-CTR with a 96-bit nonce, applied in place. Symmetric for
/// encryption and decryption.
pub fn aes_ctr_crypt_in_place(key: &[u8; 32], nonce: &[u8; DICTIONARY_NONCE_SIZE], data: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..DICTIONARY_NONCE_SIZE].copy_from_slice(nonce);
    let mut cipher =
        Aes256Ctr::new_from_slices(key, &iv).expect("AES-CTR key and IV sizes are fixed");
    cipher.apply_keystream(data);
}

/// Constant-time equality.
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// LZ4 block compression into a caller-provided buffer. `None` if the
/// output does not fit.
pub fn compress_payload(src: &[u8], dst: &mut [u8]) -> Option<usize> {
    lz4_flex::block::compress_into(src, dst).ok()
}

/// LZ4 block decompression into a caller-provided buffer. `None` on
/// malformed input or if the decompressed size exceeds the buffer.
pub fn decompress_payload(src: &[u8], dst: &mut [u8]) -> Option<usize> {
    lz4_flex::block::decompress_into(src, dst).ok()
}
