// Key expansion and cipher factory.
//
// The expansion procedure (pad, position-mix, shuffle) and the stream cipher
// itself are obfuscation, not authenticated encryption — there is no MAC
// anywhere in this module, by design.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{Key, XChaCha20, XNonce};
use rand::Rng;

pub const SECRET_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// A raw XChaCha20 keystream cipher. One instance is good for exactly one
/// (key, nonce) pair; reusing a nonce with the same key leaks the XOR of the
/// two plaintexts, so every wire-level use constructs a fresh instance from a
/// fresh nonce.
pub struct Cipher {
    inner: XChaCha20,
}

impl Cipher {
    /// XORs `buf` with the keystream in place, advancing the internal
    /// counter by `buf.len()` bytes.
    pub fn xor_inplace(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }
}

/// Derived secret key plus the deterministic "pair" nonce used only by
/// `new_cipher_pair` (an internal primitive, never produced on the wire).
pub struct KeyMaterial {
    secret_key: [u8; SECRET_KEY_LEN],
    pair_nonce: [u8; NONCE_LEN],
}

impl KeyMaterial {
    /// Expands a raw key of arbitrary length into a 32-byte secret key and a
    /// 24-byte deterministic nonce, following the original `ExpandKey`:
    /// pad to a multiple of 32 with PKCS#7-style padding, position-mix the
    /// secret key bytes, then run both buffers through the same shuffle pass.
    pub fn expand(raw: &[u8]) -> Self {
        let mut padded = raw.to_vec();
        if padded.len() < SECRET_KEY_LEN {
            let pad_len = (SECRET_KEY_LEN - (padded.len() % SECRET_KEY_LEN)) as u8;
            padded.extend(std::iter::repeat(pad_len).take(pad_len as usize));
        }

        let mut secret_key = [0u8; SECRET_KEY_LEN];
        secret_key.copy_from_slice(&padded[..SECRET_KEY_LEN]);

        let mut pair_nonce = [0u8; NONCE_LEN];
        pair_nonce[..12].copy_from_slice(&padded[..12]);
        pair_nonce[12..].copy_from_slice(&padded[padded.len() - 12..]);

        for (i, b) in secret_key.iter_mut().enumerate() {
            *b = b.wrapping_add((i % 255) as u8);
        }
        shuffle(&mut secret_key);
        shuffle(&mut pair_nonce);

        Self {
            secret_key,
            pair_nonce,
        }
    }

    /// Builds a cipher for the given nonce. Used for every per-session or
    /// per-datagram cipher produced on the wire.
    pub fn new_cipher(&self, nonce: &[u8; NONCE_LEN]) -> Cipher {
        let key = Key::from_slice(&self.secret_key);
        let nonce = XNonce::from_slice(nonce);
        Cipher {
            inner: XChaCha20::new(key, nonce),
        }
    }

    /// Builds a matched pair of ciphers sharing the deterministic pair nonce.
    /// Internal-only primitive: `new_stream_ctx` never produces this pairing
    /// on the wire, since two parties encrypting with the same key and nonce
    /// would each leak their plaintext XORed against the other's.
    pub fn new_cipher_pair(&self) -> (Cipher, Cipher) {
        (self.new_cipher(&self.pair_nonce), self.new_cipher(&self.pair_nonce))
    }

    /// Draws a fresh random 24-byte nonce for a new stream or datagram.
    pub fn random_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);
        nonce
    }
}

/// Byte-position-dependent mixing pass, applied once to the secret key and
/// once (independently) to the pair nonce. The indexing is relative to the
/// buffer's own length so the same routine works for both the 32-byte key
/// and the 24-byte nonce.
fn shuffle(bs: &mut [u8]) {
    let n = bs.len();
    for i in 0..n {
        let current = bs[i];
        let next = bs[(i + 1) % n];
        let mirrored = bs[n - 1 - i];
        let product = mirrored.wrapping_mul(current) % 255;
        let inner = next.wrapping_mul(product);
        bs[i] = current ^ (i as u8) ^ inner;
    }
}
