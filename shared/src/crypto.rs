//! ChaCha20-Poly1305 envelope used by tokens and packet bodies.
//!
//! Every seal is keyed by a 256-bit key and a 64-bit sequence. The nonce is
//! four zero bytes followed by the little-endian sequence, so a key must never
//! be reused with the same sequence.

use crate::error::{NetcodeError, Result};
use crate::{KEY_BYTES, NONCE_BYTES};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key as CipherKey, Nonce};
use rand::RngCore;

pub type Key = [u8; KEY_BYTES];

/// Builds the AEAD nonce for a sequence number
pub fn construct_nonce(sequence: u64) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

/// Encrypts `plaintext` and appends the authentication tag
pub fn seal(plaintext: &[u8], key: &Key, sequence: u64, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(key));
    let nonce = construct_nonce(sequence);

    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| NetcodeError::EncryptionFailed)
}

/// Verifies and decrypts a buffer produced by [`seal`]
///
/// A failure here is final for these bytes; callers discard rather than retry.
pub fn open(ciphertext: &[u8], key: &Key, sequence: u64, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(key));
    let nonce = construct_nonce(sequence);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| NetcodeError::DecryptionFailed)
}

pub fn generate_key() -> Key {
    let mut key = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
