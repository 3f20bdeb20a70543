//! AES-256-GCM envelope codec (component E).
//!
//! Encrypts/decrypts the inner JSON-RPC payload against a client's shared
//! secret. The wire format keeps ciphertext and IV as separate base64
//! fields (§6) rather than packing them into one string; every decryption
//! failure — bad base64, wrong key, truncated or tampered ciphertext —
//! collapses to a single opaque error so a caller can never distinguish
//! "wrong key" from "corrupted data" (§7).

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Encrypts `plaintext` under `key`, returning `(encrypted_b64, iv_b64)`.
/// A fresh random 12-byte nonce is generated per call.
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> (String, String) {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // Only fails if the plaintext exceeds AES-GCM's length limit, which no
    // JSON-RPC payload ever approaches.
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-256-GCM encryption of a bounded JSON-RPC payload cannot fail");

    (BASE64.encode(ciphertext), BASE64.encode(nonce_bytes))
}

/// Decrypts `encrypted_b64`/`iv_b64` under `key`. Any failure — malformed
/// base64, a nonce of the wrong length, or an authentication tag mismatch
/// — returns `CodecError::DecryptionFailed`.
pub fn decrypt(encrypted_b64: &str, iv_b64: &str, key: &[u8; 32]) -> Result<Vec<u8>, CodecError> {
    let ciphertext = BASE64
        .decode(encrypted_b64)
        .map_err(|_| CodecError::DecryptionFailed)?;
    let iv = BASE64
        .decode(iv_b64)
        .map_err(|_| CodecError::DecryptionFailed)?;

    if iv.len() != NONCE_LEN {
        return Err(CodecError::DecryptionFailed);
    }
    let nonce = Nonce::from_slice(&iv);

    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| CodecError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn round_trips_plaintext() {
        let key = key();
        let (encrypted, iv) = encrypt(b"hello latchkey", &key);
        let decrypted = decrypt(&encrypted, &iv, &key).unwrap();
        assert_eq!(decrypted, b"hello latchkey");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let (encrypted, iv) = encrypt(b"secret payload", &key());
        let wrong_key = [9u8; 32];
        let err = decrypt(&encrypted, &iv, &wrong_key).unwrap_err();
        assert!(matches!(err, CodecError::DecryptionFailed));
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let key = key();
        let (mut encrypted, iv) = encrypt(b"secret payload", &key);
        encrypted.push('A');
        assert!(decrypt(&encrypted, &iv, &key).is_err());
    }

    #[test]
    fn malformed_base64_fails_closed() {
        let key = key();
        let err = decrypt("not-base64!!!", "also-not-base64!!!", &key).unwrap_err();
        assert!(matches!(err, CodecError::DecryptionFailed));
    }

    #[test]
    fn wrong_length_iv_fails_closed() {
        let key = key();
        let (encrypted, _) = encrypt(b"payload", &key);
        let short_iv = BASE64.encode([1u8; 4]);
        assert!(decrypt(&encrypted, &short_iv, &key).is_err());
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let key = key();
        let (_, iv1) = encrypt(b"same plaintext", &key);
        let (_, iv2) = encrypt(b"same plaintext", &key);
        assert_ne!(iv1, iv2);
    }
}
