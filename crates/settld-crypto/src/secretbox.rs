//! AEAD envelope encryption for secrets-at-rest (spec §4.2).
//!
//! Ciphertext is stored as `enc:v1:base64(iv(12) || tag(16) || ct)`. Values
//! that do not carry the `enc:v1:` prefix are treated as legacy plaintext on
//! read, so a data directory written before encryption was enabled for a
//! field keeps working.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroizing;

const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 32-byte AES-256-GCM key, zeroized on drop.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<[u8; 32]>);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretKey").field(&"[REDACTED]").finish()
    }
}

impl SecretKey {
    /// Derives a key from raw bytes of any length by SHA-256, matching how
    /// `MAGIC_LINK_SECRET_KEY` (an operator-supplied passphrase) is turned
    /// into an AES-256 key.
    pub fn derive_from_bytes(raw: &[u8]) -> Self {
        SecretKey(Zeroizing::new(crate::hash::sha256(raw)))
    }

    /// Builds a key directly from exactly 32 raw bytes, as decoded from
    /// `MAGIC_LINK_SETTINGS_KEY_HEX` (spec §6): no further hashing.
    pub fn from_bytes(raw: [u8; 32]) -> Self {
        SecretKey(Zeroizing::new(raw))
    }
}

/// Encrypts `plaintext` into the `enc:v1:` envelope format.
pub fn encrypt(key: &SecretKey, plaintext: &str) -> String {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key.0));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the 16-byte tag to the ciphertext.
    let ct_and_tag = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .expect("AES-256-GCM encryption with a valid 96-bit nonce cannot fail");

    let mut framed = Vec::with_capacity(NONCE_LEN + ct_and_tag.len());
    framed.extend_from_slice(&nonce_bytes);
    framed.extend_from_slice(&ct_and_tag);

    format!("{ENVELOPE_PREFIX}{}", BASE64.encode(framed))
}

/// Decrypts an `enc:v1:` envelope.
///
/// - If `stored` does not carry the envelope prefix, it is returned verbatim
///   (legacy plaintext, spec §4.2).
/// - If `key` is `None`, or decryption/authentication fails, returns `None`
///   so callers can distinguish "no secret available" from "wrong secret"
///   without ever logging ciphertext or key material.
pub fn decrypt(key: Option<&SecretKey>, stored: &str) -> Option<String> {
    let Some(body) = stored.strip_prefix(ENVELOPE_PREFIX) else {
        return Some(stored.to_string());
    };
    let key = key?;

    let framed = BASE64.decode(body).ok()?;
    if framed.len() < NONCE_LEN + TAG_LEN {
        return None;
    }
    let (nonce_bytes, ct_and_tag) = framed.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key.0));
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher.decrypt(nonce, ct_and_tag).ok()?;
    String::from_utf8(plaintext).ok()
}

/// True if `stored` is an `enc:v1:` envelope rather than legacy plaintext.
pub fn is_envelope(stored: &str) -> bool {
    stored.starts_with(ENVELOPE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::derive_from_bytes(b"test-signing-key-at-least-16-bytes")
    }

    #[test]
    fn round_trips_plaintext() {
        let k = key();
        let sealed = encrypt(&k, "smtp-app-password");
        assert!(is_envelope(&sealed));
        assert_eq!(decrypt(Some(&k), &sealed).as_deref(), Some("smtp-app-password"));
    }

    #[test]
    fn legacy_plaintext_passes_through_unchanged() {
        let k = key();
        assert_eq!(decrypt(Some(&k), "plain-value").as_deref(), Some("plain-value"));
    }

    #[test]
    fn missing_key_returns_none_for_envelope() {
        let k = key();
        let sealed = encrypt(&k, "secret");
        assert_eq!(decrypt(None, &sealed), None);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = encrypt(&key(), "secret");
        let wrong = SecretKey::derive_from_bytes(b"a-completely-different-key-value");
        assert_eq!(decrypt(Some(&wrong), &sealed), None);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let k = key();
        let mut sealed = encrypt(&k, "secret").into_bytes();
        *sealed.last_mut().unwrap() ^= 0x01;
        let sealed = String::from_utf8(sealed).unwrap();
        assert_eq!(decrypt(Some(&k), &sealed), None);
    }
}
