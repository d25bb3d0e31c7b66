//! The authenticated-encryption envelope (C1).
//!
//! Every at-rest field is stored as `version || nonce || ciphertext || tag`,
//! base64-encoded for a text column. The envelope holds no lock and every
//! call uses a fresh random nonce, so it is safe to share one `Envelope`
//! (cheaply, it's a thin wrapper over the key) across every reader.

use crate::key::EncryptionKey;
use chacha20poly1305::{
    aead::{Aead, AeadCore, OsRng},
    XNonce,
};
use hubmcp_protocol::GatewayError;

/// The only envelope format this build writes. Future formats would get
/// their own discriminant; readers reject anything else rather than guess.
const VERSION: u8 = 1;

/// Encrypts and decrypts the "encrypted at rest" fields named in the data
/// model: `args`, `env` values, and outbound SSE `headers` values.
pub struct Envelope<'k> {
    key: &'k EncryptionKey,
}

impl<'k> Envelope<'k> {
    #[must_use]
    pub const fn new(key: &'k EncryptionKey) -> Self {
        Self { key }
    }

    /// Encrypt `plaintext`, returning a base64 token safe to store in a text
    /// column.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let nonce = XChaCha20Poly1305Nonce::generate();
        let ciphertext = self
            .key
            .cipher()
            .encrypt(&nonce.0, plaintext)
            .expect("encryption over a bounded plaintext does not fail");

        let mut token = Vec::with_capacity(1 + nonce.0.len() + ciphertext.len());
        token.push(VERSION);
        token.extend_from_slice(&nonce.0);
        token.extend_from_slice(&ciphertext);

        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(token)
    }

    /// Decrypt a token produced by [`Self::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DecryptError`] if the token is not valid
    /// base64, too short to contain a nonce, carries an unrecognized version
    /// byte, or fails AEAD authentication (tampered ciphertext or wrong key).
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, GatewayError> {
        use base64::Engine;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(token)
            .map_err(|_| GatewayError::DecryptError)?;

        let nonce_len = 24; // XChaCha20Poly1305 nonce width
        if raw.len() < 1 + nonce_len {
            return Err(GatewayError::DecryptError);
        }
        if raw[0] != VERSION {
            return Err(GatewayError::DecryptError);
        }

        let nonce = XNonce::from_slice(&raw[1..1 + nonce_len]);
        let ciphertext = &raw[1 + nonce_len..];

        self.key
            .cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| GatewayError::DecryptError)
    }

    /// Convenience for the common case of an UTF-8 string field.
    #[must_use]
    pub fn encrypt_str(&self, plaintext: &str) -> String {
        self.encrypt(plaintext.as_bytes())
    }

    /// Convenience inverse of [`Self::encrypt_str`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DecryptError`] if decryption fails, or if the
    /// recovered plaintext is not valid UTF-8.
    pub fn decrypt_str(&self, token: &str) -> Result<String, GatewayError> {
        let bytes = self.decrypt(token)?;
        String::from_utf8(bytes).map_err(|_| GatewayError::DecryptError)
    }
}

struct XChaCha20Poly1305Nonce(XNonce);

impl XChaCha20Poly1305Nonce {
    fn generate() -> Self {
        Self(chacha20poly1305::XChaCha20Poly1305::generate_nonce(
            &mut OsRng,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_plaintext() {
        let key = EncryptionKey::generate();
        let envelope = Envelope::new(&key);
        let token = envelope.encrypt_str("abc");
        let recovered = envelope.decrypt_str(&token).unwrap();
        assert_eq!(recovered, "abc");
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let key = EncryptionKey::generate();
        let envelope = Envelope::new(&key);
        let token = envelope.encrypt_str("abc");

        use base64::Engine;
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&token)
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);

        assert!(envelope.decrypt_str(&tampered).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let key = EncryptionKey::generate();
        let envelope = Envelope::new(&key);
        let token = envelope.encrypt_str("abc");

        use base64::Engine;
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&token)
            .unwrap();
        raw[0] = 99;
        let bumped = base64::engine::general_purpose::STANDARD.encode(raw);

        assert!(envelope.decrypt_str(&bumped).is_err());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let key_a = EncryptionKey::generate();
        let key_b = EncryptionKey::generate();
        let token = Envelope::new(&key_a).encrypt_str("secret");
        assert!(Envelope::new(&key_b).decrypt_str(&token).is_err());
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let key = EncryptionKey::generate();
        let envelope = Envelope::new(&key);
        let a = envelope.encrypt_str("same-plaintext");
        let b = envelope.encrypt_str("same-plaintext");
        assert_ne!(a, b);
    }
}
