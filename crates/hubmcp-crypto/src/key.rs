//! The process-wide [`EncryptionKey`] singleton.
//!
//! Loaded once at startup from `MCP_ENCRYPTION_KEY` (base64-encoded 32 raw
//! bytes) and threaded explicitly into the Registry rather than read from a
//! global — see the initialization order in the gateway's design notes
//! (EncryptionKey -> Registry -> SessionManager -> Janitor -> Bridge).

use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("MCP_ENCRYPTION_KEY is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("MCP_ENCRYPTION_KEY must decode to exactly 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A loaded, zeroize-on-drop symmetric key. `Debug` deliberately does not
/// print key material.
pub struct EncryptionKey {
    cipher: XChaCha20Poly1305,
    raw: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey").field("cipher", &"<redacted>").finish()
    }
}

impl EncryptionKey {
    /// Load the key from its base64-encoded textual form (the value of
    /// `MCP_ENCRYPTION_KEY`).
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the string is not valid base64 or does not
    /// decode to exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        if decoded.len() != 32 {
            return Err(KeyError::InvalidLength(decoded.len()));
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&decoded);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&raw));
        Ok(Self {
            cipher,
            raw: Zeroizing::new(raw),
        })
    }

    /// Generate a fresh random key, for tests and `check-config` dry runs.
    #[must_use]
    pub fn generate() -> Self {
        let mut raw = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&raw));
        Self {
            cipher,
            raw: Zeroizing::new(raw),
        }
    }

    pub(crate) fn cipher(&self) -> &XChaCha20Poly1305 {
        &self.cipher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length() {
        use base64::Engine;
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        let err = EncryptionKey::from_base64(&short).unwrap_err();
        assert!(matches!(err, KeyError::InvalidLength(16)));
    }

    #[test]
    fn accepts_32_bytes() {
        use base64::Engine;
        let good = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert!(EncryptionKey::from_base64(&good).is_ok());
    }
}
