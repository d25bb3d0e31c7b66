//! The at-rest crypto envelope (C1): a small, lock-free AEAD wrapper used by
//! the server registry to encrypt/decrypt `args`, `env`, and `headers`
//! values on the persisted `BackendServer` row.

pub mod envelope;
pub mod key;

pub use envelope::Envelope;
pub use key::{EncryptionKey, KeyError};
