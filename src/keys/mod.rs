//! Envelope encryption for data at rest
//!
//! A per-installation *data key* encrypts stored field values; the data key
//! itself is only ever persisted wrapped under a *root key* held by a
//! [`SymmetricKeyProvider`]. The unwrapped data key lives in process memory
//! for the lifetime of the server, owned by the [`FieldCipher`].

pub mod cipher;
pub mod provider;
pub mod store;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::Result;

pub use cipher::{seal, unseal, FieldCipher};
pub use provider::LocalKeyProvider;
pub use store::{EncryptionKeyStore, DB_KEY_NAME};

// =============================================================================
// Constants
// =============================================================================

/// Data key length in bytes (256-bit)
pub const DATA_KEY_LEN: usize = 32;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Algorithm identifier stored alongside wrapped keys and sealed payloads
pub const ALGORITHM_CHACHA20_POLY1305: &str = "chacha20poly1305";

// =============================================================================
// Symmetric key
// =============================================================================

/// An unwrapped data key plus the envelope metadata needed to store it.
///
/// The plaintext key material is zeroized on drop and never leaves this
/// struct; persistence goes through `wrapped()`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    plaintext: [u8; DATA_KEY_LEN],
    /// Short identifier embedded with sealed payloads; assigned by the
    /// encryption-key store once the wrapped form is persisted.
    #[zeroize(skip)]
    key_id: u32,
    #[zeroize(skip)]
    algorithm: String,
    #[zeroize(skip)]
    root_key_id: String,
    #[zeroize(skip)]
    wrapped: Vec<u8>,
}

impl SymmetricKey {
    pub fn new(
        plaintext: [u8; DATA_KEY_LEN],
        algorithm: &str,
        root_key_id: &str,
        wrapped: Vec<u8>,
    ) -> Self {
        Self {
            plaintext,
            key_id: 0,
            algorithm: algorithm.to_string(),
            root_key_id: root_key_id.to_string(),
            wrapped,
        }
    }

    /// Attach the short key id allocated by the record store.
    pub fn with_key_id(mut self, key_id: u32) -> Self {
        self.key_id = key_id;
        self
    }

    #[inline]
    pub(crate) fn plaintext(&self) -> &[u8; DATA_KEY_LEN] {
        &self.plaintext
    }

    #[inline]
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    #[inline]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    #[inline]
    pub fn root_key_id(&self) -> &str {
        &self.root_key_id
    }

    /// The wrapped (encrypted) form, safe to persist.
    #[inline]
    pub fn wrapped(&self) -> &[u8] {
        &self.wrapped
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("root_key_id", &self.root_key_id)
            .field("plaintext", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Provider trait
// =============================================================================

/// Root-key backend: wraps and unwraps data keys.
///
/// The native implementation keeps root keys in a local directory; the trait
/// is the seam for external key-management services.
pub trait SymmetricKeyProvider: Send + Sync {
    /// Produce fresh data-key material wrapped under the named root key.
    fn generate_data_key(&self, root_key_id: &str) -> Result<SymmetricKey>;

    /// Unwrap previously wrapped bytes. Fails with an integrity error on
    /// tampered ciphertext and with a config error on an unknown root key.
    fn decrypt_data_key(&self, root_key_id: &str, wrapped: &[u8]) -> Result<SymmetricKey>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_key_material() {
        let key = SymmetricKey::new([0x41; DATA_KEY_LEN], ALGORITHM_CHACHA20_POLY1305, "default", vec![1, 2, 3]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("41, 41"));
    }

    #[test]
    fn test_with_key_id() {
        let key = SymmetricKey::new([0; DATA_KEY_LEN], ALGORITHM_CHACHA20_POLY1305, "default", vec![]);
        assert_eq!(key.key_id(), 0);
        let key = key.with_key_id(7);
        assert_eq!(key.key_id(), 7);
    }
}
