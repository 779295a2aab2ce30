//! Encryption-key store
//!
//! Persists wrapped data keys and resolves the active key at startup:
//! load the `"dbkey"` slot, create it on first boot, abort on anything
//! else. There is no degraded "run without encryption" mode.

use std::sync::Arc;

use crate::store::Store;
use crate::types::Result;

use super::{SymmetricKey, SymmetricKeyProvider};

/// Logical slot name for the database data key.
pub const DB_KEY_NAME: &str = "dbkey";

/// Loads and creates wrapped data-key records.
pub struct EncryptionKeyStore {
    store: Store,
    provider: Arc<dyn SymmetricKeyProvider>,
}

impl EncryptionKeyStore {
    pub fn new(store: Store, provider: Arc<dyn SymmetricKeyProvider>) -> Self {
        Self { store, provider }
    }

    /// Load the named key slot and unwrap it with its recorded root key.
    pub fn load(&self, name: &str) -> Result<SymmetricKey> {
        let record = self.store.get_encryption_key_by_name(name)?;
        let key = self
            .provider
            .decrypt_data_key(&record.root_key_id, &record.wrapped)?;
        Ok(key.with_key_id(record.key_id))
    }

    /// Generate a fresh data key and persist its wrapped form under the
    /// named slot. The insert is a single statement, so a partially written
    /// key record cannot exist.
    pub fn create(&self, name: &str, root_key_id: &str) -> Result<SymmetricKey> {
        let key = self.provider.generate_data_key(root_key_id)?;
        let record = self.store.create_encryption_key(
            name,
            key.wrapped(),
            key.algorithm(),
            root_key_id,
        )?;
        tracing::info!(name = %name, key_id = record.key_id, "Created encryption key");
        Ok(key.with_key_id(record.key_id))
    }

    /// Startup resolution for a key slot: load it, or create it if this is
    /// the first boot. Any error other than the expected not-found
    /// propagates and aborts startup.
    pub fn load_or_create(&self, name: &str, root_key_id: &str) -> Result<SymmetricKey> {
        match self.load(name) {
            Ok(key) => Ok(key),
            Err(err) if err.is_not_found() => self.create(name, root_key_id),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::LocalKeyProvider;
    use crate::types::WardenError;

    fn key_store() -> (tempfile::TempDir, EncryptionKeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(LocalKeyProvider::new(dir.path()));
        let store = Store::open_in_memory().unwrap();
        (dir, EncryptionKeyStore::new(store, provider))
    }

    #[test]
    fn test_load_missing_slot_is_not_found() {
        let (_dir, keys) = key_store();
        let result = keys.load(DB_KEY_NAME);
        assert!(matches!(result, Err(WardenError::NotFound(_))));
    }

    #[test]
    fn test_create_then_load_same_key() {
        let (_dir, keys) = key_store();
        let created = keys.create(DB_KEY_NAME, "default").unwrap();
        let loaded = keys.load(DB_KEY_NAME).unwrap();

        assert_eq!(created.plaintext(), loaded.plaintext());
        assert_eq!(created.key_id(), loaded.key_id());
        assert!(created.key_id() > 0);
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let (_dir, keys) = key_store();
        let first = keys.load_or_create(DB_KEY_NAME, "default").unwrap();
        let second = keys.load_or_create(DB_KEY_NAME, "default").unwrap();
        assert_eq!(first.plaintext(), second.plaintext());
    }

    #[test]
    fn test_corrupted_record_aborts_load_or_create() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(LocalKeyProvider::new(dir.path()));
        let store = Store::open_in_memory().unwrap();
        store
            .create_encryption_key(DB_KEY_NAME, b"garbage-not-a-wrapped-key", "chacha20poly1305", "default")
            .unwrap();

        let keys = EncryptionKeyStore::new(store, provider);
        // A tampered record is an integrity failure, not a create-new path
        let result = keys.load_or_create(DB_KEY_NAME, "default");
        assert!(matches!(result, Err(WardenError::Integrity(_))));
    }
}
