//! Local root-key provider
//!
//! Keeps one root key per id as a raw 32-byte file in a local directory,
//! generated on first use. Data keys are wrapped with ChaCha20-Poly1305
//! under the root key; the wrapped form is `nonce || ciphertext`.

use std::fs;
use std::path::{Path, PathBuf};

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use super::{SymmetricKey, SymmetricKeyProvider, ALGORITHM_CHACHA20_POLY1305, DATA_KEY_LEN, NONCE_LEN};
use crate::types::{Result, WardenError};

/// Root key length in bytes (256-bit)
const ROOT_KEY_LEN: usize = 32;

/// File-backed root-key provider.
pub struct LocalKeyProvider {
    dir: PathBuf,
}

impl LocalKeyProvider {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Load the root key for an id, generating and persisting it on first use.
    fn get_or_create_root_key(&self, root_key_id: &str) -> Result<Zeroizing<[u8; ROOT_KEY_LEN]>> {
        validate_key_id(root_key_id)?;
        let path = self.dir.join(format!("{root_key_id}.key"));

        if path.exists() {
            let bytes = fs::read(&path).map_err(|e| {
                WardenError::Config(format!("reading root key {root_key_id:?}: {e}"))
            })?;
            if bytes.len() != ROOT_KEY_LEN {
                return Err(WardenError::Config(format!(
                    "root key {root_key_id:?} has invalid length {}",
                    bytes.len()
                )));
            }
            let mut key = Zeroizing::new([0u8; ROOT_KEY_LEN]);
            key.copy_from_slice(&bytes);
            return Ok(key);
        }

        tracing::info!(root_key_id = %root_key_id, "No root key found, generating a new one");
        fs::create_dir_all(&self.dir).map_err(|e| {
            WardenError::Config(format!("creating root key directory: {e}"))
        })?;

        let mut key = Zeroizing::new([0u8; ROOT_KEY_LEN]);
        OsRng.fill_bytes(key.as_mut());
        fs::write(&path, key.as_ref()).map_err(|e| {
            WardenError::Config(format!("writing root key {root_key_id:?}: {e}"))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
        }

        Ok(key)
    }
}

impl SymmetricKeyProvider for LocalKeyProvider {
    fn generate_data_key(&self, root_key_id: &str) -> Result<SymmetricKey> {
        let root_key = self.get_or_create_root_key(root_key_id)?;

        let mut plaintext = [0u8; DATA_KEY_LEN];
        OsRng.fill_bytes(&mut plaintext);

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(root_key.as_ref()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| WardenError::Internal(format!("wrapping data key: {e}")))?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);

        Ok(SymmetricKey::new(
            plaintext,
            ALGORITHM_CHACHA20_POLY1305,
            root_key_id,
            wrapped,
        ))
    }

    fn decrypt_data_key(&self, root_key_id: &str, wrapped: &[u8]) -> Result<SymmetricKey> {
        let root_key = self.get_or_create_root_key(root_key_id)?;

        if wrapped.len() <= NONCE_LEN {
            return Err(WardenError::Integrity(
                "wrapped data key is too short".into(),
            ));
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(root_key.as_ref()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                WardenError::Integrity("data key unwrap failed authentication".into())
            })?;

        if plaintext.len() != DATA_KEY_LEN {
            return Err(WardenError::Integrity(format!(
                "unwrapped data key has invalid length {}",
                plaintext.len()
            )));
        }

        let mut key = [0u8; DATA_KEY_LEN];
        key.copy_from_slice(&plaintext);

        Ok(SymmetricKey::new(
            key,
            ALGORITHM_CHACHA20_POLY1305,
            root_key_id,
            wrapped.to_vec(),
        ))
    }
}

/// Root key ids become file names; restrict them accordingly.
fn validate_key_id(root_key_id: &str) -> Result<()> {
    let ok = !root_key_id.is_empty()
        && root_key_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(WardenError::Config(format!(
            "invalid root key id {root_key_id:?}"
        )))
    }
}
