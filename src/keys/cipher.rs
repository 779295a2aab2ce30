//! Field sealing
//!
//! Authenticated encryption of individual stored values under the active
//! data key. Sealed payloads are text-safe: `v1:<key_id>:<base64(nonce || ct)>`,
//! so the short key id travels with the ciphertext and a mismatched or
//! tampered payload fails closed with an integrity error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::{SymmetricKey, NONCE_LEN};
use crate::types::{Result, WardenError};

/// Sealed payload format version
const VERSION: &str = "v1";

/// Seal a value under the data key.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<String> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.plaintext()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| WardenError::Internal(format!("sealing field: {e}")))?;

    let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);

    Ok(format!("{VERSION}:{}:{}", key.key_id(), BASE64.encode(payload)))
}

/// Unseal a payload produced by [`seal`].
///
/// Every failure mode is an integrity error: the caller must treat the read
/// as failed, never as "no encryption".
pub fn unseal(key: &SymmetricKey, sealed: &str) -> Result<Vec<u8>> {
    let mut parts = sealed.splitn(3, ':');
    let (version, key_id, body) = match (parts.next(), parts.next(), parts.next()) {
        (Some(v), Some(k), Some(b)) => (v, k, b),
        _ => return Err(WardenError::Integrity("malformed sealed payload".into())),
    };

    if version != VERSION {
        return Err(WardenError::Integrity(format!(
            "unknown sealed payload version {version:?}"
        )));
    }

    let payload_key_id: u32 = key_id
        .parse()
        .map_err(|_| WardenError::Integrity("malformed sealed payload key id".into()))?;
    if payload_key_id != key.key_id() {
        return Err(WardenError::Integrity(format!(
            "sealed payload key id {} does not match active key {}",
            payload_key_id,
            key.key_id()
        )));
    }

    let payload = BASE64
        .decode(body)
        .map_err(|_| WardenError::Integrity("sealed payload is not valid base64".into()))?;
    if payload.len() <= NONCE_LEN {
        return Err(WardenError::Integrity("sealed payload is too short".into()));
    }
    let (nonce, ciphertext) = payload.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.plaintext()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| WardenError::Integrity("sealed payload failed authentication".into()))
}

/// Owned cipher context for components that persist encrypted fields.
///
/// Constructed once at startup from the loaded data key and passed by
/// reference into whatever needs it; there is no process-global key state,
/// so calling code cannot reach sealing before initialization.
pub struct FieldCipher {
    key: SymmetricKey,
}

impl FieldCipher {
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    pub fn key_id(&self) -> u32 {
        self.key.key_id()
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        seal(&self.key, plaintext)
    }

    pub fn unseal(&self, sealed: &str) -> Result<Vec<u8>> {
        unseal(&self.key, sealed)
    }

    /// Seal a UTF-8 string value.
    pub fn seal_str(&self, value: &str) -> Result<String> {
        self.seal(value.as_bytes())
    }

    /// Unseal into a UTF-8 string value.
    pub fn unseal_str(&self, sealed: &str) -> Result<String> {
        let bytes = self.unseal(sealed)?;
        String::from_utf8(bytes)
            .map_err(|_| WardenError::Integrity("unsealed value is not valid UTF-8".into()))
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("key_id", &self.key.key_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ALGORITHM_CHACHA20_POLY1305, DATA_KEY_LEN};

    fn test_key() -> SymmetricKey {
        let mut material = [0u8; DATA_KEY_LEN];
        OsRng.fill_bytes(&mut material);
        SymmetricKey::new(material, ALGORITHM_CHACHA20_POLY1305, "default", vec![]).with_key_id(1)
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let key = test_key();
        let sealed = seal(&key, b"the private key material").unwrap();

        assert!(sealed.starts_with("v1:1:"));
        let opened = unseal(&key, &sealed).unwrap();
        assert_eq!(opened, b"the private key material");
    }

    #[test]
    fn test_every_flipped_byte_fails_authentication() {
        let key = test_key();
        let sealed = seal(&key, b"attack at dawn").unwrap();
        let (prefix, body) = sealed.rsplit_once(':').unwrap();
        let mut payload = BASE64.decode(body).unwrap();

        for i in 0..payload.len() {
            payload[i] ^= 0x01;
            let tampered = format!("{prefix}:{}", BASE64.encode(&payload));
            let result = unseal(&key, &tampered);
            assert!(
                matches!(result, Err(WardenError::Integrity(_))),
                "byte {i} flip must fail"
            );
            payload[i] ^= 0x01;
        }
    }

    #[test]
    fn test_key_id_mismatch_is_integrity_error() {
        let key = test_key();
        let sealed = seal(&key, b"value").unwrap();

        let other = test_key().with_key_id(2);
        let result = unseal(&other, &sealed);
        assert!(matches!(result, Err(WardenError::Integrity(_))));
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        let key = test_key();
        for payload in ["", "v1", "v1:1", "v0:1:AAAA", "v1:x:AAAA", "v1:1:!!!", "v1:1:AAAA"] {
            let result = unseal(&key, payload);
            assert!(
                matches!(result, Err(WardenError::Integrity(_))),
                "payload {payload:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_field_cipher_string_roundtrip() {
        let cipher = FieldCipher::new(test_key());
        let sealed = cipher.seal_str("hunter2").unwrap();
        assert_ne!(sealed, "hunter2");
        assert_eq!(cipher.unseal_str(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn test_seal_is_randomized() {
        let cipher = FieldCipher::new(test_key());
        let a = cipher.seal_str("same value").unwrap();
        let b = cipher.seal_str("same value").unwrap();
        assert_ne!(a, b);
    }
}
