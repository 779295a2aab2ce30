//! Persistent record types
//!
//! Plain data carried between the store and the trust subsystem. Sensitive
//! material never appears here in the clear: credential rows hold argon2
//! hashes, encryption-key rows hold wrapped bytes, CA rows hold sealed
//! private keys.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// An identity that can authenticate against this server.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A password credential owned by an identity.
///
/// If `one_time_password` is set, `one_time_password_used` transitions
/// false→true exactly once; validation of an already-used one-time password
/// fails regardless of hash correctness.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub identity_id: String,
    pub password_hash: String,
    pub one_time_password: bool,
    pub one_time_password_used: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(identity_id: &str, password_hash: String, one_time_password: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            identity_id: identity_id.to_string(),
            password_hash,
            one_time_password,
            one_time_password_used: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A wrapped data key, one row per logical slot (e.g. "dbkey").
///
/// The short `key_id` is embedded in sealed payloads so the matching key can
/// be located without trial decryption. The wrapped bytes are meaningless
/// without the root key named by `root_key_id`.
#[derive(Debug, Clone)]
pub struct EncryptionKeyRecord {
    pub id: String,
    pub key_id: u32,
    pub name: String,
    pub wrapped: Vec<u8>,
    pub algorithm: String,
    pub root_key_id: String,
    pub created_at: DateTime<Utc>,
}

/// One CA generation: a self-signed certificate plus its sealed private key.
///
/// Never mutated after creation except for the active flag.
#[derive(Debug, Clone)]
pub struct CaRecord {
    pub id: String,
    pub generation: u32,
    pub cert_pem: String,
    pub key_sealed: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// An externally supplied certificate or public key trusted for client
/// authentication. Only entries with an unexpired certificate enter the
/// live mTLS pool.
#[derive(Debug, Clone)]
pub struct TrustedCertificate {
    pub id: String,
    pub public_key: Vec<u8>,
    pub key_algorithm: String,
    pub signing_algorithm: String,
    pub cert_pem: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TrustedCertificate {
    pub fn from_public_key(public_key: Vec<u8>, key_algorithm: &str, signing_algorithm: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            public_key,
            key_algorithm: key_algorithm.to_string(),
            signing_algorithm: signing_algorithm.to_string(),
            cert_pem: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this entry may be added to the live client trust pool.
    pub fn usable_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.cert_pem, self.expires_at) {
            (Some(_), Some(expires)) => expires > now,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_credential_is_unused() {
        let cred = Credential::new("ident-1", "$argon2id$...".into(), true);
        assert!(cred.one_time_password);
        assert!(!cred.one_time_password_used);
    }

    #[test]
    fn test_trusted_certificate_usability() {
        let now = Utc::now();

        let mut tc = TrustedCertificate::from_public_key(vec![1, 2, 3], "Ed25519", "Ed25519");
        // Public key only: never in the cert pool
        assert!(!tc.usable_at(now));

        tc.cert_pem = Some("-----BEGIN CERTIFICATE-----".into());
        tc.expires_at = Some(now + Duration::days(1));
        assert!(tc.usable_at(now));

        tc.expires_at = Some(now - Duration::days(1));
        assert!(!tc.usable_at(now));
    }
}
