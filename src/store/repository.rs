//! Store repository
//!
//! CRUD operations for the trust-subsystem record types. Lookups return a
//! typed `NotFound` for missing rows; writes that must be atomic are single
//! INSERT statements or compare-and-swap UPDATEs.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::models::{CaRecord, Credential, EncryptionKeyRecord, Identity, TrustedCertificate};
use super::{lookup_error, Store};
use crate::types::{Result, WardenError};

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().map(parse_ts)
}

// =============================================================================
// Identities
// =============================================================================

impl Store {
    pub fn create_identity(&self, identity: &Identity) -> Result<()> {
        self.conn().execute(
            "INSERT INTO identities (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![identity.id, identity.name, identity.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_identity_by_name(&self, name: &str) -> Result<Identity> {
        self.conn()
            .query_row(
                "SELECT id, name, created_at FROM identities WHERE name = ?1",
                [name],
                row_to_identity,
            )
            .map_err(|e| lookup_error(&format!("identity {name:?}"), e))
    }
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let created_at: String = row.get(2)?;
    Ok(Identity {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_ts(&created_at),
    })
}

// =============================================================================
// Credentials
// =============================================================================

impl Store {
    pub fn create_credential(&self, credential: &Credential) -> Result<()> {
        self.conn().execute(
            "INSERT INTO credentials
                 (id, identity_id, password_hash, one_time_password,
                  one_time_password_used, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                credential.id,
                credential.identity_id,
                credential.password_hash,
                credential.one_time_password,
                credential.one_time_password_used,
                credential.created_at.to_rfc3339(),
                credential.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_credential_by_identity(&self, identity_id: &str) -> Result<Credential> {
        self.conn()
            .query_row(
                "SELECT id, identity_id, password_hash, one_time_password,
                        one_time_password_used, created_at, updated_at
                 FROM credentials WHERE identity_id = ?1",
                [identity_id],
                row_to_credential,
            )
            .map_err(|e| lookup_error(&format!("credential for identity {identity_id}"), e))
    }

    /// Mark a one-time password as consumed.
    ///
    /// Compare-and-swap on the used flag: of any number of concurrent login
    /// attempts with the same one-time password, exactly one observes the
    /// transition and gets `true`; the rest get `false`.
    pub fn consume_one_time_password(&self, credential_id: &str) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE credentials
             SET one_time_password_used = 1, updated_at = ?2
             WHERE id = ?1 AND one_time_password = 1 AND one_time_password_used = 0",
            params![credential_id, Utc::now().to_rfc3339()],
        )?;
        Ok(updated == 1)
    }

    /// Replace a credential's password hash and clear the consumed flag.
    pub fn reset_credential(&self, identity_id: &str, password_hash: &str, one_time_password: bool) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE credentials
             SET password_hash = ?2, one_time_password = ?3,
                 one_time_password_used = 0, updated_at = ?4
             WHERE identity_id = ?1",
            params![identity_id, password_hash, one_time_password, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(WardenError::NotFound(format!(
                "credential for identity {identity_id}"
            )));
        }
        Ok(())
    }
}

fn row_to_credential(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Credential {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        password_hash: row.get(2)?,
        one_time_password: row.get(3)?,
        one_time_password_used: row.get(4)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

// =============================================================================
// Encryption keys
// =============================================================================

impl Store {
    /// Persist a wrapped data key under a logical name.
    ///
    /// Single INSERT so a partially written key record cannot exist; the
    /// UNIQUE constraint on name makes double-creation an error rather than
    /// a silent overwrite. The short key id is allocated here.
    pub fn create_encryption_key(
        &self,
        name: &str,
        wrapped: &[u8],
        algorithm: &str,
        root_key_id: &str,
    ) -> Result<EncryptionKeyRecord> {
        let conn = self.conn();
        let key_id: u32 = conn.query_row(
            "SELECT COALESCE(MAX(key_id), 0) + 1 FROM encryption_keys",
            [],
            |row| row.get(0),
        )?;

        let record = EncryptionKeyRecord {
            id: Uuid::new_v4().to_string(),
            key_id,
            name: name.to_string(),
            wrapped: wrapped.to_vec(),
            algorithm: algorithm.to_string(),
            root_key_id: root_key_id.to_string(),
            created_at: Utc::now(),
        };

        conn.execute(
            "INSERT INTO encryption_keys
                 (id, key_id, name, wrapped, algorithm, root_key_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.key_id,
                record.name,
                record.wrapped,
                record.algorithm,
                record.root_key_id,
                record.created_at.to_rfc3339(),
            ],
        )?;

        Ok(record)
    }

    pub fn get_encryption_key_by_name(&self, name: &str) -> Result<EncryptionKeyRecord> {
        self.conn()
            .query_row(
                "SELECT id, key_id, name, wrapped, algorithm, root_key_id, created_at
                 FROM encryption_keys WHERE name = ?1",
                [name],
                row_to_encryption_key,
            )
            .map_err(|e| lookup_error(&format!("encryption key {name:?}"), e))
    }
}

fn row_to_encryption_key(row: &Row<'_>) -> rusqlite::Result<EncryptionKeyRecord> {
    let created_at: String = row.get(6)?;
    Ok(EncryptionKeyRecord {
        id: row.get(0)?,
        key_id: row.get(1)?,
        name: row.get(2)?,
        wrapped: row.get(3)?,
        algorithm: row.get(4)?,
        root_key_id: row.get(5)?,
        created_at: parse_ts(&created_at),
    })
}

// =============================================================================
// Certificate authorities
// =============================================================================

impl Store {
    pub fn create_ca(&self, record: &CaRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO certificate_authorities
                 (id, generation, cert_pem, key_sealed, not_before, not_after,
                  active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.generation,
                record.cert_pem,
                record.key_sealed,
                record.not_before.to_rfc3339(),
                record.not_after.to_rfc3339(),
                record.active,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Active CA generations, newest first.
    pub fn list_active_cas(&self) -> Result<Vec<CaRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, generation, cert_pem, key_sealed, not_before, not_after,
                    active, created_at
             FROM certificate_authorities
             WHERE active = 1
             ORDER BY generation DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_ca)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Hard-delete every generation older than the given one.
    pub fn delete_cas_before(&self, generation: u32) -> Result<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM certificate_authorities WHERE generation < ?1",
            [generation],
        )?;
        Ok(deleted)
    }
}

fn row_to_ca(row: &Row<'_>) -> rusqlite::Result<CaRecord> {
    let not_before: String = row.get(4)?;
    let not_after: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    Ok(CaRecord {
        id: row.get(0)?,
        generation: row.get(1)?,
        cert_pem: row.get(2)?,
        key_sealed: row.get(3)?,
        not_before: parse_ts(&not_before),
        not_after: parse_ts(&not_after),
        active: row.get(6)?,
        created_at: parse_ts(&created_at),
    })
}

// =============================================================================
// Trusted certificates
// =============================================================================

impl Store {
    /// Trust a client public key or certificate. Idempotent per public key.
    pub fn trust_certificate(&self, tc: &TrustedCertificate) -> Result<()> {
        let conn = self.conn();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM trusted_certificates WHERE public_key = ?1",
                params![tc.public_key],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(());
        }

        conn.execute(
            "INSERT INTO trusted_certificates
                 (id, public_key, key_algorithm, signing_algorithm, cert_pem,
                  expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tc.id,
                tc.public_key,
                tc.key_algorithm,
                tc.signing_algorithm,
                tc.cert_pem,
                tc.expires_at.map(|t| t.to_rfc3339()),
                tc.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_trusted_certificates(&self) -> Result<Vec<TrustedCertificate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, public_key, key_algorithm, signing_algorithm, cert_pem,
                    expires_at, created_at
             FROM trusted_certificates
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], row_to_trusted)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_trusted(row: &Row<'_>) -> rusqlite::Result<TrustedCertificate> {
    let expires_at: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(TrustedCertificate {
        id: row.get(0)?,
        public_key: row.get(1)?,
        key_algorithm: row.get(2)?,
        signing_algorithm: row.get(3)?,
        cert_pem: row.get(4)?,
        expires_at: parse_ts_opt(expires_at),
        created_at: parse_ts(&created_at),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> (Store, Identity) {
        let store = Store::open_in_memory().unwrap();
        let identity = Identity::new("admin");
        store.create_identity(&identity).unwrap();
        (store, identity)
    }

    #[test]
    fn test_identity_roundtrip() {
        let (store, identity) = seeded_store();
        let loaded = store.get_identity_by_name("admin").unwrap();
        assert_eq!(loaded.id, identity.id);

        let missing = store.get_identity_by_name("nobody");
        assert!(matches!(missing, Err(WardenError::NotFound(_))));
    }

    #[test]
    fn test_credential_roundtrip() {
        let (store, identity) = seeded_store();
        let cred = Credential::new(&identity.id, "$argon2id$hash".into(), false);
        store.create_credential(&cred).unwrap();

        let loaded = store.get_credential_by_identity(&identity.id).unwrap();
        assert_eq!(loaded.id, cred.id);
        assert!(!loaded.one_time_password);
    }

    #[test]
    fn test_consume_one_time_password_exactly_once() {
        let (store, identity) = seeded_store();
        let cred = Credential::new(&identity.id, "$argon2id$hash".into(), true);
        store.create_credential(&cred).unwrap();

        assert!(store.consume_one_time_password(&cred.id).unwrap());
        // Second consumer loses the race
        assert!(!store.consume_one_time_password(&cred.id).unwrap());

        let loaded = store.get_credential_by_identity(&identity.id).unwrap();
        assert!(loaded.one_time_password_used);
    }

    #[test]
    fn test_consume_ignores_regular_credentials() {
        let (store, identity) = seeded_store();
        let cred = Credential::new(&identity.id, "$argon2id$hash".into(), false);
        store.create_credential(&cred).unwrap();

        assert!(!store.consume_one_time_password(&cred.id).unwrap());
    }

    #[test]
    fn test_reset_credential_clears_used_flag() {
        let (store, identity) = seeded_store();
        let cred = Credential::new(&identity.id, "$argon2id$old".into(), true);
        store.create_credential(&cred).unwrap();
        store.consume_one_time_password(&cred.id).unwrap();

        store
            .reset_credential(&identity.id, "$argon2id$new", false)
            .unwrap();
        let loaded = store.get_credential_by_identity(&identity.id).unwrap();
        assert_eq!(loaded.password_hash, "$argon2id$new");
        assert!(!loaded.one_time_password_used);
    }

    #[test]
    fn test_encryption_key_ids_are_sequential_and_unique() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .create_encryption_key("dbkey", b"wrapped-1", "chacha20poly1305", "default")
            .unwrap();
        let second = store
            .create_encryption_key("other", b"wrapped-2", "chacha20poly1305", "default")
            .unwrap();
        assert_eq!(first.key_id, 1);
        assert_eq!(second.key_id, 2);

        // One record per logical name
        let dup = store.create_encryption_key("dbkey", b"x", "chacha20poly1305", "default");
        assert!(dup.is_err());
    }

    #[test]
    fn test_encryption_key_lookup() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.get_encryption_key_by_name("dbkey"),
            Err(WardenError::NotFound(_))
        ));

        store
            .create_encryption_key("dbkey", b"wrapped", "chacha20poly1305", "default")
            .unwrap();
        let loaded = store.get_encryption_key_by_name("dbkey").unwrap();
        assert_eq!(loaded.wrapped, b"wrapped");
        assert_eq!(loaded.root_key_id, "default");
    }

    #[test]
    fn test_active_cas_ordered_newest_first() {
        let store = Store::open_in_memory().unwrap();
        for generation in 0..3u32 {
            let now = Utc::now();
            store
                .create_ca(&CaRecord {
                    id: Uuid::new_v4().to_string(),
                    generation,
                    cert_pem: format!("cert-{generation}"),
                    key_sealed: "sealed".into(),
                    not_before: now,
                    not_after: now,
                    active: true,
                    created_at: now,
                })
                .unwrap();
        }

        let active = store.list_active_cas().unwrap();
        let generations: Vec<u32> = active.iter().map(|ca| ca.generation).collect();
        assert_eq!(generations, vec![2, 1, 0]);

        let deleted = store.delete_cas_before(1).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.list_active_cas().unwrap().len(), 2);
    }

    #[test]
    fn test_trust_certificate_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let tc = TrustedCertificate::from_public_key(vec![7; 32], "Ed25519", "Ed25519");
        store.trust_certificate(&tc).unwrap();
        store.trust_certificate(&tc).unwrap();

        assert_eq!(store.list_trusted_certificates().unwrap().len(), 1);
    }
}
