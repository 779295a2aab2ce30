//! Record store for Warden
//!
//! SQLite-backed persistence for identities, credentials, encryption keys,
//! CA generations and trusted certificates. The store hands out typed
//! records; a missing row is a typed `NotFound`, which bootstrap treats as
//! "create it", not as a failure.

pub mod models;
pub mod repository;

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::types::{Result, WardenError};

pub use models::{
    CaRecord, Credential, EncryptionKeyRecord, Identity, TrustedCertificate,
};

/// Shared handle to the SQLite record store.
///
/// Clones share one connection behind a mutex; short critical sections keep
/// contention negligible at this scale, and the mutex doubles as the
/// per-credential serialization point required by the one-time-password
/// consumed-flag update.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory database (for tests and ephemeral deployments).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run schema migrations to create or update tables.
    fn run_migrations(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS identities (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
                id                       TEXT PRIMARY KEY,
                identity_id              TEXT NOT NULL UNIQUE,
                password_hash            TEXT NOT NULL,
                one_time_password        INTEGER NOT NULL DEFAULT 0,
                one_time_password_used   INTEGER NOT NULL DEFAULT 0,
                created_at               TEXT NOT NULL,
                updated_at               TEXT NOT NULL,
                FOREIGN KEY(identity_id) REFERENCES identities(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS encryption_keys (
                id           TEXT PRIMARY KEY,
                key_id       INTEGER NOT NULL UNIQUE,
                name         TEXT NOT NULL UNIQUE,
                wrapped      BLOB NOT NULL,
                algorithm    TEXT NOT NULL,
                root_key_id  TEXT NOT NULL,
                created_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS certificate_authorities (
                id          TEXT PRIMARY KEY,
                generation  INTEGER NOT NULL UNIQUE,
                cert_pem    TEXT NOT NULL,
                key_sealed  TEXT NOT NULL,
                not_before  TEXT NOT NULL,
                not_after   TEXT NOT NULL,
                active      INTEGER NOT NULL DEFAULT 1,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trusted_certificates (
                id                 TEXT PRIMARY KEY,
                public_key         BLOB NOT NULL,
                key_algorithm      TEXT NOT NULL,
                signing_algorithm  TEXT NOT NULL,
                cert_pem           TEXT,
                expires_at         TEXT,
                created_at         TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_credentials_identity
                ON credentials(identity_id);

            CREATE INDEX IF NOT EXISTS idx_cas_active
                ON certificate_authorities(active);
            ",
        )?;

        tracing::debug!("Store migrations completed");
        Ok(())
    }
}

/// Map a rusqlite lookup error to the store taxonomy: no rows is the typed
/// `NotFound` that drives creation paths, everything else is `Database`.
pub(crate) fn lookup_error(what: &str, err: rusqlite::Error) -> WardenError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => WardenError::NotFound(what.to_string()),
        other => WardenError::Database(other.to_string()),
    }
}
