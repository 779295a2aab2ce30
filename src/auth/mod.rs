//! Credential authentication
//!
//! Password hashing and credential validation, including one-time-password
//! enforcement. Shares the CA subsystem's design rule: a secret is never
//! silently reusable.

pub mod password;
pub mod validate;

pub use password::{hash_password, verify_password};
pub use validate::validate_credential;
