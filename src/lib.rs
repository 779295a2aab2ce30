//! Warden - identity and access control server
//!
//! Warden issues and validates the trust material for infrastructure
//! access: a self-managed certificate authority rotated without downtime,
//! envelope encryption for data at rest, and credential validation with
//! single-use secret enforcement.
//!
//! ## Subsystems
//!
//! - **keys**: data-key wrapping under a root key, field sealing
//! - **pki**: CA generations, rotation policy, TLS assembly
//! - **auth**: password hashing and one-time-password validation
//! - **store**: SQLite record store behind typed repositories
//! - **server**: startup ladder, listeners, lifecycle

pub mod auth;
pub mod config;
pub mod keys;
pub mod pki;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::Args;
pub use server::{Addrs, AppState, Server};
pub use types::{Result, WardenError};
