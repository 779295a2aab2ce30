//! Certificate authority management
//!
//! Warden runs its own CA: a sequence of self-signed *generations*, where
//! the newest (primary) signs newly issued leaf certificates and the
//! previous one (secondary) is kept active so certificates it signed remain
//! verifiable. Rotation is evaluated at boot, not on a timer.

pub mod native;
pub mod tls;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::types::{Result, WardenError};

pub use native::NativeCertificateProvider;

/// One CA generation held in memory: certificate plus unsealed private key.
#[derive(Clone)]
pub struct CaGeneration {
    pub generation: u32,
    /// DER-encoded self-signed CA certificate
    pub cert_der: Vec<u8>,
    /// PEM form of the same certificate (persisted, exported)
    pub cert_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// PKCS#8 private key, unsealed. Sealed with the field cipher at rest.
    pub(crate) key_der: Vec<u8>,
}

impl CaGeneration {
    /// SHA-256 fingerprint of the CA certificate (colon-separated hex).
    pub fn fingerprint(&self) -> String {
        compute_fingerprint(&self.cert_der)
    }
}

impl std::fmt::Debug for CaGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaGeneration")
            .field("generation", &self.generation)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// A leaf server certificate issued by the primary CA.
#[derive(Clone)]
pub struct LeafCertificate {
    /// DER-encoded server certificate
    pub cert_der: Vec<u8>,
    /// DER-encoded server private key (PKCS#8)
    pub key_der: Vec<u8>,
}

/// Capability interface over CA backends.
///
/// One native implementation exists; external backends plug in behind the
/// same trait. Operations a backend cannot perform return the typed
/// `WardenError::Unsupported` so callers can fall through to a default path.
pub trait CertificateProvider: Send + Sync {
    /// Generate a new CA generation and mark it primary.
    fn create_ca(&self) -> Result<()>;

    /// Generate a new primary, demote the previous primary to secondary and
    /// retire anything older.
    fn rotate_ca(&self) -> Result<()>;

    /// Active CA generations, newest (primary) first.
    fn active_cas(&self) -> Vec<CaGeneration>;

    /// Issue (or return the cached) server leaf certificate signed by the
    /// current primary, with the given hosts as SANs.
    fn tls_certificates(&self, hosts: &[String]) -> Result<LeafCertificate>;

    /// Seed a CA generation from externally supplied material instead of
    /// generating one. Providers without support return `Unsupported`.
    fn preload(&self, cert_pem: &str, public_key: &[u8]) -> Result<()>;
}

/// Evaluate one step of the boot-time rotation ladder. Returns whether any
/// action was taken; bootstrap re-evaluates until the state is stable.
///
/// (a) no active CAs: create the first generation;
/// (b) a single active CA: rotate, so a verification-overlap pair always
///     exists;
/// (c) the secondary expires within half the rotation window: rotate, so
///     leaves signed by an aging CA stay verifiable for their own lifetime.
///
/// This runs only during startup, before any listener accepts connections.
pub fn resolve_rotation_policy(
    provider: &dyn CertificateProvider,
    rotation_days: i64,
) -> Result<bool> {
    let active = provider.active_cas();

    if active.is_empty() {
        tracing::info!("Creating root CA certificate");
        provider.create_ca()?;
        return Ok(true);
    }

    if active.len() == 1 {
        tracing::info!("Rotating root CA certificate");
        provider.rotate_ca()?;
        return Ok(true);
    }

    let rotation_window = Utc::now() + Duration::days(rotation_days / 2);
    if active[1].not_after < rotation_window {
        tracing::info!(
            secondary_generation = active[1].generation,
            secondary_not_after = %active[1].not_after,
            "Half-rotating root CA certificate"
        );
        provider.rotate_ca()?;
        return Ok(true);
    }

    Ok(false)
}

// =============================================================================
// PEM helpers
// =============================================================================

/// Encode a DER certificate as PEM, wrapped at 64 characters per line.
pub fn der_to_pem(der: &[u8]) -> String {
    let b64 = BASE64.encode(der);
    let wrapped: Vec<&str> = b64
        .as_bytes()
        .chunks(64)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
        .collect();
    format!(
        "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
        wrapped.join("\n")
    )
}

/// Decode a single PEM certificate back to DER.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let mut in_block = false;
    let mut b64 = String::new();
    for line in pem.lines() {
        let line = line.trim();
        if line == "-----BEGIN CERTIFICATE-----" {
            in_block = true;
        } else if line == "-----END CERTIFICATE-----" {
            if b64.is_empty() {
                break;
            }
            return BASE64
                .decode(&b64)
                .map_err(|_| WardenError::Config("malformed certificate PEM body".into()));
        } else if in_block {
            b64.push_str(line);
        }
    }
    Err(WardenError::Config(
        "input does not contain a certificate PEM block".into(),
    ))
}

/// SHA-256 fingerprint, colon-separated hex.
pub fn compute_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pem_roundtrip() {
        let der = vec![0x30, 0x82, 0x01, 0x0a, 0xff, 0x00, 0x41];
        let pem = der_to_pem(&der);

        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        assert_eq!(pem_to_der(&pem).unwrap(), der);
    }

    #[test]
    fn test_pem_wraps_at_64_chars() {
        let der = vec![0xab; 200];
        let pem = der_to_pem(&der);
        for line in pem.lines() {
            if !line.starts_with("-----") {
                assert!(line.len() <= 64);
            }
        }
    }

    #[test]
    fn test_pem_without_block_is_config_error() {
        let result = pem_to_der("not a certificate");
        assert!(matches!(result, Err(WardenError::Config(_))));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = compute_fingerprint(b"some certificate bytes");
        // 32 bytes = 64 hex chars + 31 colons
        assert_eq!(fp.len(), 95);
        assert_eq!(fp.matches(':').count(), 31);
    }
}
