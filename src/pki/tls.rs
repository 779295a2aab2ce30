//! TLS assembler
//!
//! Builds the live server TLS configuration from the certificate provider's
//! current state. Two modes:
//!
//! - **mTLS**: leaf certificate signed by the primary CA; client
//!   certificates are required and verified against every active CA plus
//!   the non-expired trusted client certificates.
//! - **Fallback** ("none"): no client auth; a self-signed certificate is
//!   generated per server name on the first handshake that mentions it and
//!   cached until invalidated.
//!
//! Rebuilt synchronously after every CA rotation, before listeners start,
//! so a handshake never observes a half-updated trust pool.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::store::Store;
use crate::types::{Result, WardenError};

use super::{pem_to_der, CertificateProvider};

/// Build the server TLS configuration for the configured mode.
pub fn build_server_config(
    mtls: bool,
    provider: &dyn CertificateProvider,
    store: &Store,
    hosts: &[String],
) -> Result<ServerConfig> {
    if mtls {
        mtls_server_config(provider, store, hosts)
    } else {
        let default_host = hosts.first().map(String::as_str).unwrap_or("localhost");
        fallback_server_config(default_host)
    }
}

/// mTLS listener configuration: fail closed, no anonymous connections.
pub fn mtls_server_config(
    provider: &dyn CertificateProvider,
    store: &Store,
    hosts: &[String],
) -> Result<ServerConfig> {
    let leaf = provider.tls_certificates(hosts)?;
    let roots = client_ca_pool(provider, store)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| WardenError::Tls(format!("building client verifier: {e}")))?;

    let cert_chain = vec![CertificateDer::from(leaf.cert_der)];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der));

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)?;
    Ok(config)
}

/// The client certificate verification pool: every active CA generation
/// plus every trusted certificate that carries an unexpired certificate.
pub fn client_ca_pool(provider: &dyn CertificateProvider, store: &Store) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    let active = provider.active_cas();
    if active.is_empty() {
        return Err(WardenError::Tls(
            "cannot build an mTLS trust pool with no active CA".into(),
        ));
    }
    for ca in &active {
        roots.add(CertificateDer::from(ca.cert_der.clone()))?;
    }

    let now = Utc::now();
    for tc in store.list_trusted_certificates()? {
        if !tc.usable_at(now) {
            continue;
        }
        let Some(pem) = tc.cert_pem.as_deref() else {
            continue;
        };
        let der = pem_to_der(pem)?;
        tracing::debug!(id = %tc.id, "Trusting client certificate");
        roots.add(CertificateDer::from(der))?;
    }

    Ok(roots)
}

/// Fallback listener configuration: per-hostname self-signed certificates.
pub fn fallback_server_config(default_host: &str) -> Result<ServerConfig> {
    let resolver = Arc::new(SelfSignedCertResolver::new(default_host));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    Ok(config)
}

/// Resolver that issues and caches one self-signed certificate per server
/// name. A handshake for a previously unseen name generates the pair; it is
/// reused until explicitly invalidated.
pub struct SelfSignedCertResolver {
    default_host: String,
    cache: DashMap<String, Arc<CertifiedKey>>,
}

impl SelfSignedCertResolver {
    pub fn new(default_host: &str) -> Self {
        Self {
            default_host: default_host.to_string(),
            cache: DashMap::new(),
        }
    }

    fn certified_key_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(entry) = self.cache.get(server_name) {
            return Ok(Arc::clone(&entry));
        }

        tracing::info!(server_name = %server_name, "Generating self-signed certificate");
        let (cert_der, key_der) = generate_self_signed(server_name)?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
            PrivatePkcs8KeyDer::from(key_der),
        ))
        .map_err(|e| WardenError::Tls(format!("loading self-signed key: {e}")))?;

        let certified = Arc::new(CertifiedKey::new(
            vec![CertificateDer::from(cert_der)],
            signing_key,
        ));
        self.cache
            .insert(server_name.to_string(), Arc::clone(&certified));
        Ok(certified)
    }

    /// Drop the cached pair for a server name; the next handshake
    /// regenerates it.
    pub fn invalidate(&self, server_name: &str) {
        self.cache.remove(server_name);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl ResolvesServerCert for SelfSignedCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello
            .server_name()
            .unwrap_or(&self.default_host)
            .to_string();
        match self.certified_key_for(&name) {
            Ok(certified) => Some(certified),
            Err(e) => {
                tracing::warn!(server_name = %name, error = %e, "Self-signed issuance failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for SelfSignedCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCertResolver")
            .field("default_host", &self.default_host)
            .field("cached", &self.cache.len())
            .finish()
    }
}

fn generate_self_signed(host: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut params = CertificateParams::new(vec![host.to_string()])?;
    params.distinguished_name.push(DnType::CommonName, host);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Warden");
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);

    let mut serial = [0u8; 16];
    OsRng.fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    let now = OffsetDateTime::now_utc();
    params.not_before = now - TimeDuration::minutes(5);
    params.not_after = now + TimeDuration::days(365);

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    Ok((cert.der().to_vec(), key.serialize_der()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{FieldCipher, SymmetricKey, ALGORITHM_CHACHA20_POLY1305, DATA_KEY_LEN};
    use crate::pki::NativeCertificateProvider;
    use crate::store::TrustedCertificate;
    use chrono::Duration;

    fn test_provider() -> (Store, NativeCertificateProvider) {
        let store = Store::open_in_memory().unwrap();
        let mut material = [0u8; DATA_KEY_LEN];
        OsRng.fill_bytes(&mut material);
        let key = SymmetricKey::new(material, ALGORITHM_CHACHA20_POLY1305, "default", vec![])
            .with_key_id(1);
        let cipher = Arc::new(FieldCipher::new(key));
        let provider = NativeCertificateProvider::new(store.clone(), cipher, 365).unwrap();
        (store, provider)
    }

    fn hosts() -> Vec<String> {
        vec!["localhost".to_string()]
    }

    #[test]
    fn test_mtls_pool_contains_every_active_ca() {
        let (store, provider) = test_provider();
        provider.create_ca().unwrap();
        provider.rotate_ca().unwrap();

        let pool = client_ca_pool(&provider, &store).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_mtls_pool_without_ca_fails_closed() {
        let (store, provider) = test_provider();
        let result = client_ca_pool(&provider, &store);
        assert!(matches!(result, Err(WardenError::Tls(_))));
    }

    #[test]
    fn test_mtls_pool_includes_unexpired_trusted_certs_only() {
        let (store, provider) = test_provider();
        provider.create_ca().unwrap();

        // Borrow a generated certificate as externally supplied material
        let donor_pem = provider.active_cas()[0].cert_pem.clone();
        provider.rotate_ca().unwrap();

        let now = Utc::now();
        let mut valid = TrustedCertificate::from_public_key(vec![1; 32], "ECDSA", "ECDSA-P256-SHA256");
        valid.cert_pem = Some(donor_pem.clone());
        valid.expires_at = Some(now + Duration::days(30));
        store.trust_certificate(&valid).unwrap();

        let mut expired = TrustedCertificate::from_public_key(vec![2; 32], "ECDSA", "ECDSA-P256-SHA256");
        expired.cert_pem = Some(donor_pem);
        expired.expires_at = Some(now - Duration::days(1));
        store.trust_certificate(&expired).unwrap();

        // Public key without a certificate: trusted for seeding, not poolable
        let key_only = TrustedCertificate::from_public_key(vec![3; 32], "Ed25519", "Ed25519");
        store.trust_certificate(&key_only).unwrap();

        let pool = client_ca_pool(&provider, &store).unwrap();
        // two active CAs + one unexpired trusted certificate
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_mtls_server_config_builds() {
        let (store, provider) = test_provider();
        provider.create_ca().unwrap();
        provider.rotate_ca().unwrap();

        let config = mtls_server_config(&provider, &store, &hosts()).unwrap();
        // client certificates are required in this mode
        assert!(config.max_early_data_size == 0);
    }

    #[test]
    fn test_fallback_resolver_caches_per_server_name() {
        let resolver = SelfSignedCertResolver::new("localhost");

        let first = resolver.certified_key_for("a.example.com").unwrap();
        let again = resolver.certified_key_for("a.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(resolver.cached_len(), 1);

        let other = resolver.certified_key_for("b.example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(resolver.cached_len(), 2);
    }

    #[test]
    fn test_fallback_resolver_invalidation_regenerates() {
        let resolver = SelfSignedCertResolver::new("localhost");
        let first = resolver.certified_key_for("a.example.com").unwrap();

        resolver.invalidate("a.example.com");
        let second = resolver.certified_key_for("a.example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_fallback_server_config_builds() {
        assert!(fallback_server_config("localhost").is_ok());
    }
}
