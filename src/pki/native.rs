//! Native certificate provider
//!
//! Generates and stores CA generations locally: ECDSA P-256 keypairs,
//! self-signed certificates, 128-bit random serials. Private keys are
//! sealed with the field cipher before they reach the database and are
//! unsealed into memory once at load.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls_pki_types::PrivatePkcs8KeyDer;
use time::{Duration as TimeDuration, OffsetDateTime};
use uuid::Uuid;

use crate::keys::FieldCipher;
use crate::store::{CaRecord, Store};
use crate::types::{Result, WardenError};

use super::{pem_to_der, CaGeneration, CertificateProvider, LeafCertificate};

/// Organization name on every certificate this provider issues.
const ORG: &str = "Warden";

/// Clock-skew tolerance applied to NotBefore (minutes).
const CLOCK_SKEW_MINUTES: i64 = 5;

/// CA provider backed by the local record store.
pub struct NativeCertificateProvider {
    store: Store,
    cipher: Arc<FieldCipher>,
    rotation_days: i64,
    /// Active generations, newest (primary) first
    cas: RwLock<Vec<CaGeneration>>,
    /// Server leaf cache, invalidated on rotation: (generation, hosts, leaf)
    leaf: RwLock<Option<(u32, Vec<String>, LeafCertificate)>>,
}

impl NativeCertificateProvider {
    /// Load active generations from the store, unsealing their private keys.
    pub fn new(store: Store, cipher: Arc<FieldCipher>, rotation_days: i64) -> Result<Self> {
        let records = store.list_active_cas()?;
        let mut cas = Vec::with_capacity(records.len());
        for record in records {
            cas.push(load_generation(&cipher, &record)?);
        }

        if !cas.is_empty() {
            tracing::info!(
                active = cas.len(),
                primary_generation = cas[0].generation,
                "Loaded CA generations"
            );
        }

        Ok(Self {
            store,
            cipher,
            rotation_days,
            cas: RwLock::new(cas),
            leaf: RwLock::new(None),
        })
    }

    fn next_generation(&self) -> u32 {
        read_lock(&self.cas)
            .first()
            .map(|ca| ca.generation + 1)
            .unwrap_or(0)
    }

    /// Certificate parameters shared by generation and signing-time
    /// reconstruction; the distinguished name must be identical in both so
    /// issued leaf chains verify against the stored CA certificate.
    fn ca_params(&self, generation: u32) -> Result<CertificateParams> {
        let mut params = CertificateParams::new(Vec::default())?;
        params
            .distinguished_name
            .push(DnType::CommonName, format!("Warden Root CA {generation}"));
        params.distinguished_name.push(DnType::OrganizationName, ORG);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        params.key_usages.push(KeyUsagePurpose::CrlSign);

        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::minutes(CLOCK_SKEW_MINUTES);
        params.not_after = now + TimeDuration::days(self.rotation_days);
        Ok(params)
    }

    fn generate_generation(&self, generation: u32) -> Result<CaGeneration> {
        let mut params = self.ca_params(generation)?;
        params.serial_number = Some(random_serial());

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        let now = Utc::now();
        Ok(CaGeneration {
            generation,
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            not_before: now - chrono::Duration::minutes(CLOCK_SKEW_MINUTES),
            not_after: now + chrono::Duration::days(self.rotation_days),
            key_der: key.serialize_der(),
        })
    }

    fn persist_generation(&self, ca: &CaGeneration) -> Result<()> {
        let record = CaRecord {
            id: Uuid::new_v4().to_string(),
            generation: ca.generation,
            cert_pem: ca.cert_pem.clone(),
            key_sealed: self.cipher.seal(&ca.key_der)?,
            not_before: ca.not_before,
            not_after: ca.not_after,
            active: true,
            created_at: Utc::now(),
        };
        self.store.create_ca(&record)
    }

    /// Rebuild the primary CA's signing identity from its stored key. The
    /// reconstructed certificate carries the same DN and key as the
    /// original, so signatures chain to the persisted CA certificate.
    fn signing_identity(&self, primary: &CaGeneration) -> Result<(Certificate, KeyPair)> {
        let pkcs8 = PrivatePkcs8KeyDer::from(primary.key_der.as_slice());
        let ca_key = KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &PKCS_ECDSA_P256_SHA256)?;
        let ca_cert = self.ca_params(primary.generation)?.self_signed(&ca_key)?;
        Ok((ca_cert, ca_key))
    }

    fn issue_leaf(&self, primary: &CaGeneration, hosts: &[String]) -> Result<LeafCertificate> {
        let (ca_cert, ca_key) = self.signing_identity(primary)?;

        let mut params = CertificateParams::new(hosts.to_vec())?;
        params
            .distinguished_name
            .push(DnType::CommonName, "Warden Server");
        params.distinguished_name.push(DnType::OrganizationName, ORG);
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(random_serial());

        params.not_before = OffsetDateTime::now_utc() - TimeDuration::minutes(CLOCK_SKEW_MINUTES);
        // Leaf validity never outlives the signing CA
        params.not_after = OffsetDateTime::from_unix_timestamp(primary.not_after.timestamp())
            .map_err(|e| WardenError::Internal(format!("leaf validity: {e}")))?;

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

        Ok(LeafCertificate {
            cert_der: leaf.der().to_vec(),
            key_der: leaf_key.serialize_der(),
        })
    }
}

impl CertificateProvider for NativeCertificateProvider {
    fn create_ca(&self) -> Result<()> {
        let generation = self.next_generation();
        let ca = self.generate_generation(generation)?;
        // Persist first: the generation only becomes primary once it is
        // fully stored, so a failed create leaves prior state in force.
        self.persist_generation(&ca)?;

        tracing::info!(
            generation = ca.generation,
            not_after = %ca.not_after,
            fingerprint = %ca.fingerprint(),
            "Created CA generation"
        );
        write_lock(&self.cas).insert(0, ca);
        write_lock(&self.leaf).take();
        Ok(())
    }

    fn rotate_ca(&self) -> Result<()> {
        let generation = self.next_generation();
        let ca = self.generate_generation(generation)?;
        self.persist_generation(&ca)?;

        tracing::info!(
            generation = ca.generation,
            fingerprint = %ca.fingerprint(),
            "Rotated CA, new primary"
        );

        let retire_before = {
            let mut cas = write_lock(&self.cas);
            cas.insert(0, ca);
            if cas.len() > 2 {
                let keep_from = cas[1].generation;
                cas.truncate(2);
                Some(keep_from)
            } else {
                None
            }
        };

        if let Some(generation) = retire_before {
            let retired = self.store.delete_cas_before(generation)?;
            tracing::info!(retired, "Retired CA generations beyond the overlap pair");
        }

        write_lock(&self.leaf).take();
        Ok(())
    }

    fn active_cas(&self) -> Vec<CaGeneration> {
        read_lock(&self.cas).clone()
    }

    fn tls_certificates(&self, hosts: &[String]) -> Result<LeafCertificate> {
        let primary = read_lock(&self.cas)
            .first()
            .cloned()
            .ok_or_else(|| WardenError::Tls("no active CA to sign the server certificate".into()))?;

        {
            let cached = read_lock(&self.leaf);
            if let Some((generation, cached_hosts, leaf)) = cached.as_ref() {
                if *generation == primary.generation && cached_hosts == hosts {
                    return Ok(leaf.clone());
                }
            }
        }

        let leaf = self.issue_leaf(&primary, hosts)?;
        *write_lock(&self.leaf) = Some((primary.generation, hosts.to_vec(), leaf.clone()));
        Ok(leaf)
    }

    fn preload(&self, _cert_pem: &str, _public_key: &[u8]) -> Result<()> {
        Err(WardenError::Unsupported("preload"))
    }
}

fn load_generation(cipher: &FieldCipher, record: &CaRecord) -> Result<CaGeneration> {
    let key_der = cipher.unseal(&record.key_sealed)?;
    let cert_der = pem_to_der(&record.cert_pem)?;
    Ok(CaGeneration {
        generation: record.generation,
        cert_der,
        cert_pem: record.cert_pem.clone(),
        not_before: record.not_before,
        not_after: record.not_after,
        key_der,
    })
}

/// Serial numbers are drawn from a 128-bit uniform random space.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Clear the top bit so the DER integer stays positive without padding
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
