//! CA material loading and leaf certificate issuance using rcgen.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Leaf certificates are valid for one year from issuance.
const LEAF_VALIDITY: Duration = Duration::days(365);

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse CA private key: {0}")]
    KeyParse(#[source] rcgen::Error),
    #[error("failed to parse CA certificate: {0}")]
    CertParse(#[source] rcgen::Error),
    #[error("failed to decode CA certificate PEM: {0}")]
    CertDecode(#[source] std::io::Error),
    #[error("CA certificate PEM contains no certificate")]
    EmptyCert,
}

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(#[source] rcgen::Error),
    #[error("failed to sign certificate: {0}")]
    Signing(#[source] rcgen::Error),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
}

/// CA key pair and certificate, loaded from PEM files at startup.
///
/// Immutable for the life of the process and owned exclusively by the
/// [`CertIssuer`].
pub struct CaMaterial {
    /// Signing identity for leaf certificates.
    issuer: Issuer<'static, KeyPair>,
    /// The CA certificate in DER format.
    ca_cert_der: CertificateDer<'static>,
    /// The CA certificate in PEM format (for installing client trust).
    ca_cert_pem: String,
}

impl CaMaterial {
    /// Loads the CA certificate and private key from PEM files.
    ///
    /// A missing or unparsable file is fatal to startup: the proxy cannot
    /// mint certificates without usable CA material.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let key_pem = std::fs::read_to_string(key_path).map_err(|source| CaError::Read {
            path: key_path.display().to_string(),
            source,
        })?;
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|source| CaError::Read {
            path: cert_path.display().to_string(),
            source,
        })?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(CaError::KeyParse)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(CaError::CertParse)?;

        let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or(CaError::EmptyCert)?
            .map_err(CaError::CertDecode)?;

        debug!("loaded CA material from {}", cert_path.display());

        Ok(Self {
            issuer,
            ca_cert_der,
            ca_cert_pem: cert_pem,
        })
    }

    /// Returns the CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Returns the CA certificate in DER format.
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }
}

/// Mints and caches leaf certificates keyed by hostname.
///
/// Each hostname gets exactly one certificate for the life of the process;
/// every subsequent handshake for that hostname reuses the cached entry.
/// There is no eviction or regeneration even though the stated validity is
/// one year.
pub struct CertIssuer {
    ca: CaMaterial,
    cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
    issued: AtomicU64,
}

impl CertIssuer {
    pub fn new(ca: CaMaterial) -> Self {
        Self {
            ca,
            cache: Mutex::new(HashMap::new()),
            issued: AtomicU64::new(0),
        }
    }

    /// Returns the certificate for `hostname`, generating and caching one on
    /// first use.
    ///
    /// Lookup, generation, and insertion share a single critical section, so
    /// concurrent handshakes for the same new hostname perform exactly one
    /// signing operation. A failed generation leaves the cache untouched.
    pub fn certificate_for(&self, hostname: &str) -> Result<Arc<CertifiedKey>, IssueError> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(key) = cache.get(hostname) {
            return Ok(Arc::clone(key));
        }

        let key = Arc::new(self.generate(hostname)?);
        cache.insert(hostname.to_string(), Arc::clone(&key));
        Ok(key)
    }

    /// Number of signing operations performed so far.
    pub fn certificates_issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Returns the CA material backing this issuer.
    pub fn ca(&self) -> &CaMaterial {
        &self.ca
    }

    fn generate(&self, hostname: &str) -> Result<CertifiedKey, IssueError> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            hostname
                .try_into()
                .map_err(|_| IssueError::InvalidDnsName(hostname.to_string()))?,
        )];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + LEAF_VALIDITY;

        // 128-bit serial drawn uniformly; collisions are possible in theory
        // but not structurally prevented.
        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let leaf_key_pair = KeyPair::generate().map_err(IssueError::KeyGeneration)?;
        let cert = params
            .signed_by(&leaf_key_pair, &self.ca.issuer)
            .map_err(IssueError::Signing)?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key_pair.serialize_der()));
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&key_der).map_err(IssueError::SigningKey)?;

        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!("issued certificate for {}", hostname);

        Ok(CertifiedKey::new(vec![cert_der], signing_key))
    }
}
