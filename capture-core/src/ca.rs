use crate::error::ProxyError;
use crate::Result;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

/// DER encoded leaf certificate and its PKCS#8 private key.
#[derive(Debug, Clone)]
pub struct LeafCertificate {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Issues leaf certificates for intercepted hosts.
///
/// The TLS acceptor only depends on this trait, so tests and embedders can
/// plug in their own issuer.
pub trait LeafCertificateSource: Send + Sync + 'static {
    fn leaf_certificate(&self, hostname: &str) -> Result<LeafCertificate>;
}

/// Certificate Authority for managing MITM certificates.
///
/// Handles persistence of the Root CA certificate and private key, and signs
/// per-host leaf certificates with it.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    cert_path: Option<PathBuf>,
}

impl CertificateAuthority {
    /// Load the CA found in `ca_dir`, or generate and persist a new one.
    pub fn new(ca_dir: &Path) -> Result<Self> {
        let ca_cert_path = ca_dir.join("ca.pem");
        let ca_key_path = ca_dir.join("ca.key");

        let mut ca = if ca_cert_path.exists() && ca_key_path.exists() {
            let cert_pem = fs::read_to_string(&ca_cert_path)?;
            let key_pem = fs::read_to_string(&ca_key_path)?;
            Self::from_pem(&cert_pem, &key_pem)?
        } else {
            fs::create_dir_all(ca_dir)?;
            Self::generate_and_save(&ca_cert_path, &ca_key_path)?
        };
        ca.cert_path = Some(ca_cert_path);
        Ok(ca)
    }

    /// Create a CertificateAuthority from PEM strings (cert and key).
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::Certificate(format!("Failed to parse CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| ProxyError::Certificate(format!("Failed to parse CA cert: {}", e)))?;
        let ca_cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("Failed to load CA cert: {}", e)))?;

        Ok(Self {
            ca_cert,
            cert_path: None,
        })
    }

    /// Generate a fresh in-memory Root CA.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Capture Proxy CA");
        dn.push(DnType::OrganizationName, "Capture Proxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        // Valid for 10 years
        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(365 * 10);

        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::Certificate(format!("Failed to generate CA key: {}", e)))?;
        params.key_pair = Some(key_pair);

        let ca_cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("Failed to generate CA cert: {}", e)))?;

        Ok(Self {
            ca_cert,
            cert_path: None,
        })
    }

    fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let ca = Self::generate()?;
        let cert_pem = ca.ca_cert_pem()?;

        fs::write(cert_path, &cert_pem)?;
        fs::write(key_path, ca.ca_cert.serialize_private_key_pem())?;
        // Browsers import the `.crt` variant
        fs::write(cert_path.with_extension("crt"), &cert_pem)?;

        tracing::info!(path = %cert_path.display(), "Generated new root CA");
        Ok(ca)
    }

    /// Get the Root CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> Result<String> {
        self.ca_cert
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("Failed to serialize CA cert: {}", e)))
    }

    /// Where the root certificate was persisted, if it came from disk.
    pub fn cert_path(&self) -> Option<&Path> {
        self.cert_path.as_deref()
    }
}

impl LeafCertificateSource for CertificateAuthority {
    fn leaf_certificate(&self, hostname: &str) -> Result<LeafCertificate> {
        let mut params = CertificateParams::new(vec![hostname.to_string()]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Backdated a day to tolerate clock skew
        let not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(365);

        let cert = Certificate::from_params(params).map_err(|e| {
            ProxyError::Certificate(format!("Failed to generate leaf for {}: {}", hostname, e))
        })?;
        let cert_der = cert.serialize_der_with_signer(&self.ca_cert).map_err(|e| {
            ProxyError::Certificate(format!("Failed to sign leaf for {}: {}", hostname, e))
        })?;

        Ok(LeafCertificate {
            cert_der,
            key_der: cert.serialize_private_key_der(),
        })
    }
}
