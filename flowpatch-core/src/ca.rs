use crate::error::ProxyError;
use crate::Result;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

const CA_COMMON_NAME: &str = "flowpatch CA";
const CA_ORGANIZATION: &str = "flowpatch interception proxy";

/// Root CA used to sign the per-host certificates the proxy presents.
///
/// The certificate and key live in the configured directory as `ca.pem` and
/// `ca.key`; a `ca.crt` copy is written for the embedding application to install
/// into the client's trust store.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_dir: PathBuf,
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
    ];
    params
}

impl CertificateAuthority {
    /// Load the CA found in `ca_dir`, or generate and save a new one.
    pub fn new(ca_dir: &Path) -> Result<Self> {
        let ca_cert_path = ca_dir.join("ca.pem");
        let ca_key_path = ca_dir.join("ca.key");

        let ca_cert = if ca_cert_path.exists() && ca_key_path.exists() {
            let key_pem = fs::read_to_string(&ca_key_path)?;
            Self::certificate_from_key(&key_pem)?
        } else {
            fs::create_dir_all(ca_dir)?;
            Self::generate_and_save(&ca_cert_path, &ca_key_path)?
        };

        Ok(Self {
            ca_cert,
            ca_dir: ca_dir.to_path_buf(),
        })
    }

    /// Rebuild the CA certificate around a stored key.
    ///
    /// rcgen cannot sign with a parsed certificate, so the certificate is
    /// recreated with the same subject and key. Leaf certificates it signs still
    /// chain to the installed `ca.crt` since issuer name and key match.
    fn certificate_from_key(key_pem: &str) -> Result<Certificate> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::Certificate(format!("Failed to parse CA key: {}", e)))?;

        let mut params = ca_params();
        params.key_pair = Some(key_pair);

        Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("Failed to recreate CA cert: {}", e)))
    }

    fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Certificate> {
        let mut params = ca_params();

        // Valid for 10 years
        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(365 * 10);

        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::Certificate(format!("Failed to generate CA key: {}", e)))?;
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("Failed to generate CA cert: {}", e)))?;

        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("Failed to serialize CA cert: {}", e)))?;
        let key_pem = cert.serialize_private_key_pem();

        fs::write(cert_path, &cert_pem)?;
        fs::write(key_path, &key_pem)?;
        fs::write(cert_path.with_extension("crt"), &cert_pem)?;

        Ok(cert)
    }

    /// Path of the certificate file the client should trust.
    pub fn installable_cert_path(&self) -> PathBuf {
        self.ca_dir.join("ca.crt")
    }

    /// Root CA certificate in PEM format.
    pub fn cert_pem(&self) -> Result<String> {
        self.ca_cert
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("Failed to serialize CA cert: {}", e)))
    }

    /// Root CA certificate in DER format, for hudsucker.
    pub fn cert_der(&self) -> Result<Vec<u8>> {
        self.ca_cert
            .serialize_der()
            .map_err(|e| ProxyError::Certificate(format!("Failed to serialize CA cert DER: {}", e)))
    }

    /// Root CA private key in DER format, for hudsucker.
    pub fn key_der(&self) -> Vec<u8> {
        self.ca_cert.serialize_private_key_der()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ca_generation_and_loading() {
        let dir = tempdir().unwrap();
        let ca_dir = dir.path().join("certs");

        let ca = CertificateAuthority::new(&ca_dir).expect("Failed to create CA");
        assert!(ca_dir.join("ca.pem").exists());
        assert!(ca_dir.join("ca.key").exists());
        assert!(ca.installable_cert_path().exists());

        let saved_key = fs::read_to_string(ca_dir.join("ca.key")).unwrap();

        // Second creation loads instead of regenerating
        let ca2 = CertificateAuthority::new(&ca_dir).expect("Failed to load CA");
        assert_eq!(fs::read_to_string(ca_dir.join("ca.key")).unwrap(), saved_key);
        assert_eq!(ca.key_der(), ca2.key_der());
        assert!(!ca2.cert_der().unwrap().is_empty());
    }

    #[test]
    fn test_cert_pem_format() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::new(dir.path()).unwrap();

        let pem = ca.cert_pem().unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_corrupt_key_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("ca.pem"), "not a cert").unwrap();
        fs::write(dir.path().join("ca.key"), "not a key").unwrap();

        let err = CertificateAuthority::new(dir.path()).err().unwrap();
        assert!(matches!(err, ProxyError::Certificate(_)));
    }
}
