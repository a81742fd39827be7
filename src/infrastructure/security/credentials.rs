//! Long-lived device credentials.
//!
//! One RSA-2048 key and one self-signed X.509 certificate per installation.
//! The certificate's CN is the device id, it is valid for ten years, and it
//! is never rotated; peers pin it at pair time, so regenerating it would
//! orphan every existing pairing.

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tracing::info;

use super::verification::{cert_fingerprint, spki_from_cert_der};
use crate::error::{DaemonError, Result};

const RSA_BITS: usize = 2048;
const VALIDITY_DAYS: i64 = 3650;
const DEVICE_ID_PREFIX: &str = "fyne";

/// TLS identity of this installation.
pub struct Credentials {
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
    cert_pem: String,
    key_pem: String,
    spki: Vec<u8>,
}

impl Credentials {
    /// Generate a fresh RSA-2048 key and self-signed certificate whose
    /// subject CN is `device_id`.
    pub fn generate(device_id: &str) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| DaemonError::identity(format!("rsa key generation failed: {e}")))?;

        let key_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| DaemonError::identity(format!("pkcs1 encoding failed: {e}")))?
            .to_string();
        let key_pkcs1 = private_key
            .to_pkcs1_der()
            .map_err(|e| DaemonError::identity(format!("pkcs1 encoding failed: {e}")))?;
        let key_pkcs8 = private_key
            .to_pkcs8_der()
            .map_err(|e| DaemonError::identity(format!("pkcs8 encoding failed: {e}")))?;

        let signing_key = KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(key_pkcs8.as_bytes().to_vec()),
            &PKCS_RSA_SHA256,
        )
        .map_err(|e| DaemonError::identity(format!("signing key rejected: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, device_id);
        dn.push(DnType::OrganizationName, "KDE Connect");

        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before + Duration::days(VALIDITY_DAYS);
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let cert = params
            .self_signed(&signing_key)
            .map_err(|e| DaemonError::identity(format!("certificate build failed: {e}")))?;

        let cert_der = cert.der().clone();
        let spki = spki_from_cert_der(cert_der.as_ref())?;
        info!(
            fingerprint = %cert_fingerprint(cert_der.as_ref()),
            "generated device certificate"
        );

        Ok(Self {
            cert_pem: cert.pem(),
            cert_der,
            key_der: PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(key_pkcs1.as_bytes().to_vec())),
            key_pem,
            spki,
        })
    }

    /// Rebuild credentials from the persisted PEM pair.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| DaemonError::identity("cert.pem contains no certificate"))?
            .map_err(|e| DaemonError::identity(format!("cert.pem unreadable: {e}")))?;
        let key = rustls_pemfile::rsa_private_keys(&mut key_pem.as_bytes())
            .next()
            .ok_or_else(|| DaemonError::identity("key.pem contains no RSA key"))?
            .map_err(|e| DaemonError::identity(format!("key.pem unreadable: {e}")))?;

        let spki = spki_from_cert_der(cert_der.as_ref())?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert_der,
            key_der: PrivateKeyDer::Pkcs1(key),
            spki,
        })
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert_der.clone()
    }

    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        self.key_der.clone_key()
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// DER SubjectPublicKeyInfo of the local certificate; one half of every
    /// verification-key derivation.
    pub fn spki(&self) -> &[u8] {
        &self.spki
    }

    pub fn fingerprint(&self) -> String {
        cert_fingerprint(self.cert_der.as_ref())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("fingerprint", &self.fingerprint())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Produce a fresh installation-unique device id:
/// `fyne-<30 hex chars from a nanosecond clock>`, 36 characters total, inside
/// the protocol's 32–38 character window.
pub fn generate_device_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{:030x}", DEVICE_ID_PREFIX, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_has_expected_shape() {
        let id = generate_device_id();
        assert_eq!(id.len(), 36);
        assert!(id.starts_with("fyne-"));
        assert!(id[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_credentials_round_trip_through_pem() {
        let creds = Credentials::generate("fyne-test-device").unwrap();
        assert!(creds.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(creds.key_pem().contains("BEGIN RSA PRIVATE KEY"));

        let reloaded = Credentials::from_pem(creds.cert_pem(), creds.key_pem()).unwrap();
        assert_eq!(reloaded.fingerprint(), creds.fingerprint());
        assert_eq!(reloaded.spki(), creds.spki());
    }

    #[test]
    fn certificate_subject_carries_device_id() {
        let creds = Credentials::generate("fyne-subject-check").unwrap();
        use x509_parser::prelude::{FromDer, X509Certificate};
        let cert_der = creds.cert_der();
        let (_, cert) = X509Certificate::from_der(cert_der.as_ref()).unwrap();
        let subject = cert.subject().to_string();
        assert!(subject.contains("fyne-subject-check"));
        assert!(subject.contains("KDE Connect"));
        let constraints = cert.basic_constraints().unwrap().expect("basic constraints");
        assert!(constraints.value.ca);
    }
}
