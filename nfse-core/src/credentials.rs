//! Certificate bundles and the two capabilities derived from them.
//!
//! A [`CertificateBundle`] is loaded once from a PKCS#12 file (or PEM
//! certificate + PKCS#8 key). It hands out a [`SigningCredential`] for
//! XMLDSig and a [`TlsIdentity`] for mTLS; the two may come from different
//! bundles. Private keys are zeroized when dropped.
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, LineEnding, PrivateKeyInfo,
    SecretDocument,
};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use x509_cert::{
    Certificate,
    der::{Decode, DecodePem, Encode, EncodePem, oid::ObjectIdentifier},
};
use zeroize::Zeroizing;

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("wrong passphrase for certificate bundle")]
    BadPassphrase,
    #[error("certificate bundle contains no private key")]
    MissingPrivateKey,
    #[error("certificate bundle contains no certificate")]
    MissingCertificate,
    #[error("certificate expired at {not_after}")]
    Expired { not_after: DateTime<Utc> },
    #[error("certificate is not valid before {not_before}")]
    NotYetValid { not_before: DateTime<Utc> },
    #[error("unsupported key algorithm: only RSA keys are accepted")]
    UnsupportedKey,
    #[error("private key does not match the certificate")]
    KeyMismatch,
    #[error("malformed credential: {0}")]
    Malformed(String),
}

/// Parsed certificate plus its private key.
pub struct CertificateBundle {
    certificate: Certificate,
    certificate_der: Vec<u8>,
    key: RsaPrivateKey,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertificateBundle {
    /// Open a PKCS#12 bundle. The MAC is checked first so a wrong passphrase
    /// is reported as such rather than as a decryption failure.
    pub fn from_pkcs12(der: &[u8], passphrase: &str) -> Result<Self, CredentialError> {
        let pfx = p12::PFX::parse(der)
            .map_err(|e| CredentialError::Malformed(format!("PKCS#12 parse error: {e:?}")))?;
        if !pfx.verify_mac(passphrase) {
            return Err(CredentialError::BadPassphrase);
        }

        let keys = pfx
            .key_bags(passphrase)
            .map_err(|e| CredentialError::Malformed(format!("PKCS#12 key bag error: {e:?}")))?;
        let key_der = Zeroizing::new(
            keys.into_iter()
                .next()
                .ok_or(CredentialError::MissingPrivateKey)?,
        );
        let certs = pfx
            .cert_x509_bags(passphrase)
            .map_err(|e| CredentialError::Malformed(format!("PKCS#12 cert bag error: {e:?}")))?;

        let key = decode_private_key(&key_der)?;
        // Bundles may carry the chain too; pick the certificate matching the key.
        let public = RsaPublicKey::from(&key);
        let mut parsed = Vec::with_capacity(certs.len());
        for der in &certs {
            parsed.push(
                Certificate::from_der(der)
                    .map_err(|e| CredentialError::Malformed(format!("certificate: {e}")))?,
            );
        }
        if parsed.is_empty() {
            return Err(CredentialError::MissingCertificate);
        }
        let index = parsed
            .iter()
            .position(|c| certificate_public_key(c).is_ok_and(|k| k == public))
            .ok_or(CredentialError::KeyMismatch)?;
        Self::new(parsed.swap_remove(index), key)
    }

    pub fn from_pkcs12_file(path: &Path, passphrase: &str) -> Result<Self, CredentialError> {
        let der = read(path)?;
        Self::from_pkcs12(&der, passphrase)
    }

    /// PEM certificate plus an unencrypted PKCS#8 PEM private key.
    pub fn from_pem(certificate_pem: &str, key_pem: &str) -> Result<Self, CredentialError> {
        let certificate = Certificate::from_pem(certificate_pem.as_bytes())
            .map_err(|e| CredentialError::Malformed(format!("certificate: {e}")))?;
        let (_, key_der) = SecretDocument::from_pem(key_pem)
            .map_err(|e| CredentialError::Malformed(format!("private key: {e}")))?;
        let key = decode_private_key(key_der.as_bytes())?;
        Self::new(certificate, key)
    }

    pub fn from_pem_files(certificate: &Path, key: &Path) -> Result<Self, CredentialError> {
        let cert_pem = String::from_utf8(read(certificate)?)
            .map_err(|_| CredentialError::Malformed("certificate PEM is not UTF-8".into()))?;
        let key_pem = Zeroizing::new(
            String::from_utf8(read(key)?)
                .map_err(|_| CredentialError::Malformed("key PEM is not UTF-8".into()))?,
        );
        Self::from_pem(&cert_pem, &key_pem)
    }

    fn new(certificate: Certificate, key: RsaPrivateKey) -> Result<Self, CredentialError> {
        if certificate_public_key(&certificate)? != RsaPublicKey::from(&key) {
            return Err(CredentialError::KeyMismatch);
        }
        let validity = &certificate.tbs_certificate.validity;
        let not_before = to_utc(validity.not_before.to_unix_duration())?;
        let not_after = to_utc(validity.not_after.to_unix_duration())?;
        let certificate_der = certificate
            .to_der()
            .map_err(|e| CredentialError::Malformed(format!("certificate: {e}")))?;
        tracing::debug!(
            subject = %certificate.tbs_certificate.subject,
            %not_after,
            "loaded certificate bundle"
        );
        Ok(Self {
            certificate,
            certificate_der,
            key,
            not_before,
            not_after,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    fn ensure_valid_at(&self, at: DateTime<Utc>) -> Result<(), CredentialError> {
        check_validity(self.not_before, self.not_after, at)
    }

    pub fn signing_credential(&self) -> Result<SigningCredential, CredentialError> {
        self.signing_credential_at(Utc::now())
    }

    pub fn signing_credential_at(
        &self,
        at: DateTime<Utc>,
    ) -> Result<SigningCredential, CredentialError> {
        self.ensure_valid_at(at)?;
        Ok(SigningCredential {
            key: SigningKey::<Sha256>::new(self.key.clone()),
            certificate: self.certificate.clone(),
            certificate_der: self.certificate_der.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
        })
    }

    pub fn tls_identity(&self) -> Result<TlsIdentity, CredentialError> {
        self.tls_identity_at(Utc::now())
    }

    pub fn tls_identity_at(&self, at: DateTime<Utc>) -> Result<TlsIdentity, CredentialError> {
        self.ensure_valid_at(at)?;
        let key_pem = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CredentialError::Malformed(format!("private key: {e}")))?;
        let cert_pem = self
            .certificate
            .to_pem(LineEnding::LF)
            .map_err(|e| CredentialError::Malformed(format!("certificate: {e}")))?;
        let mut pem = Zeroizing::new(Vec::with_capacity(key_pem.len() + cert_pem.len()));
        pem.extend_from_slice(key_pem.as_bytes());
        pem.extend_from_slice(cert_pem.as_bytes());
        Ok(TlsIdentity {
            pem,
            not_before: self.not_before,
            not_after: self.not_after,
        })
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("subject", &self.certificate.tbs_certificate.subject.to_string())
            .field("not_after", &self.not_after)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// The "sign" capability: an RSA key with its X.509 certificate.
#[derive(Clone)]
pub struct SigningCredential {
    key: SigningKey<Sha256>,
    certificate: Certificate,
    certificate_der: Vec<u8>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl SigningCredential {
    /// RSASSA-PKCS1-v1_5 over SHA-256. Deterministic for a given key.
    pub fn sign_bytes(&self, data: &[u8]) -> Vec<u8> {
        let signature: Signature = self.key.sign(data);
        signature.to_bytes().into_vec()
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// Base64 DER, as carried in `X509Certificate`.
    pub fn certificate_base64(&self) -> String {
        Base64::encode_string(&self.certificate_der)
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn ensure_valid_at(&self, at: DateTime<Utc>) -> Result<(), CredentialError> {
        check_validity(self.not_before, self.not_after, at)
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("subject", &self.certificate.tbs_certificate.subject.to_string())
            .field("not_after", &self.not_after)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// The "authenticate" capability: client identity for mutual TLS.
#[derive(Clone)]
pub struct TlsIdentity {
    pem: Zeroizing<Vec<u8>>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl TlsIdentity {
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn ensure_valid_at(&self, at: DateTime<Utc>) -> Result<(), CredentialError> {
        check_validity(self.not_before, self.not_after, at)
    }

    pub(crate) fn to_reqwest(&self) -> Result<reqwest::Identity, CredentialError> {
        reqwest::Identity::from_pem(&self.pem)
            .map_err(|e| CredentialError::Malformed(format!("TLS identity: {e}")))
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("not_after", &self.not_after)
            .field("pem", &"<redacted>")
            .finish()
    }
}

/// RSA public key of a certificate.
pub fn certificate_public_key(certificate: &Certificate) -> Result<RsaPublicKey, CredentialError> {
    let spki = &certificate.tbs_certificate.subject_public_key_info;
    if spki.algorithm.oid != RSA_ENCRYPTION {
        return Err(CredentialError::UnsupportedKey);
    }
    let der = spki
        .to_der()
        .map_err(|e| CredentialError::Malformed(format!("public key: {e}")))?;
    RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| CredentialError::Malformed(format!("public key: {e}")))
}

/// Whether `certificate` carries a sha256WithRSAEncryption signature made by
/// `issuer`'s key.
pub fn is_issued_by(certificate: &Certificate, issuer: &Certificate) -> bool {
    if certificate.signature_algorithm.oid != SHA256_WITH_RSA
        || certificate.tbs_certificate.issuer != issuer.tbs_certificate.subject
    {
        return false;
    }
    let (Ok(key), Ok(tbs), Some(raw)) = (
        certificate_public_key(issuer),
        certificate.tbs_certificate.to_der(),
        certificate.signature.as_bytes(),
    ) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(key)
        .verify(&tbs, &signature)
        .is_ok()
}

fn decode_private_key(der: &[u8]) -> Result<RsaPrivateKey, CredentialError> {
    let info = PrivateKeyInfo::try_from(der)
        .map_err(|e| CredentialError::Malformed(format!("private key: {e}")))?;
    if info.algorithm.oid != RSA_ENCRYPTION {
        return Err(CredentialError::UnsupportedKey);
    }
    RsaPrivateKey::from_pkcs8_der(der)
        .map_err(|e| CredentialError::Malformed(format!("private key: {e}")))
}

/// Fail unless `at` falls inside the certificate's validity window.
pub fn ensure_certificate_valid_at(
    certificate: &Certificate,
    at: DateTime<Utc>,
) -> Result<(), CredentialError> {
    let validity = &certificate.tbs_certificate.validity;
    check_validity(
        to_utc(validity.not_before.to_unix_duration())?,
        to_utc(validity.not_after.to_unix_duration())?,
        at,
    )
}

fn check_validity(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    at: DateTime<Utc>,
) -> Result<(), CredentialError> {
    if at < not_before {
        return Err(CredentialError::NotYetValid { not_before });
    }
    if at > not_after {
        return Err(CredentialError::Expired { not_after });
    }
    Ok(())
}

fn to_utc(since_epoch: std::time::Duration) -> Result<DateTime<Utc>, CredentialError> {
    i64::try_from(since_epoch.as_secs())
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| CredentialError::Malformed("certificate validity out of range".into()))
}

fn read(path: &Path) -> Result<Vec<u8>, CredentialError> {
    std::fs::read(path).map_err(|source| CredentialError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixture(name: &str) -> String {
        format!(
            "{}/tests/fixtures/credentials/{name}",
            env!("CARGO_MANIFEST_DIR")
        )
    }

    fn read_fixture(name: &str) -> String {
        std::fs::read_to_string(fixture(name)).expect("fixture")
    }

    fn provider() -> CertificateBundle {
        CertificateBundle::from_pem(
            &read_fixture("provider-cert.pem"),
            &read_fixture("provider-key.pem"),
        )
        .expect("bundle")
    }

    #[test]
    fn pem_bundle_exposes_validity_window() {
        let bundle = provider();
        assert_eq!(bundle.not_before(), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(bundle.not_after(), Utc.with_ymd_and_hms(2045, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn validity_is_checked_when_issuing_capabilities() {
        let bundle = provider();
        let before = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2046, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            bundle.signing_credential_at(before),
            Err(CredentialError::NotYetValid { .. })
        ));
        assert!(matches!(
            bundle.tls_identity_at(after),
            Err(CredentialError::Expired { .. })
        ));
        assert!(bundle.signing_credential().is_ok());
    }

    #[test]
    fn bare_certificate_validity_window() {
        let certificate = provider().certificate().clone();
        assert!(ensure_certificate_valid_at(&certificate, Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()).is_ok());
        assert!(matches!(
            ensure_certificate_valid_at(&certificate, Utc.with_ymd_and_hms(2045, 1, 2, 0, 0, 0).unwrap()),
            Err(CredentialError::Expired { .. })
        ));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let result = CertificateBundle::from_pem(
            &read_fixture("provider-cert.pem"),
            &read_fixture("expired-key.pem"),
        );
        assert!(matches!(result, Err(CredentialError::KeyMismatch)));
    }

    #[test]
    fn signatures_are_deterministic_and_verify() {
        let credential = provider().signing_credential().expect("credential");
        let first = credential.sign_bytes(b"payload");
        assert_eq!(first, credential.sign_bytes(b"payload"));
        assert_eq!(first.len(), 256);

        let key = certificate_public_key(credential.certificate()).expect("public key");
        let signature = Signature::try_from(first.as_slice()).expect("signature");
        assert!(VerifyingKey::<Sha256>::new(key).verify(b"payload", &signature).is_ok());
    }

    #[test]
    fn issuer_signature_is_checked() {
        let ca = Certificate::from_pem(read_fixture("ca-cert.pem").as_bytes()).expect("ca");
        let authority =
            Certificate::from_pem(read_fixture("authority-cert.pem").as_bytes()).expect("cert");
        let provider = Certificate::from_pem(read_fixture("provider-cert.pem").as_bytes())
            .expect("cert");
        assert!(is_issued_by(&authority, &ca));
        assert!(!is_issued_by(&provider, &ca));
    }

    #[test]
    fn debug_output_hides_key_material() {
        let bundle = provider();
        let credential = bundle.signing_credential().expect("credential");
        let identity = bundle.tls_identity().expect("identity");
        for rendered in [
            format!("{bundle:?}"),
            format!("{credential:?}"),
            format!("{identity:?}"),
        ] {
            assert!(rendered.contains("<redacted>"));
            assert!(!rendered.contains("PRIVATE KEY"));
        }
    }

    #[test]
    fn unreadable_files_report_path() {
        let err = CertificateBundle::from_pkcs12_file(Path::new("/nonexistent.p12"), "x")
            .expect_err("missing file");
        assert!(err.to_string().contains("/nonexistent.p12"));
    }
}
