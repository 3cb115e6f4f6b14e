//! X.509 identities.
//!
//! Domains are their own certificate authorities: a domain certificate is
//! self-signed with subject and issuer both equal to the domain name, and
//! user certificates are issued by their domain with subject `user@domain`.
//! The anonymous identity has subject and issuer `@`.
//!
//! Nothing here talks to the network; cryptographic trust decisions are made
//! by the TLS layer and the per-command name checks.

use crate::error::{Error, Result};

use md5::{Digest, Md5};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyPair, SerialNumber,
};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Serial number of the worthless self-signed certificate minted while a
/// proper one is being requested from a domain.
const THROWAWAY_SERIAL: u64 = 1;

/// Serial number used for freshly minted anonymous certificates.
const ANONYMOUS_SERIAL: u64 = 218374;

/// A parsed certificate: DER bytes plus the issuer and subject common names.
///
/// Equality is DER byte equality; two certificates that differ only in
/// serialization are different certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    subject: String,
    issuer: String,
}

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let (_, parsed) = X509Certificate::from_der(&der)
            .map_err(|e| Error::Verify(format!("unparseable certificate: {}", e)))?;

        let subject = common_name(parsed.subject())?;
        let issuer = common_name(parsed.issuer())?;
        drop(parsed);

        Ok(Self {
            der,
            subject,
            issuer,
        })
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        Self::from_der(pem_to_der(pem, "CERTIFICATE")?)
    }

    pub fn to_pem(&self) -> String {
        der_to_pem(&self.der, "CERTIFICATE")
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject_common_name(&self) -> &str {
        &self.subject
    }

    pub fn issuer_common_name(&self) -> &str {
        &self.issuer
    }

    /// Whether this looks like the self-signed root of `domain`.
    pub fn is_self_signed_for(&self, domain: &str) -> bool {
        self.subject == domain && self.issuer == domain
    }

    /// Cryptographically check that `issuer` signed this certificate.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<()> {
        let (_, me) = X509Certificate::from_der(&self.der)
            .map_err(|e| Error::Verify(format!("unparseable certificate: {}", e)))?;
        let (_, signer) = X509Certificate::from_der(&issuer.der)
            .map_err(|e| Error::Verify(format!("unparseable issuer: {}", e)))?;

        me.verify_signature(Some(signer.public_key())).map_err(|_| {
            Error::Verify(format!(
                "{} does not carry a signature by {}",
                self.subject, issuer.subject
            ))
        })
    }

    /// Short digest for log lines.
    pub fn digest(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(&self.der);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// A certificate together with its private key.
pub struct PrivateIdentity {
    certificate: Certificate,
    key_der: Vec<u8>,
}

impl PrivateIdentity {
    /// Mint a self-signed authority certificate for `subject`, marked as a
    /// CA so it can issue user certificates.
    pub fn self_signed(subject: &str, serial: u64) -> Result<Self> {
        debug_assert!(!subject.contains('@'), "user certs are never self-signed");

        let key = KeyPair::generate().map_err(cert_error)?;
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished(subject);
        params.serial_number = Some(SerialNumber::from(serial));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let cert = params.self_signed(&key).map_err(cert_error)?;
        Ok(Self {
            certificate: Certificate::from_der(cert.der().to_vec())?,
            key_der: key.serialize_der(),
        })
    }

    /// Mint the `@` identity used by callers that claim nothing.
    pub fn anonymous() -> Result<Self> {
        Self::leaf("@", ANONYMOUS_SERIAL)
    }

    /// Mint a worthless self-signed placeholder for `subject`, used only to
    /// carry a TLS handshake while the real certificate is requested.
    pub fn throwaway(subject: &str) -> Result<Self> {
        Self::leaf(subject, THROWAWAY_SERIAL)
    }

    fn leaf(subject: &str, serial: u64) -> Result<Self> {
        let key = KeyPair::generate().map_err(cert_error)?;
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished(subject);
        params.serial_number = Some(SerialNumber::from(serial));

        let cert = params.self_signed(&key).map_err(cert_error)?;
        Ok(Self {
            certificate: Certificate::from_der(cert.der().to_vec())?,
            key_der: key.serialize_der(),
        })
    }

    pub fn from_parts(certificate: Certificate, key_der: Vec<u8>) -> Self {
        Self {
            certificate,
            key_der,
        }
    }

    /// Load from concatenated certificate and private-key PEM blocks.
    pub fn from_pem(pem: &str) -> Result<Self> {
        Ok(Self {
            certificate: Certificate::from_pem(pem)?,
            key_der: pem_to_der(pem, "PRIVATE KEY")?,
        })
    }

    /// Certificate PEM followed by the PKCS#8 key PEM.
    pub fn to_pem(&self) -> String {
        format!(
            "{}{}",
            self.certificate.to_pem(),
            der_to_pem(&self.key_der, "PRIVATE KEY")
        )
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Sign a certificate request, issuing a certificate whose issuer is
    /// this identity's subject.
    ///
    /// The request subject must consist of exactly one common name.
    pub fn sign_request(&self, csr_der: &[u8], serial: u64) -> Result<Certificate> {
        csr_subject(csr_der)?;

        let mut csr = CertificateSigningRequestParams::from_der(&csr_der.to_vec().into())
            .map_err(|e| Error::BadCertificateRequest(e.to_string()))?;

        let key = KeyPair::try_from(self.key_der.as_slice()).map_err(cert_error)?;
        let mut issuer_params =
            CertificateParams::from_ca_cert_der(&self.certificate.der.clone().into())
                .map_err(cert_error)?;
        issuer_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let issuer = issuer_params.self_signed(&key).map_err(cert_error)?;

        csr.params.serial_number = Some(SerialNumber::from(serial));
        let cert = csr.signed_by(&issuer, &key).map_err(cert_error)?;
        Certificate::from_der(cert.der().to_vec())
    }
}

/// Extract the subject of a certificate request, which must consist of
/// exactly one common name.
pub fn csr_subject(csr_der: &[u8]) -> Result<String> {
    use x509_parser::certification_request::X509CertificationRequest;

    let (_, req) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| Error::BadCertificateRequest(format!("unparseable request: {}", e)))?;

    let subject = &req.certification_request_info.subject;
    if subject.iter_rdn().count() != 1 || subject.iter_common_name().count() != 1 {
        return Err(Error::BadCertificateRequest(
            "subject must contain exactly a common name".to_string(),
        ));
    }

    subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::BadCertificateRequest("subject must contain exactly a common name".to_string())
        })
}

/// Generate a fresh key pair and a certificate request for `subject`,
/// returning the request DER and the key DER.
pub fn certificate_request(subject: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = KeyPair::generate().map_err(cert_error)?;
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished(subject);

    let csr = params.serialize_request(&key).map_err(cert_error)?;
    Ok((csr.der().to_vec(), key.serialize_der()))
}

fn distinguished(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn cert_error(value: rcgen::Error) -> Error {
    Error::Connection(format!("certificate operation failed: {}", value))
}

fn common_name(name: &x509_parser::x509::X509Name<'_>) -> Result<String> {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::Verify("certificate without a common name".to_string()))
}

fn der_to_pem(der: &[u8], label: &str) -> String {
    use base64::{Engine, engine::general_purpose::STANDARD};

    let encoded = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);

    // Base64 output is ASCII, so slicing on byte offsets is safe.
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let take = rest.len().min(64);
        out.push_str(&rest[..take]);
        out.push('\n');
        rest = &rest[take..];
    }

    out.push_str(&format!("-----END {}-----\n", label));
    out
}

fn pem_to_der(pem: &str, label: &str) -> Result<Vec<u8>> {
    for block in x509_parser::pem::Pem::iter_from_buffer(pem.as_bytes()) {
        let block = block.map_err(|e| Error::Verify(format!("bad pem: {}", e)))?;
        if block.label == label {
            return Ok(block.contents);
        }
    }

    Err(Error::Verify(format!("no {} block in pem", label)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_certificates_are_their_own_issuer() {
        let identity = PrivateIdentity::self_signed("example.com", 7).unwrap();
        let cert = identity.certificate();
        assert!(cert.is_self_signed_for("example.com"));
        assert_eq!(cert.subject_common_name(), "example.com");
        assert_eq!(cert.issuer_common_name(), "example.com");
    }

    #[test]
    fn signed_requests_chain_back_to_the_domain() {
        let authority = PrivateIdentity::self_signed("example.com", 7).unwrap();
        let (csr, _key) = certificate_request("bob@example.com").unwrap();

        let cert = authority.sign_request(&csr, 99).unwrap();
        assert_eq!(cert.subject_common_name(), "bob@example.com");
        assert_eq!(cert.issuer_common_name(), "example.com");
        cert.verify_signed_by(authority.certificate()).unwrap();
    }

    #[test]
    fn foreign_signatures_do_not_verify() {
        let authority = PrivateIdentity::self_signed("example.com", 7).unwrap();
        let other = PrivateIdentity::self_signed("other.org", 8).unwrap();
        let (csr, _key) = certificate_request("bob@example.com").unwrap();

        let cert = authority.sign_request(&csr, 99).unwrap();
        assert!(cert.verify_signed_by(other.certificate()).is_err());
    }

    #[test]
    fn pem_round_trip_preserves_the_identity() {
        let identity = PrivateIdentity::self_signed("example.com", 7).unwrap();
        let loaded = PrivateIdentity::from_pem(&identity.to_pem()).unwrap();
        assert_eq!(loaded.certificate(), identity.certificate());
        assert_eq!(loaded.key_der(), identity.key_der());
    }

    #[test]
    fn requests_with_extra_attributes_are_rejected() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "bob@example.com");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "bob inc");

        let csr = params.serialize_request(&key).unwrap();
        assert!(matches!(
            csr_subject(csr.der()),
            Err(Error::BadCertificateRequest(_))
        ));
    }

    #[test]
    fn anonymous_identity_is_the_at_sign() {
        let identity = PrivateIdentity::anonymous().unwrap();
        assert!(identity.certificate().is_self_signed_for("@"));
    }
}
