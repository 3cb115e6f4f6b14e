//! TLS configuration for the STARTTLS upgrade.
//!
//! Trust here is deliberately not web-PKI: domains are their own roots. The
//! asking side pins the peer's self-signed domain certificate byte for byte
//! when it wants authorization; the answering side accepts any client
//! certificate whose issuer it can check a signature against, and leaves the
//! name-level authorization rule to the per-command checks.

use crate::{
    error::{Error, Result},
    identity::{Certificate, PrivateIdentity},
    store::CertStore,
};

use std::sync::Arc;

use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

fn keyed(identity: &PrivateIdentity) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = CertificateDer::from(identity.certificate().der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_der().to_vec()));
    (vec![cert], key)
}

fn config_error(value: rustls::Error) -> Error {
    Error::Connection(format!("tls configuration failed: {}", value))
}

/// The config for the side that asked SECURE: present `identity`, and when
/// `pinned` is set require the peer to present exactly that certificate.
pub fn client_config(
    identity: &PrivateIdentity,
    pinned: Option<Certificate>,
) -> Result<ClientConfig> {
    let (certs, key) = keyed(identity);
    let verifier: Arc<dyn ServerCertVerifier> = Arc::new(PinnedServerVerifier {
        pinned,
        provider: provider(),
    });

    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)
        .map_err(config_error)
}

/// The config for the side that answered SECURE: present `identity` and
/// require a client certificate, checked against `store` where possible.
pub fn server_config(
    identity: &PrivateIdentity,
    store: Arc<dyn CertStore>,
    expected_issuer: Option<Certificate>,
) -> Result<ServerConfig> {
    let (certs, key) = keyed(identity);
    let verifier = Arc::new(OverlayClientVerifier {
        store,
        expected_issuer,
        provider: provider(),
    });

    ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(config_error)
}

pub fn server_name(domain: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| Error::Connection(format!("not a usable server name: {}", domain)))
}

fn bad_certificate() -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
}

/// Accepts exactly the pinned certificate, or (unauthorized mode) any
/// certificate at all. Chain building never applies.
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned: Option<Certificate>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match &self.pinned {
            Some(expected) if end_entity.as_ref() != expected.der() => Err(bad_certificate()),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Requires a client certificate and checks its signature against whichever
/// issuer this node can lay hands on: a learned domain root, one of our own
/// identities, or the issuer fetched for this handshake. Self-signed
/// certificates are accepted as their own roots, and an issuer we cannot
/// resolve is recorded rather than rejected, because the name rule applied
/// per command is what actually grants authority.
struct OverlayClientVerifier {
    store: Arc<dyn CertStore>,
    expected_issuer: Option<Certificate>,
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for OverlayClientVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayClientVerifier").finish()
    }
}

impl ClientCertVerifier for OverlayClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let cert = Certificate::from_der(end_entity.to_vec()).map_err(|_| bad_certificate())?;
        if cert.subject_common_name() == cert.issuer_common_name() {
            return Ok(ClientCertVerified::assertion());
        }

        let issuer_name = cert.issuer_common_name();
        let issuer = self
            .store
            .get_self_signed(issuer_name)
            .or_else(|| {
                self.store
                    .get_private(issuer_name)
                    .map(|identity| identity.certificate().clone())
            })
            .or_else(|| {
                self.expected_issuer
                    .clone()
                    .filter(|expected| expected.subject_common_name() == issuer_name)
            });

        match issuer {
            Some(issuer) => cert
                .verify_signed_by(&issuer)
                .map(|_| ClientCertVerified::assertion())
                .map_err(|_| bad_certificate()),
            None => Ok(ClientCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
