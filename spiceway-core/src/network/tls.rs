//! TLS client layer and the SPICE certificate policy.
//!
//! [`SpiceCertVerifier`] accepts a server certificate when any one of the
//! configured checks passes:
//!
//! - `PUBKEY`: the certificate's SubjectPublicKeyInfo equals the configured
//!   DER key.
//! - `HOSTNAME`: the chain reaches a trusted CA and the name matches the
//!   host we dialled.
//! - `SUBJECT`: the chain reaches a trusted CA and the subject equals the
//!   configured subject string.
//!
//! Without a CA bundle the chain checks cannot run. A verifier asked for
//! them falls back to `PUBKEY` alone when a key is configured, and refuses
//! to build otherwise.

use std::path::Path;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use super::der::{CertificateInfo, subject_matches};
use super::stream::{BoxedStream, boxed};
use crate::error::SpiceError;
use crate::flags::VerifyFlags;

// ── Settings ─────────────────────────────────────────────────────

/// What a channel needs to verify its server.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub verify: VerifyFlags,
    pub roots: Option<Arc<RootCertStore>>,
    /// DER SubjectPublicKeyInfo expected under `PUBKEY`.
    pub pubkey: Option<Vec<u8>>,
    /// Subject expected under `SUBJECT`, e.g. `"C=IL,O=Red Hat,CN=host"`.
    pub subject: Option<String>,
}

/// Read every certificate of a PEM bundle into a root store.
pub fn load_ca_file(path: &Path) -> Result<RootCertStore, SpiceError> {
    let pem = std::fs::read(path)
        .map_err(|e| SpiceError::Tls(format!("{}: {e}", path.display())))?;
    let mut roots = RootCertStore::empty();
    let mut count = 0usize;
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| SpiceError::Tls(format!("{}: {e}", path.display())))?;
        roots.add(cert)?;
        count += 1;
    }
    if count == 0 {
        return Err(SpiceError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    tracing::debug!(path = %path.display(), count, "loaded CA certificates");
    Ok(roots)
}

// ── SpiceCertVerifier ────────────────────────────────────────────

#[derive(Debug)]
pub struct SpiceCertVerifier {
    verify: VerifyFlags,
    roots: Option<Arc<RootCertStore>>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    pubkey: Option<Vec<u8>>,
    subject: Option<String>,
    provider: Arc<CryptoProvider>,
}

impl SpiceCertVerifier {
    pub fn new(settings: &TlsSettings, provider: Arc<CryptoProvider>) -> Result<Self, SpiceError> {
        let mut verify = settings.verify;
        let chain_checks = VerifyFlags::HOSTNAME | VerifyFlags::SUBJECT;

        if settings.roots.is_none() && verify.intersects(chain_checks) {
            if verify.contains(VerifyFlags::PUBKEY) && settings.pubkey.is_some() {
                tracing::warn!("no CA certificates loaded, verifying public key only");
                verify = VerifyFlags::PUBKEY;
            } else {
                return Err(SpiceError::Tls(
                    "certificate verification requested without CA certificates".into(),
                ));
            }
        }
        if verify.contains(VerifyFlags::PUBKEY) && settings.pubkey.is_none() {
            if verify == VerifyFlags::PUBKEY {
                return Err(SpiceError::Tls("public key verification without a key".into()));
            }
            verify.remove(VerifyFlags::PUBKEY);
        }
        if verify.contains(VerifyFlags::SUBJECT) && settings.subject.is_none() {
            if verify == VerifyFlags::SUBJECT {
                return Err(SpiceError::Tls("subject verification without a subject".into()));
            }
            verify.remove(VerifyFlags::SUBJECT);
        }
        if verify.is_empty() {
            return Err(SpiceError::Tls("no certificate verification configured".into()));
        }

        let webpki = match (&settings.roots, verify.contains(VerifyFlags::HOSTNAME)) {
            (Some(roots), true) => Some(
                WebPkiServerVerifier::builder_with_provider(Arc::clone(roots), Arc::clone(&provider))
                    .build()
                    .map_err(|e| SpiceError::Tls(e.to_string()))?,
            ),
            _ => None,
        };

        Ok(Self {
            verify,
            roots: settings.roots.clone(),
            webpki,
            pubkey: settings.pubkey.clone(),
            subject: settings.subject.clone(),
            provider,
        })
    }

    pub fn flags(&self) -> VerifyFlags {
        self.verify
    }

    fn check_pubkey(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let info = CertificateInfo::parse(end_entity)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        match &self.pubkey {
            Some(key) if key.as_slice() == info.spki => Ok(()),
            _ => Err(rustls::Error::General("public key mismatch".into())),
        }
    }

    fn check_subject(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        let (Some(roots), Some(subject)) = (&self.roots, &self.subject) else {
            return Err(rustls::Error::General("subject verification unavailable".into()));
        };
        let parsed = rustls::server::ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &parsed,
            roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;

        let info = CertificateInfo::parse(end_entity)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        match subject_matches(&info, subject) {
            Ok(true) => Ok(()),
            Ok(false) => Err(rustls::Error::General(format!(
                "subject mismatch: {}",
                info.subject_string().unwrap_or_default()
            ))),
            Err(e) => Err(rustls::Error::General(e.to_string())),
        }
    }
}

impl ServerCertVerifier for SpiceCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut last_err = rustls::Error::General("no verification method succeeded".into());

        if self.verify.contains(VerifyFlags::PUBKEY) {
            match self.check_pubkey(end_entity) {
                Ok(()) => return Ok(ServerCertVerified::assertion()),
                Err(e) => {
                    tracing::debug!(error = %e, "public key check failed");
                    last_err = e;
                }
            }
        }
        if let Some(webpki) = &self.webpki {
            match webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            {
                Ok(verified) => return Ok(verified),
                Err(e) => {
                    tracing::debug!(error = %e, "hostname check failed");
                    last_err = e;
                }
            }
        }
        if self.verify.contains(VerifyFlags::SUBJECT) {
            match self.check_subject(end_entity, intermediates, now) {
                Ok(()) => return Ok(ServerCertVerified::assertion()),
                Err(e) => {
                    tracing::debug!(error = %e, "subject check failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

// ── Client config / connect ──────────────────────────────────────

/// Build a rustls client config enforcing the SPICE certificate policy.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, SpiceError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(SpiceCertVerifier::new(settings, Arc::clone(&provider))?);
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Run the TLS handshake over `stream`, presenting `host` as server name.
pub async fn connect(
    stream: BoxedStream,
    host: &str,
    config: Arc<ClientConfig>,
) -> Result<BoxedStream, SpiceError> {
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| SpiceError::Tls(format!("{host}: {e}")))?;
    let tls = TlsConnector::from(config)
        .connect(name, stream)
        .await
        .map_err(|e| SpiceError::Tls(format!("{host}: {e}")))?;
    tracing::debug!(host, "tls handshake complete");
    Ok(boxed(tls))
}
