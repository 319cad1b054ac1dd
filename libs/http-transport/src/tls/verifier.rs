use std::sync::Arc;
use std::time::Duration;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

/// Upper bound on how many certificates of one chain may have their expiry
/// forgiven.
const MAX_EXPIRED_IN_CHAIN: usize = 4;

/// Server certificate verifier with opt-in relaxations on top of webpki.
///
/// Full chain validation always runs first. Only specific failures are then
/// tolerated:
///
/// - a name mismatch, when hostname verification is off
/// - an unknown issuer on a lone self-signed certificate, which is re-checked
///   with itself as the only trust anchor
/// - an expired certificate, when self-signed acceptance and expiry tolerance
///   are both enabled
///
/// Any other failure is returned unchanged. An expired chain is verified again
/// at the last second of its validity, so issuer and hostname are still
/// checked.
#[derive(Debug)]
pub struct RelaxedServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
    verify_hostname: bool,
    allow_self_signed: bool,
    ignore_expired: bool,
}

impl RelaxedServerVerifier {
    #[must_use]
    pub fn new(
        inner: Arc<WebPkiServerVerifier>,
        provider: Arc<CryptoProvider>,
        verify_hostname: bool,
        allow_self_signed: bool,
        ignore_expired: bool,
    ) -> Self {
        Self {
            inner,
            provider,
            verify_hostname,
            allow_self_signed,
            ignore_expired: allow_self_signed && ignore_expired,
        }
    }

    fn tolerate(
        &self,
        err: rustls::Error,
        server_name: &ServerName<'_>,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &err {
            rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            ) if !self.verify_hostname => {
                tracing::debug!(
                    server = ?server_name,
                    "accepting certificate for another host, hostname verification is disabled"
                );
                Ok(ServerCertVerified::assertion())
            }
            _ => Err(err),
        }
    }

    /// Chain validation against the configured roots, falling back to a lone
    /// self-signed leaf when allowed.
    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
                if self.allow_self_signed && intermediates.is_empty() =>
            {
                self.verify_self_signed(end_entity, server_name, ocsp_response, now)
            }
            result => result,
        }
    }

    fn verify_self_signed(
        &self,
        end_entity: &CertificateDer<'_>,
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut roots = RootCertStore::empty();
        roots.add(end_entity.clone().into_owned())?;
        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), self.provider.clone())
                .build()
                .map_err(|e| rustls::Error::General(e.to_string()))?;

        verifier
            .verify_server_cert(end_entity, &[], server_name, ocsp_response, now)
            .inspect(|_| tracing::debug!(server = ?server_name, "accepted self-signed certificate"))
    }
}

impl ServerCertVerifier for RelaxedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut at = now;
        let mut expired = 0;
        loop {
            match self.verify_chain(end_entity, intermediates, server_name, ocsp_response, at) {
                Err(rustls::Error::InvalidCertificate(CertificateError::ExpiredContext {
                    not_after,
                    ..
                })) if self.ignore_expired && expired < MAX_EXPIRED_IN_CHAIN => {
                    expired += 1;
                    at = UnixTime::since_unix_epoch(Duration::from_secs(
                        not_after.as_secs().saturating_sub(1),
                    ));
                }
                result => {
                    let result = result.or_else(|err| self.tolerate(err, server_name));
                    if expired > 0 && result.is_ok() {
                        tracing::warn!(
                            server = ?server_name,
                            valid_until = at.as_secs(),
                            "accepting expired server certificate"
                        );
                    }
                    return result;
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
