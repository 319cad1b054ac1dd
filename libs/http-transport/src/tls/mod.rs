//! TLS client configuration.
//!
//! [`TlsContext::build`] turns a [`TlsConfig`] into a rustls `ClientConfig`
//! once per session. Trust anchors come from the truststore when one is
//! configured, otherwise from the Mozilla bundle or the OS store.

mod store;
mod verifier;

use std::sync::{Arc, OnceLock};

use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use rustls_pki_types::CertificateDer;

pub use store::{
    CertificateSummary, ClientIdentity, describe, fingerprint, load_keystore, load_truststore,
};
pub use verifier::RelaxedServerVerifier;

use crate::config::{TlsConfig, TlsProtocol, TlsRootConfig};
use crate::error::ConfigError;

static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }
    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }
    result.certs
}

/// OS root certificates, loaded once per process.
#[must_use]
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// The globally installed crypto provider, or aws-lc-rs if none is installed.
///
/// Never installs a provider globally.
#[must_use]
pub fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Builder for the session's shared TLS client configuration.
pub struct TlsContext;

impl TlsContext {
    /// Build the client configuration described by `tls`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unreadable or malformed stores, an unknown
    /// protocol name, an empty native root store, or a key rustls refuses.
    pub fn build(tls: &TlsConfig) -> Result<Arc<ClientConfig>, ConfigError> {
        let provider = get_crypto_provider();

        let versions: &[&'static SupportedProtocolVersion] = match tls.protocol()? {
            Some(TlsProtocol::Tls12) => &[&rustls::version::TLS12],
            Some(TlsProtocol::Tls13) => &[&rustls::version::TLS13],
            None => rustls::DEFAULT_VERSIONS,
        };

        let roots = Arc::new(root_store(tls)?);
        let builder =
            ClientConfig::builder_with_provider(provider.clone()).with_protocol_versions(versions)?;

        let relaxed = tls.allow_self_signed_certificates || !tls.verify_hostname;
        let builder = if relaxed {
            if !tls.verify_hostname {
                tracing::warn!("TLS hostname verification is disabled");
            }
            let inner = WebPkiServerVerifier::builder_with_provider(roots, provider.clone())
                .build()
                .map_err(|e| ConfigError::Invalid(format!("cannot build certificate verifier: {e}")))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(RelaxedServerVerifier::new(
                    inner,
                    provider,
                    tls.verify_hostname,
                    tls.allow_self_signed_certificates,
                    tls.ignore_certificate_expired_exception,
                )))
        } else {
            builder.with_root_certificates(roots)
        };

        let config = match &tls.keystore {
            Some(keystore) => {
                let identity = load_keystore(keystore)?;
                builder.with_client_auth_cert(identity.chain, identity.key)?
            }
            None => builder.with_no_client_auth(),
        };

        tracing::debug!(
            allow_self_signed = tls.allow_self_signed_certificates,
            verify_hostname = tls.verify_hostname,
            ignore_expired = tls.ignore_certificate_expired_exception,
            protocol = tls.protocol.as_deref().unwrap_or("default"),
            client_auth = tls.keystore.is_some(),
            "built TLS client configuration"
        );
        Ok(Arc::new(config))
    }
}

fn root_store(tls: &TlsConfig) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();

    if let Some(truststore) = &tls.truststore {
        let certs = load_truststore(truststore)?;
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(ConfigError::StoreMalformed {
                store: "truststore",
                url: truststore.url.clone().unwrap_or_default(),
                reason: format!("none of {ignored} certificates is a usable trust anchor"),
            });
        }
        return Ok(roots);
    }

    match tls.tls_roots {
        TlsRootConfig::WebPki => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        TlsRootConfig::Native => {
            let certs = native_root_certs();
            let (added, ignored) = roots.add_parsable_certificates(certs.iter().cloned());
            if ignored > 0 {
                tracing::warn!(added, ignored, "some native root certificates could not be parsed");
            }
            if added == 0 {
                return Err(ConfigError::Invalid(
                    "no valid native root CA certificates found in OS certificate store".to_owned(),
                ));
            }
        }
    }
    Ok(roots)
}
