//! Keystore and truststore loading.

use std::path::PathBuf;

use p12_keystore::{KeyStore, KeyStoreEntry};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};

use crate::config::{KeystoreType, StoreConfig};
use crate::error::ConfigError;
use crate::secret::SecretString;

pub const KEYSTORE: &str = "keystore";
pub const TRUSTSTORE: &str = "truststore";

/// Client identity: certificate chain plus private key.
pub struct ClientIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Load every certificate of a truststore.
///
/// # Errors
///
/// Returns a [`ConfigError`] when the url is missing, the file cannot be read,
/// or it holds no parseable certificate.
pub fn load_truststore(store: &StoreConfig) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let (url, bytes) = read_store(TRUSTSTORE, store)?;
    let certs = if store.store_type == KeystoreType::Pkcs12 {
        let archive = open_pkcs12(TRUSTSTORE, &url, &bytes, store)?;
        pkcs12_certificates(TRUSTSTORE, &url, &archive, store.alias.as_deref())?
    } else {
        parse_certificates(TRUSTSTORE, &url, &bytes, store.store_type)?
    };
    log_certificates(TRUSTSTORE, &url, &certs);
    Ok(certs)
}

/// Load a client certificate chain and its private key.
///
/// PEM keystores carry both in one file. DER keystores hold the certificate
/// and expect a PKCS#8 DER key next to it at `<url>.key`. PKCS#12 keystores
/// use the private key entry named by `alias`, or the first one.
///
/// # Errors
///
/// Returns a [`ConfigError`] when the url is missing, a file cannot be read,
/// the archive password or alias is wrong, or the certificate or key is absent.
pub fn load_keystore(store: &StoreConfig) -> Result<ClientIdentity, ConfigError> {
    let (url, bytes) = read_store(KEYSTORE, store)?;
    let identity = match store.store_type {
        KeystoreType::Pem => ClientIdentity {
            chain: parse_certificates(KEYSTORE, &url, &bytes, store.store_type)?,
            key: PrivateKeyDer::from_pem_slice(&bytes).map_err(|e| {
                ConfigError::StoreMalformed {
                    store: KEYSTORE,
                    url: url.clone(),
                    reason: format!("no usable private key: {e}"),
                }
            })?,
        },
        KeystoreType::Der => {
            let key_bytes = read_path(KEYSTORE, &format!("{url}.key"))?;
            ClientIdentity {
                chain: parse_certificates(KEYSTORE, &url, &bytes, store.store_type)?,
                key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_bytes)),
            }
        }
        KeystoreType::Pkcs12 => {
            let archive = open_pkcs12(KEYSTORE, &url, &bytes, store)?;
            pkcs12_identity(&url, &archive, store.alias.as_deref())?
        }
    };

    log_certificates(KEYSTORE, &url, &identity.chain);
    Ok(identity)
}

/// Hex SHA-256 digest of a DER certificate.
#[must_use]
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

fn read_store(store: &'static str, cfg: &StoreConfig) -> Result<(String, Vec<u8>), ConfigError> {
    let url = cfg
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(ConfigError::MissingStoreUrl { store })?;
    let bytes = read_path(store, url)?;
    Ok((url.to_owned(), bytes))
}

fn read_path(store: &'static str, url: &str) -> Result<Vec<u8>, ConfigError> {
    let path = to_path(url).ok_or_else(|| ConfigError::StoreMalformed {
        store,
        url: url.to_owned(),
        reason: "only filesystem paths and file: urls are supported".to_owned(),
    })?;
    std::fs::read(&path).map_err(|source| ConfigError::StoreUnreadable {
        store,
        url: url.to_owned(),
        source,
    })
}

/// `file:` URLs become paths; anything else with a scheme is rejected.
/// Bare strings are taken as paths.
fn to_path(url: &str) -> Option<PathBuf> {
    match url::Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => parsed.to_file_path().ok(),
        // single-letter "schemes" are Windows drive letters
        Ok(parsed) if parsed.scheme().len() > 1 => None,
        _ => Some(PathBuf::from(url)),
    }
}

fn parse_certificates(
    store: &'static str,
    url: &str,
    bytes: &[u8],
    store_type: KeystoreType,
) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = match store_type {
        KeystoreType::Pem => CertificateDer::pem_slice_iter(bytes)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::StoreMalformed {
                store,
                url: url.to_owned(),
                reason: format!("invalid certificate encoding: {e}"),
            })?,
        KeystoreType::Der => vec![CertificateDer::from(bytes.to_vec())],
        KeystoreType::Pkcs12 => {
            return Err(malformed(store, url, "PKCS#12 archives need a password"));
        }
    };

    if certs.is_empty() {
        return Err(ConfigError::StoreMalformed {
            store,
            url: url.to_owned(),
            reason: "no certificates found".to_owned(),
        });
    }
    Ok(certs)
}

fn malformed(store: &'static str, url: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::StoreMalformed {
        store,
        url: url.to_owned(),
        reason: reason.into(),
    }
}

fn open_pkcs12(
    store: &'static str,
    url: &str,
    bytes: &[u8],
    cfg: &StoreConfig,
) -> Result<KeyStore, ConfigError> {
    let password = cfg.password.as_ref().map_or("", SecretString::expose);
    KeyStore::from_pkcs12(bytes, password)
        .map_err(|e| malformed(store, url, format!("cannot open PKCS#12 archive: {e}")))
}

/// Certificates of one alias, or of the whole archive when no alias is set.
fn pkcs12_certificates(
    store: &'static str,
    url: &str,
    archive: &KeyStore,
    alias: Option<&str>,
) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let entries: Vec<&KeyStoreEntry> = match alias {
        Some(alias) => vec![
            archive
                .entry(alias)
                .ok_or_else(|| malformed(store, url, format!("no entry with alias [{alias}]")))?,
        ],
        None => archive.entries().map(|(_, entry)| entry).collect(),
    };

    let certs: Vec<_> = entries
        .into_iter()
        .flat_map(|entry| match entry {
            KeyStoreEntry::Certificate(cert) => std::slice::from_ref(cert),
            KeyStoreEntry::PrivateKeyChain(chain) => chain.chain(),
        })
        .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
        .collect();
    if certs.is_empty() {
        return Err(malformed(store, url, "no certificates found"));
    }
    Ok(certs)
}

fn pkcs12_identity(
    url: &str,
    archive: &KeyStore,
    alias: Option<&str>,
) -> Result<ClientIdentity, ConfigError> {
    let chain = match alias {
        Some(alias) => match archive.entry(alias) {
            Some(KeyStoreEntry::PrivateKeyChain(chain)) => chain,
            Some(KeyStoreEntry::Certificate(_)) => {
                return Err(malformed(
                    KEYSTORE,
                    url,
                    format!("entry [{alias}] holds no private key"),
                ));
            }
            None => {
                return Err(malformed(KEYSTORE, url, format!("no entry with alias [{alias}]")));
            }
        },
        None => archive
            .entries()
            .find_map(|(_, entry)| match entry {
                KeyStoreEntry::PrivateKeyChain(chain) => Some(chain),
                KeyStoreEntry::Certificate(_) => None,
            })
            .ok_or_else(|| malformed(KEYSTORE, url, "no private key entry"))?,
    };

    let certs: Vec<_> = chain
        .chain()
        .iter()
        .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
        .collect();
    if certs.is_empty() {
        return Err(malformed(KEYSTORE, url, "private key entry has no certificate"));
    }
    Ok(ClientIdentity {
        chain: certs,
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(chain.key().to_vec())),
    })
}

fn log_certificates(store: &'static str, url: &str, certs: &[CertificateDer<'_>]) {
    tracing::info!(store, url, count = certs.len(), "loaded certificates");
    for (index, cert) in certs.iter().enumerate() {
        match describe(cert) {
            Some(summary) => tracing::info!(
                store,
                index,
                subject = %summary.subject,
                issuer = %summary.issuer,
                not_before = %summary.not_before,
                not_after = %summary.not_after,
                sha256 = %fingerprint(cert),
                "certificate"
            ),
            None => tracing::warn!(
                store,
                index,
                sha256 = %fingerprint(cert),
                size = cert.as_ref().len(),
                "certificate could not be parsed as X.509"
            ),
        }
    }
}

/// Printable identity of one certificate.
#[derive(Debug, PartialEq, Eq)]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
}

/// Subject, issuer and validity window of a DER certificate, or `None` when
/// it does not parse.
#[must_use]
pub fn describe(cert: &CertificateDer<'_>) -> Option<CertificateSummary> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let validity = parsed.validity();
    Some(CertificateSummary {
        subject: parsed.subject().to_string(),
        issuer: parsed.issuer().to_string(),
        not_before: validity.not_before.to_string(),
        not_after: validity.not_after.to_string(),
    })
}
