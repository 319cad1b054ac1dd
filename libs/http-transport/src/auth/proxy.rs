use std::sync::atomic::{AtomicBool, Ordering};

use http::HeaderValue;

use super::basic::basic_header_value;
use crate::config::ProxyConfig;
use crate::credentials::CredentialResolver;
use crate::error::ConfigError;

/// Forward proxy route plus its Basic credentials and auth cache.
///
/// The cache is a single "challenged" flag per session: once the proxy has
/// asked for credentials (or the cache was seeded up front), every later
/// request and tunnel carries `Proxy-Authorization` without waiting for
/// another 407.
#[derive(Debug)]
pub struct ProxyAuthenticator {
    host: String,
    port: u16,
    realm: Option<String>,
    header: Option<HeaderValue>,
    challenged: AtomicBool,
}

impl ProxyAuthenticator {
    /// Resolve proxy credentials independently of target-host auth.
    ///
    /// Returns `Ok(None)` when no proxy host is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the credentials cannot form a header.
    pub fn configure(
        config: &ProxyConfig,
        resolver: &CredentialResolver,
    ) -> Result<Option<Self>, ConfigError> {
        let host = config.host.trim();
        if host.is_empty() {
            return Ok(None);
        }

        let credentials = resolver.resolve(
            config.auth_alias.as_deref(),
            config.username.as_deref(),
            config.password.as_ref(),
        );
        let header = basic_header_value(&credentials)
            .map_err(|e| ConfigError::Invalid(format!("invalid proxy credentials: {e}")))?;

        let preemptive = header.is_some() && config.prefill_proxy_auth_cache;
        tracing::info!(
            proxy_host = host,
            proxy_port = config.port,
            realm = config.realm.as_deref().unwrap_or_default(),
            has_credentials = header.is_some(),
            preemptive,
            "configured forward proxy"
        );

        Ok(Some(Self {
            host: host.to_owned(),
            port: config.port,
            realm: config.realm.clone(),
            header,
            challenged: AtomicBool::new(preemptive),
        }))
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.header.is_some()
    }

    /// Credentials to attach right now, if the cache holds them.
    #[must_use]
    pub fn cached_header(&self) -> Option<HeaderValue> {
        if self.challenged.load(Ordering::Acquire) {
            self.header.clone()
        } else {
            None
        }
    }

    /// Record a 407 answer.
    ///
    /// Returns `true` when the request should be sent again with credentials:
    /// credentials exist and were not part of the rejected attempt.
    #[must_use]
    pub fn on_challenge(&self, sent_credentials: bool) -> bool {
        if self.header.is_none() || sent_credentials {
            return false;
        }
        self.challenged.store(true, Ordering::Release);
        tracing::debug!(proxy_host = %self.host, "proxy requested authentication, caching credentials");
        true
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::secret::SecretString;

    fn proxy(prefill: bool, with_credentials: bool) -> ProxyAuthenticator {
        let config = ProxyConfig {
            host: "proxy.local".into(),
            port: 3128,
            username: with_credentials.then(|| "pu".to_owned()),
            password: with_credentials.then(|| SecretString::new("pp")),
            prefill_proxy_auth_cache: prefill,
            ..Default::default()
        };
        ProxyAuthenticator::configure(&config, &CredentialResolver::default())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn blank_host_means_no_proxy() {
        let config = ProxyConfig::default();
        assert!(
            ProxyAuthenticator::configure(&config, &CredentialResolver::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn preemptive_mode_seeds_cache() {
        let p = proxy(true, true);
        assert!(p.cached_header().is_some());
    }

    #[test]
    fn credentials_sent_only_after_challenge() {
        let p = proxy(false, true);
        assert!(p.cached_header().is_none());
        assert!(p.on_challenge(false));
        assert!(p.cached_header().unwrap().is_sensitive());
        // Already sent and rejected again: give up.
        assert!(!p.on_challenge(true));
    }

    #[test]
    fn challenge_without_credentials_is_final() {
        let p = proxy(false, false);
        assert!(!p.on_challenge(false));
        assert!(p.cached_header().is_none());
        assert!(!p.has_credentials());
    }
}
