//! Target-host and proxy authentication.
//!
//! The scheme is chosen once per session by [`AuthStrategy::configure`]:
//! `OAuth2` when a token endpoint is configured, otherwise Basic when a
//! principal resolves, otherwise none. [`AuthLayer`] applies it per request.

mod basic;
mod layer;
pub mod oauth;
mod proxy;

use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;

pub use basic::basic_header_value;
pub use layer::{AuthLayer, AuthService};
pub use proxy::ProxyAuthenticator;

use crate::config::AuthConfig;
use crate::credentials::CredentialResolver;
use crate::endpoint::Endpoint;
use crate::error::ConfigError;
use crate::session::TransportService;
use oauth::{TokenEndpointClient, TokenManager};

/// Authentication scheme in use for the target host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    None,
    Basic,
    OAuth2,
}

/// Per-session target-host authentication.
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    None,
    /// Pre-emptive: the header goes out on the first request
    Basic(HeaderValue),
    OAuth2(Arc<TokenManager>),
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl AuthStrategy {
    /// Pick and prepare the scheme for `config`.
    ///
    /// `transport` carries token requests; it should be the session's
    /// unauthenticated client.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingClientCredentials`] for a token endpoint
    /// without client alias or id, [`ConfigError::InvalidUrl`] for a bad
    /// token endpoint, and [`ConfigError::Invalid`] for credentials that
    /// cannot form a header.
    pub fn configure(
        config: &AuthConfig,
        resolver: &CredentialResolver,
        transport: &TransportService,
    ) -> Result<Self, ConfigError> {
        let client_alias = non_blank(config.client_auth_alias.as_deref());
        let client_id = non_blank(config.client_id.as_deref());

        if let Some(token_endpoint) = non_blank(config.token_endpoint.as_deref()) {
            if client_alias.is_none() && client_id.is_none() {
                return Err(ConfigError::MissingClientCredentials {
                    endpoint: token_endpoint.to_owned(),
                });
            }
            let endpoint = Endpoint::parse(token_endpoint).map_err(ConfigError::InvalidUrl)?;
            let client = resolver.resolve(client_alias, client_id, config.client_secret.as_ref());
            let user = resolver.resolve(
                non_blank(config.auth_alias.as_deref()),
                non_blank(config.username.as_deref()),
                config.password.as_ref(),
            );

            let source = TokenEndpointClient::new(
                transport.clone(),
                endpoint,
                client,
                user,
                config.scope.clone(),
                config.authenticated_token_request,
            );
            let token_expiry = u64::try_from(config.token_expiry_secs)
                .ok()
                .map(Duration::from_secs);

            tracing::info!(
                token_endpoint,
                grant = source.grant().as_str(),
                authenticated_token_request = config.authenticated_token_request,
                token_expiry_secs = config.token_expiry_secs,
                "configured OAuth2 authentication"
            );
            return Ok(Self::OAuth2(Arc::new(TokenManager::new(
                Arc::new(source),
                token_expiry,
            ))));
        }

        let auth_alias = non_blank(config.auth_alias.as_deref());
        let username = non_blank(config.username.as_deref());
        let credentials = if auth_alias.is_none() && username.is_none() {
            resolver.resolve(client_alias, client_id, config.client_secret.as_ref())
        } else {
            resolver.resolve(auth_alias, username, config.password.as_ref())
        }
        .with_domain(non_blank(config.auth_domain.as_deref()));

        let header = basic_header_value(&credentials)
            .map_err(|e| ConfigError::Invalid(format!("invalid credentials: {e}")))?;
        Ok(match header {
            Some(header) => {
                tracing::info!(
                    username = credentials.username().unwrap_or_default(),
                    "configured pre-emptive Basic authentication"
                );
                Self::Basic(header)
            }
            None => Self::None,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> AuthScheme {
        match self {
            Self::None => AuthScheme::None,
            Self::Basic(_) => AuthScheme::Basic,
            Self::OAuth2(_) => AuthScheme::OAuth2,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::credentials::CredentialRegistry;
    use crate::secret::SecretString;
    use crate::session::transport_for_tests;

    fn configure(config: &AuthConfig) -> Result<AuthStrategy, ConfigError> {
        AuthStrategy::configure(config, &CredentialResolver::default(), &transport_for_tests())
    }

    fn basic_value(strategy: &AuthStrategy) -> String {
        match strategy {
            AuthStrategy::Basic(v) => v.to_str().unwrap().to_owned(),
            other => panic!("expected Basic, got {:?}", other.scheme()),
        }
    }

    #[test]
    fn no_credentials_means_no_auth() {
        assert_eq!(configure(&AuthConfig::default()).unwrap().scheme(), AuthScheme::None);
    }

    #[test]
    fn username_selects_basic() {
        let config = AuthConfig {
            username: Some("Aladdin".into()),
            password: Some(SecretString::new("open sesame")),
            ..Default::default()
        };
        assert_eq!(
            basic_value(&configure(&config).unwrap()),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn domain_prefixes_principal() {
        let config = AuthConfig {
            username: Some("bob".into()),
            password: Some(SecretString::new("pw")),
            auth_domain: Some("CORP".into()),
            ..Default::default()
        };
        // base64("CORP\bob:pw")
        assert_eq!(basic_value(&configure(&config).unwrap()), "Basic Q09SUFxib2I6cHc=");
    }

    #[test]
    fn client_credentials_fall_back_to_basic() {
        let config = AuthConfig {
            client_id: Some("cid".into()),
            client_secret: Some(SecretString::new("cs")),
            ..Default::default()
        };
        // base64("cid:cs")
        assert_eq!(basic_value(&configure(&config).unwrap()), "Basic Y2lkOmNz");
    }

    #[test]
    fn alias_resolves_through_store() {
        let registry = Arc::new(CredentialRegistry::new());
        registry.insert("svc", Some("stored"), Some(SecretString::new("pw")));
        let resolver = CredentialResolver::new(Some(registry));
        let config = AuthConfig {
            auth_alias: Some("svc".into()),
            ..Default::default()
        };
        let strategy = AuthStrategy::configure(&config, &resolver, &transport_for_tests()).unwrap();
        // base64("stored:pw")
        assert_eq!(basic_value(&strategy), "Basic c3RvcmVkOnB3");
    }

    #[test]
    fn token_endpoint_selects_oauth() {
        let config = AuthConfig {
            token_endpoint: Some("https://idp.example.test/token".into()),
            client_id: Some("cid".into()),
            client_secret: Some(SecretString::new("cs")),
            ..Default::default()
        };
        assert_eq!(configure(&config).unwrap().scheme(), AuthScheme::OAuth2);
    }

    #[test]
    fn token_endpoint_without_client_is_config_error() {
        let config = AuthConfig {
            token_endpoint: Some("https://idp.example.test/token".into()),
            username: Some("alice".into()),
            ..Default::default()
        };
        assert!(matches!(
            configure(&config),
            Err(ConfigError::MissingClientCredentials { endpoint }) if endpoint == "https://idp.example.test/token"
        ));
    }

    #[test]
    fn malformed_token_endpoint_is_config_error() {
        let config = AuthConfig {
            token_endpoint: Some("not a url".into()),
            client_id: Some("cid".into()),
            ..Default::default()
        };
        assert!(matches!(configure(&config), Err(ConfigError::InvalidUrl(_))));
    }
}
