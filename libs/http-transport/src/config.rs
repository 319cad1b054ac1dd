use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::secret::SecretString;

/// Environment prefix for [`SenderConfig::load`] overrides, e.g.
/// `HTTP_SENDER_TIMEOUT_MS=2000` or `HTTP_SENDER_PROXY__HOST=proxy.local`.
pub const ENV_PREFIX: &str = "HTTP_SENDER_";

/// Conditions that trigger a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RetryTrigger {
    /// Transport-level errors (connection refused, reset, closed before response)
    TransportError,
    /// Request timeout
    Timeout,
    /// Specific HTTP status code
    Status(u16),
    /// Error that is never retryable (auth, TLS, invalid request)
    NonRetryable,
}

/// Check if HTTP method is idempotent per RFC 9110.
#[must_use]
pub fn is_idempotent_method(method: &http::Method) -> bool {
    matches!(
        *method,
        http::Method::GET
            | http::Method::HEAD
            | http::Method::PUT
            | http::Method::DELETE
            | http::Method::OPTIONS
            | http::Method::TRACE
    )
}

/// Exponential backoff between retry attempts.
///
/// Delay is `min(initial * multiplier^attempt, max)` plus optional 0-25% jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// 1ms initial, 100ms max, no jitter.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Retry eligibility and budget.
///
/// - `always_retry`: triggers retried for any method
/// - `idempotent_retry`: triggers retried only for idempotent methods
///
/// Independent of both sets, a request whose body is not repeatable is never
/// retried.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt; total attempts = 1 + `max_retries`
    pub max_retries: usize,
    pub backoff: ExponentialBackoff,
    pub always_retry: HashSet<RetryTrigger>,
    pub idempotent_retry: HashSet<RetryTrigger>,
    /// Ignore `Retry-After` on status-triggered retries
    pub ignore_retry_after: bool,
    /// Bytes drained from a discarded response before retrying, for connection reuse
    pub retry_response_drain_limit: usize,
}

/// Default drain limit for response bodies before retry (64 KiB)
pub const DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT: usize = 64 * 1024;

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: ExponentialBackoff::default(),
            always_retry: HashSet::from([RetryTrigger::TransportError]),
            idempotent_retry: HashSet::new(),
            ignore_retry_after: false,
            retry_response_drain_limit: DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether `trigger` may be retried for `method`.
    #[must_use]
    pub fn should_retry(&self, trigger: RetryTrigger, method: &http::Method) -> bool {
        if trigger == RetryTrigger::NonRetryable {
            return false;
        }
        self.always_retry.contains(&trigger)
            || (self.idempotent_retry.contains(&trigger) && is_idempotent_method(method))
    }
}

/// Trust anchors used when no truststore is configured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// OS native root certificate store
    Native,
}

/// On-disk encoding of a keystore or truststore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeystoreType {
    /// PEM bundle; keystores hold a certificate chain plus one private key
    #[default]
    Pem,
    /// Single DER certificate; keystores pair it with `<url>.key` (PKCS#8 DER)
    Der,
    /// PKCS#12 archive opened with `password`; `alias` picks the entry
    Pkcs12,
}

/// Keystore/truststore descriptor. `url` is a filesystem path or `file:` URL.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub store_type: KeystoreType,
    /// Archive password; PKCS#12 only
    pub password: Option<SecretString>,
    /// Entry to use; the first private key or certificates when unset
    pub alias: Option<String>,
}

impl StoreConfig {
    #[must_use]
    pub fn pem(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn pkcs12(url: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            store_type: KeystoreType::Pkcs12,
            password: Some(SecretString::new(password)),
            alias: None,
        }
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// TLS material and verification relaxations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct TlsConfig {
    pub keystore: Option<StoreConfig>,
    pub truststore: Option<StoreConfig>,
    pub allow_self_signed_certificates: bool,
    pub verify_hostname: bool,
    /// Only effective together with `allow_self_signed_certificates`
    pub ignore_certificate_expired_exception: bool,
    /// `TLSv1.2` or `TLSv1.3`; both are enabled when unset
    pub protocol: Option<String>,
    pub tls_roots: TlsRootConfig,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            keystore: None,
            truststore: None,
            allow_self_signed_certificates: false,
            verify_hostname: true,
            ignore_certificate_expired_exception: false,
            protocol: None,
            tls_roots: TlsRootConfig::default(),
        }
    }
}

impl TlsConfig {
    /// Parsed protocol restriction, `None` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProtocol`] for anything but `TLSv1.2`/`TLSv1.3`.
    pub fn protocol(&self) -> Result<Option<TlsProtocol>, ConfigError> {
        self.protocol
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(TlsProtocol::parse)
            .transpose()
    }
}

/// Pinned TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocol {
    Tls12,
    Tls13,
}

impl TlsProtocol {
    /// Accepts `TLSv1.2`/`TLSv1.3` (case-insensitive, `TLS1.x` also allowed).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProtocol`] for any other name.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(Self::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(Self::Tls13),
            _ => Err(ConfigError::UnknownProtocol(name.to_owned())),
        }
    }
}

/// Target-host authentication settings (Basic or `OAuth2`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub auth_alias: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Prefixed to the principal as `DOMAIN\user`
    pub auth_domain: Option<String>,

    pub token_endpoint: Option<String>,
    pub scope: Option<String>,
    pub client_auth_alias: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    /// Seconds after which the token is refreshed; negative means "derive
    /// from `expires_in`"
    pub token_expiry_secs: i64,
    /// Send client credentials to the token endpoint as HTTP Basic
    pub authenticated_token_request: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_alias: None,
            username: None,
            password: None,
            auth_domain: None,
            token_endpoint: None,
            scope: None,
            client_auth_alias: None,
            client_id: None,
            client_secret: None,
            token_expiry_secs: -1,
            authenticated_token_request: false,
        }
    }
}

/// Forward proxy settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub auth_alias: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Realm the credentials are scoped to, informational for logging
    pub realm: Option<String>,
    /// Seed the auth cache so credentials go out before the first 407
    pub prefill_proxy_auth_cache: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 80,
            auth_alias: None,
            username: None,
            password: None,
            realm: None,
            prefill_proxy_auth_cache: false,
        }
    }
}

/// Everything the pooled client needs: timeouts, pool, retry, redirects,
/// cookies, TLS, authentication, proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct SessionConfig {
    /// Per-attempt timeout covering connection acquisition, connect, TLS and
    /// the response head. Also bounds the silence between two body reads.
    /// `0` disables it.
    pub timeout_ms: u64,
    /// Total and per-route connection cap; must be at least 1
    pub max_connections: i64,
    pub max_execute_retries: usize,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,

    pub stale_checking: bool,
    pub stale_timeout_ms: u64,
    /// Non-positive means unbounded connection lifetime
    pub connection_time_to_live_secs: i64,
    pub connection_idle_timeout_secs: u64,

    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub disable_cookies: bool,

    /// Requests that may queue in front of the shared client
    pub buffer_capacity: usize,

    pub tls: TlsConfig,
    pub auth: AuthConfig,
    pub proxy: Option<ProxyConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_connections: 10,
            max_execute_retries: 1,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 2_000,
            stale_checking: true,
            stale_timeout_ms: 5_000,
            connection_time_to_live_secs: 900,
            connection_idle_timeout_secs: 10,
            follow_redirects: true,
            max_redirects: 10,
            disable_cookies: false,
            buffer_capacity: 1024,
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            proxy: None,
        }
    }
}

impl SessionConfig {
    /// `None` when `timeout_ms` is 0.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_execute_retries,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(self.retry_backoff_ms),
                Duration::from_millis(self.retry_backoff_max_ms.max(self.retry_backoff_ms)),
            ),
            ..RetryConfig::default()
        }
    }
}

/// HTTP method of a sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    #[must_use]
    pub fn as_method(self) -> http::Method {
        match self {
            Self::Get => http::Method::GET,
            Self::Post => http::Method::POST,
            Self::Put => http::Method::PUT,
            Self::Patch => http::Method::PATCH,
            Self::Delete => http::Method::DELETE,
            Self::Head => http::Method::HEAD,
        }
    }

    /// Methods whose request carries the message as entity.
    #[must_use]
    pub fn has_entity(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

/// How the message and parameters are encoded into the request entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    /// Message text as body
    #[default]
    Raw,
    /// Message bytes as body
    Binary,
    /// Parameters as `application/x-www-form-urlencoded`
    Urlencoded,
    /// `multipart/form-data`
    Formdata,
    /// `multipart/related` with an XOP root part
    Mtom,
}

impl PostType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Binary => "binary",
            Self::Urlencoded => "urlencoded",
            Self::Formdata => "formdata",
            Self::Mtom => "mtom",
        }
    }
}

/// Sender configuration: target, encoding, result handling, plus the
/// embedded [`SessionConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub url: Option<String>,
    /// Context parameter that overrides `url` per message
    pub url_param: Option<String>,
    pub method: HttpMethod,
    pub content_type: Option<String>,
    pub charset: String,
    pub post_type: PostType,
    /// Send parameters in the query string; `false` is POST-only
    pub params_in_url: bool,
    /// Name of the multipart part (or form field) carrying the message; POST-only
    pub first_body_part_name: Option<String>,
    /// Context parameters sent as request headers instead of parameters
    pub header_params: Vec<String>,
    /// Parameters left out when their value is empty; `*` means all
    pub params_to_skip_when_empty: Vec<String>,
    /// When set, every status counts as delivered and the code is stored in
    /// the context under this key
    pub result_status_code_session_key: Option<String>,
    /// Treat 301/302/307 as success instead of failure
    pub ignore_redirects: bool,
    pub message_id_header: Option<String>,
    pub correlation_id_header: Option<String>,
    #[serde(flatten)]
    pub session: SessionConfig,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            url: None,
            url_param: None,
            method: HttpMethod::default(),
            content_type: None,
            charset: "UTF-8".to_owned(),
            post_type: PostType::default(),
            params_in_url: true,
            first_body_part_name: None,
            header_params: Vec::new(),
            params_to_skip_when_empty: Vec::new(),
            result_status_code_session_key: None,
            ignore_redirects: false,
            message_id_header: Some("Message-Id".to_owned()),
            correlation_id_header: Some("Correlation-Id".to_owned()),
            session: SessionConfig::default(),
        }
    }
}

impl SenderConfig {
    /// Extract from an arbitrary figment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the figment cannot be deserialized.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Load a YAML file with `HTTP_SENDER_*` environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the merged document is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    /// Check option combinations that cannot work together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when neither `url` nor `url_param` is
    /// set, or when a POST-only option is combined with another method.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let blank = |v: Option<&str>| v.is_none_or(|s| s.trim().is_empty());

        if blank(self.url.as_deref()) && blank(self.url_param.as_deref()) {
            return Err(ConfigError::Invalid(
                "url must be specified, either as url or as url_param".to_owned(),
            ));
        }
        if self.method != HttpMethod::Post {
            if !self.params_in_url {
                return Err(ConfigError::Invalid(
                    "params_in_url can only be set to false for method POST".to_owned(),
                ));
            }
            if !blank(self.first_body_part_name.as_deref()) {
                return Err(ConfigError::Invalid(
                    "first_body_part_name can only be set for method POST".to_owned(),
                ));
            }
            if matches!(
                self.post_type,
                PostType::Urlencoded | PostType::Formdata | PostType::Mtom
            ) {
                return Err(ConfigError::Invalid(format!(
                    "post_type [{}] can only be used with method POST",
                    self.post_type.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Post type after applying `params_in_url=false`, which moves raw and
    /// binary requests to url-encoded form bodies.
    #[must_use]
    pub fn effective_post_type(&self) -> PostType {
        match self.post_type {
            PostType::Raw | PostType::Binary if !self.params_in_url => PostType::Urlencoded,
            other => other,
        }
    }

    /// Whether the parameter `name` is dropped when its value is empty.
    #[must_use]
    pub fn skips_when_empty(&self, name: &str) -> bool {
        self.params_to_skip_when_empty
            .iter()
            .any(|p| p == "*" || p == name)
    }
}
