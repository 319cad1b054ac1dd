use std::time::Duration;
use thiserror::Error;

/// Boxed error used for foreign sources (hyper, rustls, io).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// No URL was provided (empty or whitespace only)
    Blank,
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is relative (no scheme)
    MissingScheme,
}

/// Setup-time failures.
///
/// Raised once while building a session or sender; never produced per request
/// and never retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// A keystore or truststore was configured without a location
    #[error("{store} is configured but no url was provided")]
    MissingStoreUrl { store: &'static str },

    /// A keystore or truststore could not be read
    #[error("cannot read {store} from [{url}]: {source}")]
    StoreUnreadable {
        store: &'static str,
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// A keystore or truststore was read but its content is unusable
    #[error("{store} at [{url}] is malformed: {reason}")]
    StoreMalformed {
        store: &'static str,
        url: String,
        reason: String,
    },

    /// rustls rejected the assembled TLS configuration
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    /// Unsupported TLS protocol name
    #[error("unknown protocol [{0}], must be one of [TLSv1.2, TLSv1.3]")]
    UnknownProtocol(String),

    /// Pool size below the minimum
    #[error("maxConnections is set to [{0}], which is not enough for adequate operation")]
    InvalidMaxConnections(i64),

    /// `OAuth2` token endpoint configured without client credentials
    #[error(
        "to obtain an access token at token endpoint [{endpoint}] a client auth alias or client id and client secret must be specified"
    )]
    MissingClientCredentials { endpoint: String },

    /// Invalid target, token endpoint, or proxy URL
    #[error("invalid url: {0}")]
    InvalidUrl(#[source] HttpError),

    /// Option combination that cannot work together
    #[error("{0}")]
    Invalid(String),

    /// Configuration document could not be extracted
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Authentication failures, kept apart from transport errors so callers can
/// branch on them.
///
/// Variants never carry secret values (client secret, passwords, tokens).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuthError {
    /// Transport or status failure talking to the token endpoint
    #[error("OAuth2 token request failed: {0}")]
    TokenRequest(String),

    /// The token endpoint answered with an unusable body
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// The token endpoint returned a `token_type` other than `Bearer`
    #[error("unsupported token type: {0}")]
    UnsupportedTokenType(String),

    /// The target host still rejected the request after a fresh token
    #[error("target host rejected credentials with HTTP {0}")]
    Rejected(http::StatusCode),

    /// The proxy rejected the configured credentials
    #[error("proxy authentication failed: {0}")]
    ProxyRejected(String),
}

/// Per-request failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// The request exceeded the configured timeout and was aborted
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The host name did not resolve or the port refused the connection
    #[error("Connection failed: {0}")]
    Connect(#[source] BoxError),

    /// Transport error (reset, dropped connection, proxy tunnel)
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// TLS handshake or certificate failure
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Authentication failure (token endpoint, rejected credentials)
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Non-success status where the caller asked for one
    #[error("HTTP {status}: {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
    },

    /// JSON parsing error
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Form URL encoding error
    #[error("Form encoding failed: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),

    /// Reading the response stream failed
    #[error("Failed to read response body: {0}")]
    Body(#[source] BoxError),

    /// Internal service failure (buffer worker died, channel closed)
    #[error("Service unavailable: internal failure")]
    ServiceClosed,

    /// Invalid URL
    ///
    /// Match on `kind`; `reason` is diagnostic text only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },

    /// Scheme other than http/https
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme { scheme: String, reason: String },
}

impl HttpError {
    /// True when the request was aborted by the timeout watchdog.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// True for connection-level failures, timeouts included.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Transport(_) | Self::Tls(_) | Self::Timeout(_)
        )
    }

    /// True for authentication failures.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Short variant name, used when an error is folded into a result text.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestBuild(_) => "RequestBuild",
            Self::InvalidHeaderName(_) => "InvalidHeaderName",
            Self::InvalidHeaderValue(_) => "InvalidHeaderValue",
            Self::Timeout(_) => "Timeout",
            Self::Connect(_) => "Connect",
            Self::Transport(_) => "Transport",
            Self::Tls(_) => "Tls",
            Self::Auth(_) => "Auth",
            Self::HttpStatus { .. } => "HttpStatus",
            Self::Json(_) => "Json",
            Self::FormEncode(_) => "FormEncode",
            Self::Body(_) => "Body",
            Self::ServiceClosed => "ServiceClosed",
            Self::InvalidUri { .. } => "InvalidUri",
            Self::InvalidScheme { .. } => "InvalidScheme",
        }
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        classify_transport(Box::new(err))
    }
}

/// Sorts a boxed transport failure into `Timeout`, `Tls`, proxy `Auth`,
/// `Connect`, or `Transport`.
///
/// Walks the source chain, looking inside `io::Error` wrappers too:
/// hyper-rustls reports handshake failures as an `io::Error` carrying the
/// rustls error, and `io::Error::source` skips that payload.
#[must_use]
pub fn classify_transport(err: BoxError) -> HttpError {
    enum Class {
        Timeout(Duration),
        Tls,
        Proxy(String),
        Connect,
    }

    let found = source_chain(err.as_ref()).find_map(|candidate| {
        if let Some(timeout) = candidate.downcast_ref::<BodyReadTimeout>() {
            Some(Class::Timeout(timeout.0))
        } else if candidate.is::<rustls::Error>() {
            Some(Class::Tls)
        } else if let Some(auth) = candidate.downcast_ref::<ProxyAuthFailure>() {
            Some(Class::Proxy(auth.0.clone()))
        } else if candidate.is::<ConnectFailure>() {
            Some(Class::Connect)
        } else {
            None
        }
    });

    match found {
        Some(Class::Timeout(timeout)) => HttpError::Timeout(timeout),
        Some(Class::Tls) => HttpError::Tls(err),
        Some(Class::Proxy(status_line)) => HttpError::Auth(AuthError::ProxyRejected(status_line)),
        Some(Class::Connect) => HttpError::Connect(err),
        None => HttpError::Transport(err),
    }
}

/// Every error in the chain of `err`, including `io::Error` payloads.
pub fn source_chain<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> impl Iterator<Item = &'a (dyn std::error::Error + 'static)> {
    let mut pending = vec![err];
    std::iter::from_fn(move || {
        let e = pending.pop()?;
        let payload = e
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::get_ref)
            .map(|inner| inner as &(dyn std::error::Error + 'static));
        match payload {
            Some(inner) => pending.push(inner),
            None => pending.extend(e.source()),
        }
        Some(e)
    })
}

/// Marker error raised by the proxy tunnel when the proxy keeps answering 407.
#[derive(Error, Debug)]
#[error("proxy requires authentication: {0}")]
pub struct ProxyAuthFailure(pub String);

/// Marker error raised by the connector when the target cannot be reached
/// at all. Neither case is retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectFailure {
    #[error("unknown host {host}")]
    UnknownHost {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {authority} refused")]
    Refused {
        authority: String,
        #[source]
        source: std::io::Error,
    },
}

/// Marker error raised when a response body stays silent longer than the
/// request timeout.
#[derive(Error, Debug)]
#[error("no response data received for {0:?}")]
pub struct BodyReadTimeout(pub Duration);

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    #[test]
    fn transport_error_preserves_source() {
        let err = HttpError::Transport(Box::new(TestError("connection refused")));
        let source = err.source().unwrap();
        assert_eq!(
            source.downcast_ref::<TestError>().unwrap().0,
            "connection refused"
        );
    }

    #[test]
    fn timeout_is_distinct_from_transport_failure() {
        let timeout = HttpError::Timeout(Duration::from_secs(1));
        let transport = HttpError::Transport(Box::new(TestError("reset")));

        assert!(timeout.is_timeout());
        assert!(timeout.is_transport());
        assert!(!transport.is_timeout());
        assert!(transport.is_transport());
    }

    #[test]
    fn classify_finds_rustls_error_in_chain() {
        let io = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(matches!(classify_transport(Box::new(io)), HttpError::Tls(_)));
    }

    #[test]
    fn classify_maps_proxy_auth_failure() {
        let io = std::io::Error::other(ProxyAuthFailure("HTTP/1.1 407".into()));
        let err = classify_transport(Box::new(io));
        assert!(err.is_auth());
    }

    #[test]
    fn classify_defaults_to_transport() {
        let err = classify_transport(Box::new(TestError("dns")));
        assert!(matches!(err, HttpError::Transport(_)));
    }

    #[test]
    fn config_error_messages() {
        assert_eq!(
            ConfigError::InvalidMaxConnections(0).to_string(),
            "maxConnections is set to [0], which is not enough for adequate operation"
        );
        assert_eq!(
            ConfigError::MissingStoreUrl { store: "truststore" }.to_string(),
            "truststore is configured but no url was provided"
        );
    }

    #[test]
    fn classify_maps_connect_failures() {
        let refused = ConnectFailure::Refused {
            authority: "127.0.0.1:1".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        let err = classify_transport(Box::new(refused));
        assert!(matches!(err, HttpError::Connect(_)));
        assert!(err.is_transport());
        assert_eq!(err.kind(), "Connect");

        let unknown = std::io::Error::other(ConnectFailure::UnknownHost {
            host: "nowhere.invalid".into(),
            source: std::io::Error::other("lookup failed"),
        });
        assert!(matches!(classify_transport(Box::new(unknown)), HttpError::Connect(_)));
    }

    #[test]
    fn classify_maps_body_read_timeout() {
        let io = std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            BodyReadTimeout(Duration::from_millis(300)),
        );
        let err = classify_transport(Box::new(io));
        assert!(matches!(err, HttpError::Timeout(d) if d == Duration::from_millis(300)));
    }
}
