use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rustls::ClientConfig;
use tower::buffer::Buffer;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use tower_http::follow_redirect::FollowRedirectLayer;

use crate::auth::{AuthLayer, AuthScheme, AuthStrategy, ProxyAuthenticator};
use crate::body::RequestBody;
use crate::config::SessionConfig;
use crate::cookies::{CookieJar, CookieLayer};
use crate::credentials::{CredentialResolver, CredentialStore};
use crate::error::{BoxError, ConfigError, HttpError, classify_transport};
use crate::pool::{LeaseLayer, PoolSettings, PoolStats, TransportConnector};
use crate::redirect::RedirectPolicy;
use crate::response::{ResponseBody, ResponseEnvelope};
use crate::retry::RetryLayer;
use crate::tls::TlsContext;

/// Pooled client without target-host authentication or retries.
///
/// Carries TLS, proxy, pool, redirects, cookies, decompression and the
/// per-attempt timeout. Token requests go through this directly.
pub type TransportService =
    BoxCloneSyncService<Request<RequestBody>, Response<ResponseBody>, HttpError>;

type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, HttpError>> + Send>>;

type BufferedService = Buffer<Request<RequestBody>, ServiceFuture>;

/// One configured connection pool plus its TLS, auth, retry, redirect and
/// cookie policies.
///
/// Request flow (outer to inner):
///   Buffer -> Retry -> Auth -> ErrorMapping -> Timeout -> Decompression ->
///   [FollowRedirect] -> [Cookies] -> Lease -> hyper client -> connector
///
/// `Clone + Send + Sync`; clones share the pool, the cookie jar and the
/// `OAuth2` token.
#[derive(Clone)]
pub struct HttpSession {
    service: BufferedService,
    stats: PoolStats,
    auth_scheme: AuthScheme,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("auth_scheme", &self.auth_scheme)
            .field("leased", &self.stats.leased())
            .field("open", &self.stats.open())
            .finish_non_exhaustive()
    }
}

impl HttpSession {
    #[must_use]
    pub fn builder() -> HttpSessionBuilder {
        HttpSessionBuilder::default()
    }

    /// Dispatch `request` and return the raw response.
    ///
    /// Every status is `Ok`; the connection stays leased until the body is
    /// finished or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Timeout`], [`HttpError::Transport`],
    /// [`HttpError::Tls`] or [`HttpError::Auth`] once retries are exhausted.
    pub async fn send(&self, request: Request<RequestBody>) -> Result<Response<ResponseBody>, HttpError> {
        tracing::debug!(method = %request.method(), uri = %request.uri(), "executing request");

        let mut service = self.service.clone();
        service
            .ready()
            .await
            .map_err(map_buffer_error)?
            .call(request)
            .await
            .map_err(map_buffer_error)
    }

    /// Dispatch `request` and wrap the answer in a [`ResponseEnvelope`].
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn execute(&self, request: Request<RequestBody>) -> Result<ResponseEnvelope, HttpError> {
        Ok(ResponseEnvelope::new(self.send(request).await?, None))
    }

    /// Live lease and connection counters of the pool.
    #[must_use]
    pub fn pool_stats(&self) -> &PoolStats {
        &self.stats
    }

    #[must_use]
    pub fn auth_scheme(&self) -> AuthScheme {
        self.auth_scheme
    }
}

/// Builder for [`HttpSession`]; all validation happens in [`build`](Self::build).
#[derive(Default)]
pub struct HttpSessionBuilder {
    config: SessionConfig,
    store: Option<Arc<dyn CredentialStore>>,
}

impl HttpSessionBuilder {
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Store consulted for `auth_alias`, `client_auth_alias` and the proxy alias.
    #[must_use]
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the session. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an invalid pool size, unusable TLS
    /// material, or inconsistent authentication settings.
    pub fn build(self) -> Result<HttpSession, ConfigError> {
        let config = &self.config;
        let settings = PoolSettings::from_config(config)?;
        let tls = TlsContext::build(&config.tls)?;
        let resolver = CredentialResolver::new(self.store);

        let proxy = config
            .proxy
            .as_ref()
            .map(|p| ProxyAuthenticator::configure(p, &resolver))
            .transpose()?
            .flatten()
            .map(Arc::new);
        if proxy.as_ref().is_some_and(|p| p.has_credentials()) {
            tracing::warn!("proxy credentials are sent unencrypted to the proxy for plain http targets");
        }

        let stats = PoolStats::default();
        let transport = build_transport(config, tls, settings, stats.clone(), proxy.clone());
        let strategy = AuthStrategy::configure(&config.auth, &resolver, &transport)?;
        let auth_scheme = strategy.scheme();

        let service = ServiceBuilder::new()
            .layer(RetryLayer::new(config.retry_config()))
            .layer(AuthLayer::new(strategy, proxy))
            .service(transport);
        let buffer_capacity = config.buffer_capacity.max(1);
        let service: BufferedService = Buffer::new(service, buffer_capacity);

        tracing::info!(
            max_connections = config.max_connections,
            timeout_ms = config.timeout_ms,
            max_execute_retries = config.max_execute_retries,
            follow_redirects = config.follow_redirects,
            cookies = !config.disable_cookies,
            auth_scheme = ?auth_scheme,
            proxy = config.proxy.as_ref().map(|p| p.host.as_str()).unwrap_or_default(),
            "configured http session"
        );

        Ok(HttpSession {
            service,
            stats,
            auth_scheme,
        })
    }
}

fn build_transport(
    config: &SessionConfig,
    tls: Arc<ClientConfig>,
    settings: PoolSettings,
    stats: PoolStats,
    proxy: Option<Arc<ProxyAuthenticator>>,
) -> TransportService {
    let timeout = config.timeout();

    // pool_timer is required for pool_idle_timeout to take effect
    let mut client_builder = Client::builder(TokioExecutor::new());
    client_builder
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(settings.idle_timeout)
        .pool_max_idle_per_host(settings.max_connections);

    let connector = TransportConnector::new(Arc::new(settings), stats.clone(), proxy);
    let https = HttpsConnectorBuilder::new()
        .with_tls_config(Arc::unwrap_or_clone(tls))
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(connector);
    let client = client_builder.build::<_, RequestBody>(https);

    let redirects = config
        .follow_redirects
        .then(|| FollowRedirectLayer::with_policy(RedirectPolicy::new(config.max_redirects)));
    let cookies = (!config.disable_cookies).then(|| CookieLayer::new(CookieJar::default()));

    let service = ServiceBuilder::new()
        .option_layer(timeout.map(TimeoutLayer::new))
        .map_err(BoxError::from)
        .layer(DecompressionLayer::new())
        .option_layer(redirects)
        .option_layer(cookies)
        .layer(LeaseLayer::new(stats, timeout))
        .service(client)
        .map_response(map_decompression_response)
        .map_err(move |e: BoxError| map_tower_error(e, timeout));

    BoxCloneSyncService::new(service)
}

/// Unauthenticated transport with default settings.
#[cfg(test)]
pub fn transport_for_tests() -> TransportService {
    let config = SessionConfig::default();
    let settings = PoolSettings::from_config(&config).unwrap();
    let tls = TlsContext::build(&config.tls).unwrap();
    build_transport(&config, tls, settings, PoolStats::default(), None)
}

/// `Elapsed` becomes [`HttpError::Timeout`], an inner [`HttpError`] is
/// kept, anything else is classified as a transport failure.
fn map_tower_error(err: BoxError, timeout: Option<Duration>) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>()
        && let Some(timeout) = timeout
    {
        return HttpError::Timeout(timeout);
    }
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => classify_transport(other),
    }
}

/// Buffer errors are either the inner [`HttpError`] or a dead worker.
fn map_buffer_error(err: BoxError) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(err) => {
            tracing::error!(error = %err, "session worker closed unexpectedly");
            HttpError::ServiceClosed
        }
    }
}

fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    response.map(|body| body.map_err(Into::into).boxed())
}
