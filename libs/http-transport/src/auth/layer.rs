use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::{AUTHORIZATION, PROXY_AUTHORIZATION};
use http::uri::Scheme;
use http::{HeaderMap, Request, Response, StatusCode};
use tower::{Layer, Service, ServiceExt};

use super::oauth::AccessToken;
use super::{AuthStrategy, ProxyAuthenticator};
use crate::body::RequestBody;
use crate::error::{AuthError, HttpError};
use crate::response::ResponseBody;

/// Applies the session's [`AuthStrategy`] and plain-http proxy credentials.
///
/// Sits inside the retry loop, so every retry attempt re-reads the current
/// token.
#[derive(Debug, Clone)]
pub struct AuthLayer {
    strategy: AuthStrategy,
    proxy: Option<Arc<ProxyAuthenticator>>,
}

impl AuthLayer {
    /// `proxy` is only consulted for plain-http targets; https targets
    /// authenticate against the proxy while opening the tunnel.
    #[must_use]
    pub fn new(strategy: AuthStrategy, proxy: Option<Arc<ProxyAuthenticator>>) -> Self {
        Self { strategy, proxy }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            strategy: self.strategy.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthService<S> {
    inner: S,
    strategy: AuthStrategy,
    proxy: Option<Arc<ProxyAuthenticator>>,
}

impl<S> Service<Request<RequestBody>> for AuthService<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        // Clone-swap: consume the instance that was poll_ready'd.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let strategy = self.strategy.clone();
        let proxy = self
            .proxy
            .clone()
            .filter(|_| req.uri().scheme() == Some(&Scheme::HTTP));

        Box::pin(authenticate(inner, strategy, proxy, req))
    }
}

async fn authenticate<S>(
    mut inner: S,
    strategy: AuthStrategy,
    proxy: Option<Arc<ProxyAuthenticator>>,
    req: Request<RequestBody>,
) -> Result<Response<ResponseBody>, HttpError>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>,
{
    let (mut parts, body) = req.into_parts();
    let replay = body.try_clone();

    let token = attach_credentials(&strategy, &mut parts.headers).await?;
    let proxy_sent = attach_proxy_credentials(proxy.as_deref(), &mut parts.headers);
    let mut response = inner.call(Request::from_parts(parts.clone(), body)).await?;

    if response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED
        && let Some(proxy) = proxy.as_deref()
    {
        if !proxy.on_challenge(proxy_sent) {
            return Err(AuthError::ProxyRejected(format!(
                "{} answered {}",
                proxy.host(),
                response.status()
            ))
            .into());
        }
        let Some(body) = replay.as_ref().and_then(RequestBody::try_clone) else {
            tracing::debug!("proxy requested authentication but the request body is not repeatable");
            return Ok(response);
        };
        attach_proxy_credentials(Some(proxy), &mut parts.headers);
        response = call_ready(&mut inner, Request::from_parts(parts.clone(), body)).await?;
        if response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(AuthError::ProxyRejected(format!(
                "{} rejected the configured credentials",
                proxy.host()
            ))
            .into());
        }
    }

    if response.status() == StatusCode::UNAUTHORIZED
        && let (AuthStrategy::OAuth2(manager), Some(stale)) = (&strategy, &token)
    {
        manager.invalidate(stale).await;
        let Some(body) = replay.as_ref().and_then(RequestBody::try_clone) else {
            tracing::debug!("access token rejected, request body is not repeatable, not resending");
            return Ok(response);
        };
        drop(response);

        let fresh = manager.token().await?;
        parts.headers.insert(AUTHORIZATION, fresh.bearer_header()?);
        tracing::debug!(uri = %parts.uri, "resending request with a fresh access token");

        let retried = call_ready(&mut inner, Request::from_parts(parts, body)).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(AuthError::Rejected(StatusCode::UNAUTHORIZED).into());
        }
        return Ok(retried);
    }

    Ok(response)
}

/// Sets the target-host `Authorization` header. Returns the token used, so
/// a 401 can invalidate exactly that token.
async fn attach_credentials(
    strategy: &AuthStrategy,
    headers: &mut HeaderMap,
) -> Result<Option<Arc<AccessToken>>, HttpError> {
    match strategy {
        AuthStrategy::None => Ok(None),
        AuthStrategy::Basic(value) => {
            // an explicit header from the caller wins
            if !headers.contains_key(AUTHORIZATION) {
                headers.insert(AUTHORIZATION, value.clone());
            }
            Ok(None)
        }
        AuthStrategy::OAuth2(manager) => {
            let token = manager.token().await?;
            headers.insert(AUTHORIZATION, token.bearer_header()?);
            Ok(Some(token))
        }
    }
}

fn attach_proxy_credentials(proxy: Option<&ProxyAuthenticator>, headers: &mut HeaderMap) -> bool {
    match proxy.and_then(ProxyAuthenticator::cached_header) {
        Some(value) => {
            headers.insert(PROXY_AUTHORIZATION, value);
            true
        }
        None => false,
    }
}

async fn call_ready<S>(inner: &mut S, req: Request<RequestBody>) -> Result<Response<ResponseBody>, HttpError>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>,
{
    inner.ready().await?.call(req).await
}
