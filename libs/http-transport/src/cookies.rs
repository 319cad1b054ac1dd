//! In-memory cookie handling for a session.
//!
//! Cookies are kept per host and scoped by their `Path`; `Secure` cookies
//! are only sent over https. The `Domain` attribute is not interpreted, so a
//! cookie never travels to another host. Cookies live as long as the session.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use http::{HeaderMap, HeaderValue, Request, Response, Uri, header};
use parking_lot::RwLock;
use tower::{Layer, Service};

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    value: String,
    secure: bool,
}

/// Cookies of one host, keyed by `(path, name)`.
type HostCookies = BTreeMap<(String, String), StoredCookie>;

/// Per-host cookie store shared by every clone of a session.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    hosts: Arc<RwLock<HashMap<String, HostCookies>>>,
}

impl CookieJar {
    /// Record every `Set-Cookie` of the response to a request for `uri`.
    pub fn store(&self, uri: &Uri, headers: &HeaderMap) {
        let Some(host) = uri.host() else { return };
        let mut hosts = self.hosts.write();
        for value in headers.get_all(header::SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Some(cookie) = SetCookie::parse(raw) else {
                continue;
            };
            let path = cookie
                .path
                .filter(|p| p.starts_with('/'))
                .map_or_else(|| default_path(uri.path()), ToOwned::to_owned);
            let jar = hosts.entry(host.to_ascii_lowercase()).or_default();
            let key = (path, cookie.name.to_owned());
            if cookie.expired {
                jar.remove(&key);
            } else {
                jar.insert(
                    key,
                    StoredCookie {
                        value: cookie.value.to_owned(),
                        secure: cookie.secure,
                    },
                );
            }
        }
    }

    /// `Cookie` header value for a request to `uri`, if any stored cookie
    /// applies. More specific paths come first.
    #[must_use]
    pub fn header_for(&self, uri: &Uri) -> Option<HeaderValue> {
        let host = uri.host()?;
        let https = uri.scheme_str() == Some("https");
        let hosts = self.hosts.read();
        let jar = hosts.get(&host.to_ascii_lowercase())?;

        let mut matching: Vec<_> = jar
            .iter()
            .filter(|((path, _), cookie)| {
                (https || !cookie.secure) && path_matches(uri.path(), path)
            })
            .collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by_key(|((path, _), _)| std::cmp::Reverse(path.len()));

        let joined = matching
            .iter()
            .map(|((_, name), cookie)| format!("{name}={}", cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }
}

/// The attributes of one `Set-Cookie` the jar cares about.
#[derive(Debug, PartialEq, Eq)]
struct SetCookie<'a> {
    name: &'a str,
    value: &'a str,
    path: Option<&'a str>,
    secure: bool,
    /// `Max-Age <= 0` or an `Expires` in the past
    expired: bool,
}

impl<'a> SetCookie<'a> {
    fn parse(raw: &'a str) -> Option<Self> {
        let mut parts = raw.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = SetCookie {
            name,
            value: value.trim(),
            path: None,
            secure: false,
            expired: false,
        };
        let mut max_age = None;
        for attr in parts {
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            let (key, val) = (key.trim(), val.trim());
            if key.eq_ignore_ascii_case("max-age") {
                max_age = val.parse::<i64>().ok();
            } else if key.eq_ignore_ascii_case("expires") {
                cookie.expired =
                    httpdate::parse_http_date(val).is_ok_and(|at| at <= SystemTime::now());
            } else if key.eq_ignore_ascii_case("path") {
                cookie.path = Some(val);
            } else if key.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            }
        }
        // Max-Age wins over Expires
        if let Some(secs) = max_age {
            cookie.expired = secs <= 0;
        }
        Some(cookie)
    }
}

/// Directory of the request path: `/a/b/c` gives `/a/b`, anything without a
/// second `/` gives `/`.
fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(i) => request_path[..i].to_owned(),
    }
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    let request_path = if request_path.is_empty() { "/" } else { request_path };
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

/// Attaches stored cookies to outgoing requests and records `Set-Cookie`
/// answers.
#[derive(Debug, Clone)]
pub struct CookieLayer {
    jar: CookieJar,
}

impl CookieLayer {
    #[must_use]
    pub fn new(jar: CookieJar) -> Self {
        Self { jar }
    }
}

impl<S> Layer<S> for CookieLayer {
    type Service = CookieService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CookieService {
            inner,
            jar: self.jar.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CookieService<S> {
    inner: S,
    jar: CookieJar,
}

impl<S, B, ResBody> Service<Request<B>> for CookieService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let uri = req.uri().clone();
        if !req.headers().contains_key(header::COOKIE)
            && let Some(value) = self.jar.header_for(&uri)
        {
            req.headers_mut().insert(header::COOKIE, value);
        }

        let jar = self.jar.clone();
        let future = self.inner.call(req);
        Box::pin(async move {
            let response = future.await?;
            jar.store(&uri, response.headers());
            Ok(response)
        })
    }
}
