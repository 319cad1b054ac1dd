//! Redirect policy for the session's `FollowRedirect` layer.
//!
//! Redirects are followed for every method up to a fixed count. When a hop
//! leaves the original origin, credentials and cookies are stripped from the
//! follow-up request.

use http::{Request, Uri, header};
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

use crate::body::RequestBody;

const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    max_redirects: usize,
    /// Resets per request: the layer clones the policy for every exchange
    followed: usize,
    cross_origin: bool,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(max_redirects: usize) -> Self {
        Self {
            max_redirects,
            followed: 0,
            cross_origin: false,
        }
    }
}

fn origin(uri: &Uri) -> (&str, &str, u16) {
    let scheme = uri.scheme_str().unwrap_or("http");
    let port = uri
        .port_u16()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });
    (scheme, uri.host().unwrap_or_default(), port)
}

impl<E> Policy<RequestBody, E> for RedirectPolicy {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        if self.followed >= self.max_redirects {
            tracing::debug!(max = self.max_redirects, "redirect limit reached");
            return Ok(Action::Stop);
        }
        self.followed += 1;

        let previous = attempt.previous();
        let target = attempt.location();
        if origin(previous) != origin(target) {
            self.cross_origin = true;
        }

        tracing::debug!(
            status = attempt.status().as_u16(),
            from = %previous,
            to = %target,
            hop = self.followed,
            "following redirect"
        );
        Ok(Action::Follow)
    }

    fn on_request(&mut self, request: &mut Request<RequestBody>) {
        if self.cross_origin {
            let headers = request.headers_mut();
            for name in SENSITIVE_HEADERS {
                headers.remove(name);
            }
        }
    }

    fn clone_body(&self, body: &RequestBody) -> Option<RequestBody> {
        body.try_clone()
    }
}
