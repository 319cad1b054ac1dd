//! Validated http(s) target addresses.

use std::fmt;

use http::Uri;
use http::uri::{PathAndQuery, Scheme};

use crate::error::{HttpError, InvalidUriKind};

/// An absolute `http`/`https` URI with a non-empty path.
///
/// The scheme check is case-insensitive and the stored scheme is lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    uri: Uri,
}

impl Endpoint {
    /// Parse and validate a target URL.
    ///
    /// # Errors
    ///
    /// - [`HttpError::InvalidUri`] for blank, malformed, relative, or host-less URLs
    /// - [`HttpError::InvalidScheme`] for any scheme other than http/https
    pub fn parse(url: &str) -> Result<Self, HttpError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(HttpError::InvalidUri {
                url: url.to_owned(),
                kind: InvalidUriKind::Blank,
                reason: "no url provided".to_owned(),
            });
        }

        let uri: Uri = trimmed
            .parse()
            .map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri {
                url: url.to_owned(),
                kind: InvalidUriKind::ParseError,
                reason: e.to_string(),
            })?;

        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::HTTPS,
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::HTTP,
            Some(other) => {
                return Err(HttpError::InvalidScheme {
                    scheme: other.to_owned(),
                    reason: "only web based schemes (http or https) are supported".to_owned(),
                });
            }
            None => {
                return Err(HttpError::InvalidUri {
                    url: url.to_owned(),
                    kind: InvalidUriKind::MissingScheme,
                    reason: "must use an absolute url starting with http(s)://".to_owned(),
                });
            }
        };

        let mut parts = uri.into_parts();
        if parts.authority.is_none() {
            return Err(HttpError::InvalidUri {
                url: url.to_owned(),
                kind: InvalidUriKind::MissingAuthority,
                reason: "missing host/authority".to_owned(),
            });
        }
        parts.scheme = Some(scheme);
        if parts.path_and_query.as_ref().is_none_or(|pq| pq.path().is_empty()) {
            let query = parts
                .path_and_query
                .as_ref()
                .and_then(PathAndQuery::query)
                .map(|q| format!("/?{q}"));
            parts.path_and_query = Some(match query {
                Some(pq) => PathAndQuery::try_from(pq).map_err(|e| HttpError::InvalidUri {
                    url: url.to_owned(),
                    kind: InvalidUriKind::ParseError,
                    reason: e.to_string(),
                })?,
                None => PathAndQuery::from_static("/"),
            });
        }

        let uri = Uri::from_parts(parts).map_err(|e| HttpError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;

        tracing::debug!(
            scheme = uri.scheme_str().unwrap_or_default(),
            host = uri.host().unwrap_or_default(),
            path = uri.path(),
            "created endpoint"
        );
        Ok(Self { uri })
    }

    /// Returns a copy with `params` appended to the query string
    /// (form-urlencoded, after any existing query).
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::FormEncode`] or [`HttpError::InvalidUri`] when the
    /// encoded result is not a valid URI.
    pub fn with_query(&self, params: &[(String, String)]) -> Result<Self, HttpError> {
        if params.is_empty() {
            return Ok(self.clone());
        }
        let encoded = serde_urlencoded::to_string(params)?;
        let path = self.uri.path();
        let pq = match self.uri.query() {
            Some(existing) if !existing.is_empty() => format!("{path}?{existing}&{encoded}"),
            _ => format!("{path}?{encoded}"),
        };

        let mut parts = self.uri.clone().into_parts();
        parts.path_and_query =
            Some(
                PathAndQuery::try_from(pq.as_str()).map_err(|e| HttpError::InvalidUri {
                    url: pq.clone(),
                    kind: InvalidUriKind::ParseError,
                    reason: e.to_string(),
                })?,
            );
        let uri = Uri::from_parts(parts).map_err(|e| HttpError::InvalidUri {
            url: pq,
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;
        Ok(Self { uri })
    }

    #[must_use]
    pub fn as_uri(&self) -> &Uri {
        &self.uri
    }

    #[must_use]
    pub fn is_https(&self) -> bool {
        self.uri.scheme() == Some(&Scheme::HTTPS)
    }

    #[must_use]
    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    /// Port, falling back to the scheme default.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.uri
            .port_u16()
            .unwrap_or(if self.is_https() { 443 } else { 80 })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uri.fmt(f)
    }
}

impl From<Endpoint> for Uri {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.uri
    }
}
