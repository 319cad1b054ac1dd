use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Request};
use http_body_util::BodyExt;
use serde::Deserialize;
use tower::ServiceExt;
use zeroize::Zeroizing;

use super::token::TokenSource;
use crate::auth::basic::basic_header_value;
use crate::body::RequestBody;
use crate::credentials::Credentials;
use crate::endpoint::Endpoint;
use crate::error::AuthError;
use crate::secret::SecretString;
use crate::session::TransportService;

/// Longest error body echoed into an [`AuthError::TokenRequest`].
const ERROR_PREVIEW_LIMIT: usize = 256;

/// `OAuth2` grant used against the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    ClientCredentials,
    Password,
}

impl GrantType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientCredentials => "client_credentials",
            Self::Password => "password",
        }
    }
}

/// Successful token endpoint answer (RFC 6749 section 5.1).
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: SecretString,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Requests tokens over the session's own transport (TLS, proxy, pool), but
/// without target-host authentication or retries.
pub struct TokenEndpointClient {
    transport: TransportService,
    endpoint: Endpoint,
    grant: GrantType,
    client: Credentials,
    user: Credentials,
    scope: Option<String>,
    authenticated_request: bool,
}

impl std::fmt::Debug for TokenEndpointClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEndpointClient")
            .field("endpoint", &self.endpoint.to_string())
            .field("grant", &self.grant)
            .field("client", &self.client)
            .field("scope", &self.scope)
            .field("authenticated_request", &self.authenticated_request)
            .finish_non_exhaustive()
    }
}

impl TokenEndpointClient {
    /// The grant is `password` when `user` carries a principal, otherwise
    /// `client_credentials`.
    #[must_use]
    pub fn new(
        transport: TransportService,
        endpoint: Endpoint,
        client: Credentials,
        user: Credentials,
        scope: Option<String>,
        authenticated_request: bool,
    ) -> Self {
        let grant = if user.username().is_some() {
            GrantType::Password
        } else {
            GrantType::ClientCredentials
        };
        Self {
            transport,
            endpoint,
            grant,
            client,
            user,
            scope: scope.filter(|s| !s.trim().is_empty()),
            authenticated_request,
        }
    }

    #[must_use]
    pub fn grant(&self) -> GrantType {
        self.grant
    }

    /// URL-encoded form body; the plaintext is scrubbed on drop.
    fn form(&self) -> Result<Zeroizing<String>, AuthError> {
        let mut fields: Vec<(&str, &str)> = vec![("grant_type", self.grant.as_str())];

        if self.grant == GrantType::Password {
            if let Some(username) = self.user.username() {
                fields.push(("username", username));
            }
            fields.push((
                "password",
                self.user.password().map_or("", SecretString::expose),
            ));
        }
        if let Some(scope) = &self.scope {
            fields.push(("scope", scope.as_str()));
        }
        if !self.authenticated_request {
            if let Some(client_id) = self.client.username() {
                fields.push(("client_id", client_id));
            }
            if let Some(secret) = self.client.password() {
                fields.push(("client_secret", secret.expose()));
            }
        }

        serde_urlencoded::to_string(&fields)
            .map(Zeroizing::new)
            .map_err(|e| AuthError::TokenRequest(format!("cannot encode token request: {e}")))
    }

    fn request(&self) -> Result<Request<RequestBody>, AuthError> {
        let form = self.form()?;
        let mut builder = Request::post(self.endpoint.as_uri().clone())
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .header(ACCEPT, HeaderValue::from_static("application/json"));

        if self.authenticated_request {
            let header = basic_header_value(&self.client)
                .map_err(|e| AuthError::TokenRequest(e.to_string()))?;
            if let Some(header) = header {
                builder = builder.header(AUTHORIZATION, header);
            }
        }

        builder
            .body(RequestBody::from(Bytes::copy_from_slice(form.as_bytes())))
            .map_err(|e| AuthError::TokenRequest(e.to_string()))
    }
}

#[async_trait]
impl TokenSource for TokenEndpointClient {
    async fn fetch_token(&self) -> Result<TokenResponse, AuthError> {
        tracing::debug!(
            endpoint = %self.endpoint,
            grant = self.grant.as_str(),
            "requesting access token"
        );

        let response = self
            .transport
            .clone()
            .oneshot(self.request()?)
            .await
            .map_err(|e| AuthError::TokenRequest(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| AuthError::TokenRequest(format!("failed to read token response: {e}")))?
            .to_bytes();

        if !status.is_success() {
            let preview: String = String::from_utf8_lossy(&body)
                .chars()
                .take(ERROR_PREVIEW_LIMIT)
                .collect();
            return Err(AuthError::TokenRequest(format!("HTTP {status}: {preview}")));
        }

        serde_json::from_slice(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::session::transport_for_tests;
    use httpmock::prelude::*;

    fn client(server: &MockServer, user: Credentials, authenticated: bool) -> TokenEndpointClient {
        TokenEndpointClient::new(
            transport_for_tests(),
            Endpoint::parse(&server.url("/token")).unwrap(),
            Credentials::new(Some("cid".into()), Some(SecretString::new("csecret"))),
            user,
            Some("read write".into()),
            authenticated,
        )
    }

    #[test]
    fn deserializes_minimal_and_full_responses() {
        let r: TokenResponse = serde_json::from_str(r#"{"access_token":"tok"}"#).unwrap();
        assert_eq!(r.access_token.expose(), "tok");
        assert!(r.expires_in.is_none() && r.token_type.is_none());

        let r: TokenResponse = serde_json::from_str(
            r#"{"access_token":"tok","expires_in":60,"token_type":"Bearer","scope":"x"}"#,
        )
        .unwrap();
        assert_eq!(r.expires_in, Some(60));
        assert_eq!(r.token_type.as_deref(), Some("Bearer"));
    }

    #[tokio::test]
    async fn client_credentials_in_form() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .form_urlencoded_tuple("grant_type", "client_credentials")
                .form_urlencoded_tuple("client_id", "cid")
                .form_urlencoded_tuple("client_secret", "csecret")
                .form_urlencoded_tuple("scope", "read write");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"t1","expires_in":60,"token_type":"Bearer"}"#);
        });

        let source = client(&server, Credentials::default(), false);
        assert_eq!(source.grant(), GrantType::ClientCredentials);
        let token = source.fetch_token().await.unwrap();
        assert_eq!(token.access_token.expose(), "t1");
        mock.assert();
    }

    #[tokio::test]
    async fn password_grant_with_basic_client_auth() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .header("authorization", "Basic Y2lkOmNzZWNyZXQ=")
                .form_urlencoded_tuple("grant_type", "password")
                .form_urlencoded_tuple("username", "alice")
                .form_urlencoded_tuple("password", "pw");
            then.status(200).body(r#"{"access_token":"t2"}"#);
        });

        let user = Credentials::new(Some("alice".into()), Some(SecretString::new("pw")));
        let source = client(&server, user, true);
        assert_eq!(source.grant(), GrantType::Password);
        assert_eq!(source.fetch_token().await.unwrap().access_token.expose(), "t2");
        mock.assert();
    }

    #[tokio::test]
    async fn error_status_becomes_token_request_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(401).body(r#"{"error":"invalid_client"}"#);
        });

        let err = client(&server, Credentials::default(), false)
            .fetch_token()
            .await
            .unwrap_err();
        match err {
            AuthError::TokenRequest(msg) => {
                assert!(msg.contains("401"));
                assert!(!msg.contains("csecret"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200).body("not json");
        });

        let err = client(&server, Credentials::default(), false)
            .fetch_token()
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }
}
