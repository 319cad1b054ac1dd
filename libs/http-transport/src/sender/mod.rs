//! Message sender on top of an [`HttpSession`].
//!
//! An [`HttpSender`] turns a message plus a [`MessageContext`] into one HTTP
//! exchange: it resolves the target, encodes the body per method and post
//! type, attaches message headers, and maps the answer to a
//! [`SenderResult`]. Non-success status codes are results, not errors.

mod multipart;
mod request;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use mime::Mime;

pub use crate::config::{HttpMethod, PostType};
pub use multipart::{MultipartPart, XOP_CONTENT_TYPE};

use crate::config::SenderConfig;
use crate::credentials::CredentialStore;
use crate::endpoint::Endpoint;
use crate::error::{ConfigError, HttpError};
use crate::response::ResponseEnvelope;
use crate::session::HttpSession;
use request::{BodyStrategy, RequestPlan};

/// Context key holding the numeric status code of the last exchange.
pub const CONTEXT_KEY_STATUS_CODE: &str = "Http.StatusCode";
/// Context key holding the reason phrase of the last exchange.
pub const CONTEXT_KEY_REASON_PHRASE: &str = "Http.ReasonPhrase";

/// Per-message input and output of [`HttpSender::send_message`].
///
/// Parameters keep their insertion order; lookups return the first value.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    message_id: Option<String>,
    correlation_id: Option<String>,
    params: Vec<(String, String)>,
    parts: Vec<MultipartPart>,
    values: HashMap<String, String>,
}

impl MessageContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Extra body part for form-data and MTOM requests.
    #[must_use]
    pub fn with_part(mut self, part: MultipartPart) -> Self {
        self.parts.push(part);
        self
    }

    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    #[must_use]
    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    /// Value stored by a previous exchange, e.g. [`CONTEXT_KEY_STATUS_CODE`].
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

/// Outcome of one message exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderResult {
    /// Status accepted by [`validate_response_code`]
    pub success: bool,
    /// Response text, the rendered headers for HEAD, or the error body
    pub result: String,
    /// Reason phrase for 4xx and 5xx answers
    pub error_message: Option<String>,
    /// Status code as text, for routing on the result
    pub forward_name: String,
    pub status_code: StatusCode,
}

/// Success policy for a status code.
///
/// 200, 201, 202, 204 and 206 succeed; 301, 302 and 307 succeed only with
/// `ignore_redirects`. With `reports_status` (a status key is configured)
/// every code counts as delivered.
#[must_use]
pub fn validate_response_code(status: StatusCode, ignore_redirects: bool, reports_status: bool) -> bool {
    if reports_status {
        return true;
    }
    match status.as_u16() {
        200 | 201 | 202 | 204 | 206 => true,
        301 | 302 | 307 => ignore_redirects,
        _ => false,
    }
}

fn is_error_status(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error()
}

/// Sends messages to one configured target.
#[derive(Debug, Clone)]
pub struct HttpSender {
    config: SenderConfig,
    session: HttpSession,
    strategy: BodyStrategy,
    endpoint: Option<Endpoint>,
    url_param: Option<String>,
    content_type: Option<HeaderValue>,
    first_body_part_name: Option<String>,
    header_params: Vec<(String, HeaderName)>,
    message_id_header: Option<HeaderName>,
    correlation_id_header: Option<HeaderName>,
    status_key: Option<String>,
}

impl HttpSender {
    /// Validate `config` and open a session for it. Must run inside a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an invalid option combination, target
    /// URL, content type or header name, or for any session setup failure.
    pub fn configure(config: SenderConfig) -> Result<Self, ConfigError> {
        Self::open(config, None)
    }

    /// Like [`configure`](Self::configure), resolving aliases through `store`.
    ///
    /// # Errors
    ///
    /// Same as [`configure`](Self::configure).
    pub fn configure_with_store(
        config: SenderConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, ConfigError> {
        Self::open(config, Some(store))
    }

    /// Sender on an existing session, sharing its pool, cookies and token.
    /// The session options embedded in `config` are ignored.
    ///
    /// # Errors
    ///
    /// Same as [`configure`](Self::configure), minus session setup.
    pub fn with_session(config: SenderConfig, session: HttpSession) -> Result<Self, ConfigError> {
        config.validate()?;

        let endpoint = match non_blank(config.url_param.as_deref()) {
            Some(_) => None,
            None => config
                .url
                .as_deref()
                .map(Endpoint::parse)
                .transpose()
                .map_err(ConfigError::InvalidUrl)?,
        };
        let post_type = config.effective_post_type();
        let strategy = BodyStrategy::select(config.method, post_type);
        let content_type = full_content_type(&config, post_type)?;

        let url_param = non_blank(config.url_param.as_deref()).map(str::to_owned);
        let header_params = config
            .header_params
            .iter()
            .map(String::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty() && Some(*name) != url_param.as_deref())
            .map(|name| Ok((name.to_owned(), header_name(name)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let message_id_header = non_blank(config.message_id_header.as_deref())
            .map(header_name)
            .transpose()?;
        let correlation_id_header = non_blank(config.correlation_id_header.as_deref())
            .map(header_name)
            .transpose()?;

        tracing::info!(
            url = config.url.as_deref().unwrap_or_default(),
            url_param = url_param.as_deref().unwrap_or_default(),
            method = %config.method.as_method(),
            post_type = post_type.as_str(),
            "configured http sender"
        );

        Ok(Self {
            first_body_part_name: non_blank(config.first_body_part_name.as_deref())
                .map(str::to_owned),
            status_key: non_blank(config.result_status_code_session_key.as_deref())
                .map(str::to_owned),
            config,
            session,
            strategy,
            endpoint,
            url_param,
            content_type,
            header_params,
            message_id_header,
            correlation_id_header,
        })
    }

    fn open(config: SenderConfig, store: Option<Arc<dyn CredentialStore>>) -> Result<Self, ConfigError> {
        // fail on sender options before any TLS material is loaded
        config.validate()?;
        let mut builder = HttpSession::builder().config(config.session.clone());
        if let Some(store) = store {
            builder = builder.credential_store(store);
        }
        let session = builder.build()?;
        Self::with_session(config, session)
    }

    #[must_use]
    pub fn session(&self) -> &HttpSession {
        &self.session
    }

    /// Send `message` and map the answer to a [`SenderResult`].
    ///
    /// Stores [`CONTEXT_KEY_STATUS_CODE`], [`CONTEXT_KEY_REASON_PHRASE`] and,
    /// when configured, the result status key in `context`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidUri`] for a bad url parameter,
    /// [`HttpError::InvalidHeaderValue`] for unusable header values, and the
    /// session errors (timeout, transport, TLS, auth) after retries. A
    /// non-success status is not an error.
    pub async fn send_message(
        &self,
        message: impl Into<Bytes>,
        context: &mut MessageContext,
    ) -> Result<SenderResult, HttpError> {
        let endpoint = self.target(context)?;
        let params = self.request_params(context);
        let headers = self.request_headers(context)?;

        let request = RequestPlan {
            method: self.config.method,
            strategy: self.strategy,
            endpoint: &endpoint,
            content_type: self.content_type.as_ref(),
            charset: &self.config.charset,
            first_body_part_name: self.first_body_part_name.as_deref(),
            params: &params,
            parts: context.parts(),
            headers,
        }
        .build(message.into())?;

        tracing::debug!(host = endpoint.host(), "executing message exchange");
        // a response without Content-Type is read with the configured one
        let default_content_type = self.content_type.as_ref().and_then(|v| v.to_str().ok());
        let mut response =
            ResponseEnvelope::new(self.session.send(request).await?, default_content_type);

        let status = response.status();
        let reason = response.reason().into_owned();
        let success =
            validate_response_code(status, self.config.ignore_redirects, self.status_key.is_some());
        if let Some(key) = &self.status_key {
            context.put(key.clone(), status.as_u16().to_string());
        }

        let result = if success && self.config.method == HttpMethod::Head {
            let xml = headers_xml(response.headers());
            response.stream_mut().close().await;
            xml
        } else if success {
            if is_error_status(status) {
                tracing::warn!(status = status.as_u16(), reason = %reason, "http status");
            } else {
                tracing::debug!(status = status.as_u16(), "http status");
            }
            if response.is_multipart() {
                tracing::debug!("multipart response returned as a single text");
            }
            response.text().await?
        } else {
            tracing::warn!(status = status.as_u16(), reason = %reason, "http status indicates failure");
            failure_body(response).await
        };

        tracing::debug!(
            status_code = status.as_u16(),
            reason_phrase = %reason,
            "storing exchange outcome in context"
        );
        context.put(CONTEXT_KEY_STATUS_CODE, status.as_u16().to_string());
        context.put(CONTEXT_KEY_REASON_PHRASE, reason.clone());

        Ok(SenderResult {
            success,
            result,
            error_message: is_error_status(status).then_some(reason),
            forward_name: status.as_u16().to_string(),
            status_code: status,
        })
    }

    fn target(&self, context: &MessageContext) -> Result<Endpoint, HttpError> {
        match (&self.url_param, &self.endpoint) {
            (Some(name), _) => Endpoint::parse(context.param(name).unwrap_or_default()),
            (None, Some(endpoint)) => Ok(endpoint.clone()),
            (None, None) => Err(HttpError::InvalidUri {
                url: String::new(),
                kind: crate::error::InvalidUriKind::Blank,
                reason: "no url configured".to_owned(),
            }),
        }
    }

    fn is_header_param(&self, name: &str) -> bool {
        self.header_params.iter().any(|(n, _)| n == name)
    }

    fn request_params(&self, context: &MessageContext) -> Vec<(String, String)> {
        context
            .params()
            .iter()
            .filter(|(name, _)| {
                !self.is_header_param(name) && self.url_param.as_deref() != Some(name.as_str())
            })
            .filter(|(name, value)| !value.is_empty() || !self.config.skips_when_empty(name))
            .cloned()
            .collect()
    }

    fn request_headers(
        &self,
        context: &MessageContext,
    ) -> Result<Vec<(HeaderName, HeaderValue)>, HttpError> {
        let mut headers = Vec::new();
        let ids = [
            (&self.message_id_header, context.message_id()),
            (&self.correlation_id_header, context.correlation_id()),
        ];
        for (name, value) in ids {
            if let (Some(name), Some(value)) = (name, value.filter(|v| !v.is_empty())) {
                headers.push((name.clone(), HeaderValue::from_str(value)?));
            }
        }
        for (param, name) in &self.header_params {
            if let Some(value) = context.param(param)
                && (!value.is_empty() || !self.config.skips_when_empty(param))
            {
                headers.push((name.clone(), HeaderValue::from_str(value)?));
            }
        }
        Ok(headers)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn header_name(name: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ConfigError::Invalid(format!("invalid header name [{name}]: {e}")))
}

/// Configured content type with the sender charset added when it has none.
/// Raw entities default to `text/html`, binary ones to
/// `application/octet-stream`.
fn full_content_type(config: &SenderConfig, post_type: PostType) -> Result<Option<HeaderValue>, ConfigError> {
    let has_entity = config.method.has_entity();
    let content_type = match non_blank(config.content_type.as_deref()) {
        Some(ct) => ct.to_owned(),
        None if has_entity && post_type == PostType::Raw => mime::TEXT_HTML.to_string(),
        None if has_entity && post_type == PostType::Binary => {
            return Ok(Some(HeaderValue::from_static("application/octet-stream")));
        }
        None => return Ok(None),
    };

    let parsed: Mime = content_type
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("invalid content_type [{content_type}]: {e}")))?;
    let full = if parsed.get_param(mime::CHARSET).is_some() {
        content_type
    } else {
        format!("{content_type}; charset={}", config.charset)
    };
    HeaderValue::from_str(&full)
        .map(Some)
        .map_err(|e| ConfigError::Invalid(format!("invalid content_type [{full}]: {e}")))
}

/// Best-effort body of a failed exchange; a read failure becomes its description.
async fn failure_body(response: ResponseEnvelope) -> String {
    match response.text().await {
        Ok(body) => body,
        Err(e) => format!("({}): {e}", e.kind()),
    }
}

/// `<headers><header name="..."><![CDATA[...]]></header></headers>`
fn headers_xml(headers: &HeaderMap) -> String {
    let mut xml = String::from("<headers>");
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        xml.push_str("<header name=\"");
        xml.push_str(name.as_str());
        xml.push_str("\"><![CDATA[");
        xml.push_str(&value.replace("]]>", "]]]]><![CDATA[>"));
        xml.push_str("]]></header>");
    }
    xml.push_str("</headers>");
    xml
}
