//! Response envelope and the self-releasing content stream.

use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use mime::Mime;
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{BodyReadTimeout, BoxError, HttpError, source_chain};

/// Type-erased response body as produced by the session stack (after
/// decompression).
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Charset used when neither the response nor the media type names one.
pub const FALLBACK_CHARSET: &str = "UTF-8";

/// Bytes [`ResponseStream::close`] reads off an unfinished body so the
/// connection can be reused. Larger remainders close the connection instead.
const CLOSE_DRAIN_LIMIT: usize = 64 * 1024;

/// Parse `Retry-After` as delta-seconds or an HTTP-date.
///
/// Returns `None` for a missing or unparseable header, negative seconds, or
/// a date already in the past.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return u64::try_from(seconds).ok().map(Duration::from_secs);
    }

    httpdate::parse_http_date(value)
        .ok()?
        .duration_since(SystemTime::now())
        .ok()
}

/// Media type of a response plus its effective charset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    mime: Mime,
    charset: String,
}

impl ContentType {
    /// Content type from the `Content-Type` header, else `default`.
    ///
    /// The charset is the `charset` parameter, else the registered default
    /// of the media type, else [`FALLBACK_CHARSET`]. Returns `None` when
    /// neither source yields a parseable media type.
    #[must_use]
    pub fn resolve(headers: &HeaderMap, default: Option<&str>) -> Option<Self> {
        let raw = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
            .or(default)?;

        let mime: Mime = match raw.trim().parse() {
            Ok(mime) => mime,
            Err(e) => {
                tracing::debug!(content_type = raw, error = %e, "ignoring unparseable content type");
                return None;
            }
        };
        let charset = mime
            .get_param(mime::CHARSET)
            .map(|c| c.as_str().to_owned())
            .or_else(|| registered_charset(&mime).map(ToOwned::to_owned))
            .unwrap_or_else(|| FALLBACK_CHARSET.to_owned());

        Some(Self { mime, charset })
    }

    #[must_use]
    pub fn mime(&self) -> &Mime {
        &self.mime
    }

    /// `type/subtype` without parameters.
    #[must_use]
    pub fn essence(&self) -> &str {
        self.mime.essence_str()
    }

    #[must_use]
    pub fn charset(&self) -> &str {
        &self.charset
    }

    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.mime.type_() == mime::MULTIPART
    }
}

/// Default charsets of common media types, as registered for HTTP/1.1.
fn registered_charset(mime: &Mime) -> Option<&'static str> {
    match mime.essence_str() {
        "application/json" | "application/soap+xml" | "application/problem+json" => Some("UTF-8"),
        "text/plain"
        | "text/html"
        | "text/xml"
        | "application/xml"
        | "application/atom+xml"
        | "application/xhtml+xml"
        | "application/svg+xml"
        | "application/x-www-form-urlencoded" => Some("ISO-8859-1"),
        _ => None,
    }
}

/// Decode `bytes` in `charset`. Unknown charsets decode as UTF-8.
fn decode(bytes: &[u8], charset: &str) -> String {
    let encoding = encoding_rs::Encoding::for_label(charset.trim().as_bytes()).unwrap_or_else(|| {
        tracing::debug!(charset, "unsupported charset, decoding as UTF-8");
        encoding_rs::UTF_8
    });
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::debug!(charset = encoding.name(), "response contained undecodable bytes");
    }
    text.into_owned()
}

/// A body failure, with a stalled read reported as [`HttpError::Timeout`].
fn body_error(err: BoxError) -> HttpError {
    let stalled = source_chain(err.as_ref())
        .find_map(|e| e.downcast_ref::<BodyReadTimeout>())
        .map(|timeout| timeout.0);
    match stalled {
        Some(timeout) => HttpError::Timeout(timeout),
        None => HttpError::Body(err),
    }
}

/// Response content that gives its connection back exactly once.
///
/// Release happens at end of stream, on a body error, on [`close`], on
/// [`abort`], or on drop. A response without entity is released on
/// construction and reads as empty.
///
/// [`close`]: ResponseStream::close
/// [`abort`]: ResponseStream::abort
pub struct ResponseStream {
    body: Option<ResponseBody>,
    /// Unread remainder of the last frame, filled by `poll_read`
    pending: Bytes,
    released: AtomicBool,
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("released", &self.is_released())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ResponseStream {
    #[must_use]
    pub fn new(body: ResponseBody) -> Self {
        let mut stream = Self {
            body: Some(body),
            pending: Bytes::new(),
            released: AtomicBool::new(false),
        };
        if stream.body.as_ref().is_some_and(Body::is_end_stream) {
            stream.release();
        }
        stream
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns `false` when the stream was already released.
    fn release(&mut self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.body = None;
        true
    }

    /// Read the remaining content into memory.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Body`] if the connection fails mid-stream, or
    /// [`HttpError::Timeout`] when the server stops sending for longer than
    /// the request timeout.
    pub async fn bytes(mut self) -> Result<Bytes, HttpError> {
        let mut buf = BytesMut::new();
        while let Some(frame) = self.frame().await {
            if let Ok(data) = frame?.into_data() {
                buf.extend_from_slice(&data);
            }
        }
        Ok(buf.freeze())
    }

    /// Finish the exchange and give the connection back to the pool.
    ///
    /// Unread content is drained up to a small limit first; beyond it the
    /// connection is closed. Idempotent, and failures are only logged.
    pub async fn close(&mut self) {
        if self.is_released() {
            return;
        }
        self.pending = Bytes::new();

        let mut drained = 0usize;
        while let Some(body) = self.body.as_mut() {
            match body.frame().await {
                Some(Ok(frame)) => {
                    drained += frame.data_ref().map_or(0, Bytes::len);
                    if drained > CLOSE_DRAIN_LIMIT {
                        tracing::debug!(drained, "unread response too large, discarding connection");
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "failed to drain response on close");
                    break;
                }
                None => break,
            }
        }
        self.release();
    }

    /// Drop the exchange without reading further; the connection is closed
    /// rather than reused. Idempotent.
    pub fn abort(&mut self) {
        self.pending = Bytes::new();
        if self.release() {
            tracing::debug!("response aborted, connection discarded");
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.is_released() {
            tracing::trace!("response stream dropped before release");
        }
    }
}

impl Body for ResponseStream {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            return Poll::Ready(Some(Ok(Frame::data(std::mem::take(&mut this.pending)))));
        }
        let Some(body) = this.body.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(Pin::new(body).poll_frame(cx)) {
            Some(Ok(frame)) => Poll::Ready(Some(Ok(frame))),
            Some(Err(e)) => {
                this.release();
                Poll::Ready(Some(Err(body_error(e))))
            }
            None => {
                this.release();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_empty() && self.body.as_ref().is_none_or(Body::is_end_stream)
    }

    fn size_hint(&self) -> SizeHint {
        match &self.body {
            Some(body) => {
                let inner = body.size_hint();
                let extra = self.pending.len() as u64;
                let mut hint = SizeHint::new();
                hint.set_lower(inner.lower() + extra);
                if let Some(upper) = inner.upper() {
                    hint.set_upper(upper + extra);
                }
                hint
            }
            None => SizeHint::with_exact(self.pending.len() as u64),
        }
    }
}

impl AsyncRead for ResponseStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            let Some(body) = this.body.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            match ready!(Pin::new(body).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        this.pending = data;
                    }
                }
                Some(Err(e)) => {
                    this.release();
                    let err = match body_error(e) {
                        timeout @ HttpError::Timeout(_) => {
                            io::Error::new(io::ErrorKind::TimedOut, timeout)
                        }
                        other => io::Error::other(other),
                    };
                    return Poll::Ready(Err(err));
                }
                None => {
                    this.release();
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

/// A received response: status line, headers, content type, and the
/// content stream the caller is responsible for.
#[derive(Debug)]
pub struct ResponseEnvelope {
    status: StatusCode,
    headers: HeaderMap,
    content_type: Option<ContentType>,
    stream: ResponseStream,
}

impl ResponseEnvelope {
    /// `default_content_type` applies when the response has no
    /// `Content-Type` header.
    #[must_use]
    pub fn new(response: Response<ResponseBody>, default_content_type: Option<&str>) -> Self {
        let (parts, body) = response.into_parts();
        let content_type = ContentType::resolve(&parts.headers, default_content_type);
        Self {
            status: parts.status,
            headers: parts.headers,
            content_type,
            stream: ResponseStream::new(body),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Canonical reason phrase, or `HTTP status-code [N]` for codes without one.
    #[must_use]
    pub fn reason(&self) -> Cow<'static, str> {
        reason_phrase(self.status)
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    #[must_use]
    pub fn charset(&self) -> &str {
        self.content_type
            .as_ref()
            .map_or(FALLBACK_CHARSET, ContentType::charset)
    }

    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.content_type.as_ref().is_some_and(ContentType::is_multipart)
    }

    pub fn stream_mut(&mut self) -> &mut ResponseStream {
        &mut self.stream
    }

    #[must_use]
    pub fn into_stream(self) -> ResponseStream {
        self.stream
    }

    /// # Errors
    ///
    /// Returns [`HttpError::Body`] if reading the content fails.
    pub async fn bytes(self) -> Result<Bytes, HttpError> {
        self.stream.bytes().await
    }

    /// Content decoded with the response charset.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Body`] if reading the content fails.
    pub async fn text(self) -> Result<String, HttpError> {
        let charset = self.charset().to_owned();
        let bytes = self.stream.bytes().await?;
        Ok(decode(&bytes, &charset))
    }
}

#[must_use]
pub fn reason_phrase(status: StatusCode) -> Cow<'static, str> {
    match status.canonical_reason() {
        Some(reason) => Cow::Borrowed(reason),
        None => Cow::Owned(format!("HTTP status-code [{}]", status.as_u16())),
    }
}
