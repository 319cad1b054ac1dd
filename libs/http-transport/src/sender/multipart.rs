use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use rand::distr::Alphanumeric;

const BOUNDARY_LEN: usize = 30;

/// Root part type of an MTOM package (XOP, W3C XML-binary Optimized Packaging).
pub const XOP_CONTENT_TYPE: &str = "application/xop+xml";

/// One body part supplied by the caller through the
/// [`MessageContext`](super::MessageContext).
#[derive(Debug, Clone)]
pub struct MultipartPart {
    name: String,
    content: Bytes,
    content_type: Option<String>,
    filename: Option<String>,
}

impl MultipartPart {
    #[must_use]
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            content_type: None,
            filename: None,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Marks the part as a file upload.
    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }
}

/// Flavour of multipart entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MultipartKind {
    /// `multipart/form-data`
    FormData,
    /// `multipart/related` with an XOP root part
    Mtom,
}

/// Assembles a complete multipart entity in memory, so the resulting request
/// body stays repeatable.
#[derive(Debug)]
pub(super) struct MultipartBuilder {
    kind: MultipartKind,
    boundary: String,
    charset: String,
    buf: BytesMut,
}

impl MultipartBuilder {
    pub(super) fn new(kind: MultipartKind, charset: &str) -> Self {
        let boundary: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(BOUNDARY_LEN)
            .map(char::from)
            .collect();
        Self::with_boundary(kind, charset, boundary)
    }

    pub(super) fn with_boundary(kind: MultipartKind, charset: &str, boundary: String) -> Self {
        Self {
            kind,
            boundary,
            charset: charset.to_owned(),
            buf: BytesMut::new(),
        }
    }

    /// Part carrying the message: `text/plain`, or the XOP root for MTOM.
    pub(super) fn message_part(&mut self, name: &str, content: &[u8]) {
        let content_type = match self.kind {
            MultipartKind::FormData => format!("text/plain; charset={}", self.charset),
            MultipartKind::Mtom => format!(
                "{XOP_CONTENT_TYPE}; charset={}; type=\"text/xml\"",
                self.charset
            ),
        };
        self.part(name, None, &content_type, content);
    }

    /// Plain text field.
    pub(super) fn text_part(&mut self, name: &str, value: &str) {
        let content_type = format!("text/plain; charset={}", self.charset);
        self.part(name, None, &content_type, value.as_bytes());
    }

    pub(super) fn caller_part(&mut self, part: &MultipartPart) {
        let content_type = match (&part.content_type, &part.filename) {
            (Some(ct), _) => ct.clone(),
            (None, Some(_)) => mime::APPLICATION_OCTET_STREAM.to_string(),
            (None, None) => format!("text/plain; charset={}", self.charset),
        };
        self.part(&part.name, part.filename.as_deref(), &content_type, &part.content);
    }

    fn part(&mut self, name: &str, filename: Option<&str>, content_type: &str, content: &[u8]) {
        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
        self.buf.put_slice(escape_quoted(name).as_bytes());
        self.buf.put_u8(b'"');
        if let Some(filename) = filename {
            self.buf.put_slice(b"; filename=\"");
            self.buf.put_slice(escape_quoted(filename).as_bytes());
            self.buf.put_u8(b'"');
        }
        self.buf.put_slice(b"\r\nContent-Type: ");
        self.buf.put_slice(content_type.as_bytes());
        if self.kind == MultipartKind::Mtom {
            self.buf.put_slice(b"\r\nContent-ID: <");
            self.buf.put_slice(escape_quoted(name).as_bytes());
            self.buf.put_u8(b'>');
        }
        self.buf.put_slice(b"\r\n\r\n");
        self.buf.put_slice(content);
        self.buf.put_slice(b"\r\n");
    }

    /// `Content-Type` header value for the entity.
    pub(super) fn content_type(&self) -> String {
        match self.kind {
            MultipartKind::FormData => format!("multipart/form-data; boundary={}", self.boundary),
            MultipartKind::Mtom => format!(
                "multipart/related; type=\"{XOP_CONTENT_TYPE}\"; boundary={}",
                self.boundary
            ),
        }
    }

    /// Closing delimiter plus the finished entity.
    pub(super) fn finish(mut self) -> (String, Bytes) {
        let content_type = self.content_type();
        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"--\r\n");
        (content_type, self.buf.freeze())
    }
}

/// Percent-escapes the characters that would break a quoted header parameter.
fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
