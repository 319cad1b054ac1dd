use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;

use crate::error::BoxError;

/// Request entity sent through the session.
///
/// A `Repeatable` body is held in memory and can be replayed for retries,
/// redirects and authentication challenges. A `OneShot` body is a single-read
/// stream; any exchange that would need to resend it fails instead.
pub enum RequestBody {
    Repeatable(Option<Bytes>),
    OneShot(BoxBody<Bytes, BoxError>),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repeatable(bytes) => f
                .debug_tuple("Repeatable")
                .field(&bytes.as_ref().map_or(0, Bytes::len))
                .finish(),
            Self::OneShot(_) => f.write_str("OneShot"),
        }
    }
}

impl RequestBody {
    #[must_use]
    pub fn empty() -> Self {
        Self::Repeatable(None)
    }

    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            Self::Repeatable(None)
        } else {
            Self::Repeatable(Some(bytes))
        }
    }

    /// Wrap a streaming body. The result is never repeatable.
    #[must_use]
    pub fn from_stream<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        Self::OneShot(body.map_err(Into::into).boxed())
    }

    #[must_use]
    pub fn is_repeatable(&self) -> bool {
        matches!(self, Self::Repeatable(_))
    }

    /// Copy of a repeatable body, `None` for a stream.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Repeatable(bytes) => Some(Self::Repeatable(bytes.clone())),
            Self::OneShot(_) => None,
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::from_bytes(s)
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        Self::from_bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        Self::from_bytes(v)
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            Self::Repeatable(bytes) => Poll::Ready(bytes.take().map(|b| Ok(Frame::data(b)))),
            Self::OneShot(body) => Pin::new(body).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Repeatable(bytes) => bytes.is_none(),
            Self::OneShot(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            Self::Repeatable(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            Self::Repeatable(None) => SizeHint::with_exact(0),
            Self::OneShot(body) => body.size_hint(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http_body_util::Full;

    #[tokio::test]
    async fn repeatable_body_can_be_replayed() {
        let body = RequestBody::from("payload");
        assert!(body.is_repeatable());
        assert_eq!(body.size_hint().exact(), Some(7));

        let copy = body.try_clone().unwrap();
        let first = body.collect().await.unwrap().to_bytes();
        let second = copy.collect().await.unwrap().to_bytes();
        assert_eq!(first, second);
        assert_eq!(&first[..], b"payload");
    }

    #[tokio::test]
    async fn stream_body_is_not_repeatable() {
        let body = RequestBody::from_stream(Full::new(Bytes::from_static(b"once")));
        assert!(!body.is_repeatable());
        assert!(body.try_clone().is_none());
        assert_eq!(&body.collect().await.unwrap().to_bytes()[..], b"once");
    }

    #[test]
    fn empty_body_is_end_of_stream() {
        assert!(RequestBody::empty().is_end_stream());
        assert!(RequestBody::from_bytes(Vec::new()).is_end_stream());
        assert!(RequestBody::default().is_repeatable());
    }
}
