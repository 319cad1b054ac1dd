use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::{Request, Response};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tower::{Layer, Service};

use super::{ConnectionInfo, ConnectionSlot, PoolStats};
use crate::error::{BodyReadTimeout, BoxError};

/// Releases one lease exactly once: explicitly, or on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    stats: Option<PoolStats>,
    slot: Option<Arc<ConnectionSlot>>,
}

impl LeaseGuard {
    pub(super) fn new(stats: PoolStats) -> Self {
        Self {
            stats: Some(stats),
            slot: None,
        }
    }

    /// Bind the guard to the connection that served the exchange.
    fn attach(&mut self, slot: Arc<ConnectionSlot>) {
        if self.stats.is_some() {
            self.slot = Some(slot);
        }
    }

    pub fn release(&mut self) {
        if let Some(stats) = self.stats.take() {
            stats.release_lease();
        }
        if let Some(slot) = self.slot.take() {
            slot.mark_idle();
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Marks a connection as leased from dispatch until the response body is
/// finished, failed, or dropped.
///
/// With a read timeout, a body that delivers nothing for that long fails
/// with [`BodyReadTimeout`] and gives its lease back.
#[derive(Debug, Clone)]
pub struct LeaseLayer {
    stats: PoolStats,
    read_timeout: Option<Duration>,
}

impl LeaseLayer {
    #[must_use]
    pub fn new(stats: PoolStats, read_timeout: Option<Duration>) -> Self {
        Self {
            stats,
            read_timeout,
        }
    }
}

impl<S> Layer<S> for LeaseLayer {
    type Service = LeaseService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LeaseService {
            inner,
            stats: self.stats.clone(),
            read_timeout: self.read_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseService<S> {
    inner: S,
    stats: PoolStats,
    read_timeout: Option<Duration>,
}

impl<S, B, ResBody> Service<Request<B>> for LeaseService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<LeasedBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let mut guard = self.stats.lease();
        let read_timeout = self.read_timeout;
        let future = self.inner.call(req);

        Box::pin(async move {
            // the guard drops with this future if dispatch fails
            let response = future.await?;
            if let Some(info) = response.extensions().get::<ConnectionInfo>() {
                guard.attach(info.slot.clone());
            }

            Ok(response.map(|inner| LeasedBody {
                inner,
                guard,
                read_timeout,
                deadline: None,
            }))
        })
    }
}

pin_project! {
    /// Response body holding the connection lease until end of stream.
    pub struct LeasedBody<B> {
        #[pin]
        inner: B,
        guard: LeaseGuard,
        read_timeout: Option<Duration>,
        deadline: Option<Pin<Box<Sleep>>>,
    }
}

impl<B> Body for LeasedBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                *this.deadline = None;
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                *this.deadline = None;
                this.guard.release();
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                *this.deadline = None;
                this.guard.release();
                Poll::Ready(None)
            }
            Poll::Pending => {
                let Some(limit) = *this.read_timeout else {
                    return Poll::Pending;
                };
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
                if deadline.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                *this.deadline = None;
                tracing::debug!(timeout_ms = limit.as_millis(), "response body read timed out");
                this.guard.release();
                Poll::Ready(Some(Err(Box::new(BodyReadTimeout(limit)))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use std::convert::Infallible;
    use tower::ServiceExt;

    fn ok_service() -> impl Service<
        Request<()>,
        Response = Response<Full<Bytes>>,
        Error = Infallible,
        Future = std::future::Ready<Result<Response<Full<Bytes>>, Infallible>>,
    > + Clone {
        tower::service_fn(|_req: Request<()>| {
            std::future::ready(Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                b"payload",
            )))))
        })
    }

    #[tokio::test]
    async fn lease_held_until_body_consumed() {
        let stats = PoolStats::default();
        let svc = LeaseLayer::new(stats.clone(), None).layer(ok_service());

        let response = svc.oneshot(Request::new(())).await.unwrap();
        assert_eq!(stats.leased(), 1);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"payload");
        assert_eq!(stats.leased(), 0);
    }

    #[tokio::test]
    async fn dropping_body_releases_lease() {
        let stats = PoolStats::default();
        let svc = LeaseLayer::new(stats.clone(), None).layer(ok_service());

        let response = svc.oneshot(Request::new(())).await.unwrap();
        assert_eq!(stats.leased(), 1);
        drop(response);
        assert_eq!(stats.leased(), 0);
    }

    #[tokio::test]
    async fn failed_dispatch_releases_lease() {
        let stats = PoolStats::default();
        let failing = tower::service_fn(|_req: Request<()>| async {
            Err::<Response<Full<Bytes>>, _>(std::io::Error::other("refused"))
        });
        let svc = LeaseLayer::new(stats.clone(), Some(Duration::from_secs(1))).layer(failing);

        assert!(svc.oneshot(Request::new(())).await.is_err());
        assert_eq!(stats.leased(), 0);
    }

    #[tokio::test]
    async fn silent_body_times_out_and_releases_lease() {
        let stats = PoolStats::default();
        let silent = tower::service_fn(|_req: Request<()>| async {
            let body = http_body_util::StreamBody::new(futures::stream::pending::<
                Result<Frame<Bytes>, Infallible>,
            >());
            Ok::<_, Infallible>(Response::new(body))
        });
        let svc = LeaseLayer::new(stats.clone(), Some(Duration::from_millis(50))).layer(silent);

        let response = svc.oneshot(Request::new(())).await.unwrap();
        assert_eq!(stats.leased(), 1);

        let err = response.into_body().collect().await.unwrap_err();
        assert!(err.is::<BodyReadTimeout>());
        assert_eq!(stats.leased(), 0);
    }

    #[tokio::test]
    async fn release_marks_connection_idle() {
        let stats = PoolStats::default();
        let slot = ConnectionSlot::new();
        let mut guard = stats.lease();
        guard.attach(slot.clone());
        assert!(!slot.is_idle());

        guard.release();
        assert!(slot.is_idle());
        assert_eq!(stats.leased(), 0);
    }
}
