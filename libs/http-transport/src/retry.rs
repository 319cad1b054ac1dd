use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::{HeaderValue, Request, Response};
use http_body_util::BodyExt;
use rand::Rng;
use tower::{Layer, Service, ServiceExt};

use crate::body::RequestBody;
use crate::config::{ExponentialBackoff, RetryConfig, RetryTrigger};
use crate::error::HttpError;
use crate::response::{ResponseBody, parse_retry_after};

/// Header carried by retried attempts, holding the 1-based retry number.
pub const RETRY_ATTEMPT_HEADER: &str = "X-Retry-Attempt";

/// Retries failed exchanges with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct RetryLayer {
    config: RetryConfig,
}

impl RetryLayer {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Retry loop around the authenticated client.
///
/// Both `Err` results and retryable statuses are considered. A request whose
/// body is one-shot goes out exactly once: the body cannot be replayed, so
/// any failure is returned as is. For status-triggered retries the discarded
/// response is drained up to the configured limit so the connection can go
/// back to the pool.
#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> Service<Request<RequestBody>> for RetryService<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        // Consume the instance that was poll_ready'd, keep a fresh clone.
        let clone = self.inner.clone();
        let mut ready = std::mem::replace(&mut self.inner, clone);
        let inner = self.inner.clone();
        let config = self.config.clone();

        let (parts, body) = req.into_parts();
        let template = body.try_clone();
        let parts = Arc::new(parts);

        Box::pin(async move {
            let method = parts.method.clone();
            let host = parts
                .uri
                .authority()
                .map_or_else(|| "unknown".to_owned(), ToString::to_string);

            let first = Request::from_parts((*parts).clone(), body);
            let mut outcome = ready.call(first).await;
            let mut attempt = 0usize;

            loop {
                let (trigger, retry_after) = match &outcome {
                    Ok(resp) => (
                        RetryTrigger::Status(resp.status().as_u16()),
                        parse_retry_after(resp.headers()),
                    ),
                    Err(err) => (retry_trigger(err), None),
                };

                if !config.should_retry(trigger, &method) {
                    return outcome;
                }
                let Some(template) = &template else {
                    tracing::debug!(
                        host = %host,
                        method = %method,
                        trigger = ?trigger,
                        "request body is not repeatable, not retrying"
                    );
                    return outcome;
                };
                if attempt >= config.max_retries {
                    if config.max_retries > 0 {
                        tracing::debug!(
                            host = %host,
                            method = %method,
                            attempts = attempt + 1,
                            trigger = ?trigger,
                            "giving up after retries"
                        );
                    }
                    return outcome;
                }

                let backoff = match retry_after {
                    Some(delay) if !config.ignore_retry_after => delay,
                    _ => calculate_backoff(&config.backoff, attempt),
                };

                match outcome {
                    Ok(resp) => {
                        if let Err(e) = drain_response_body(resp, config.retry_response_drain_limit).await {
                            tracing::debug!(
                                error = %e,
                                "failed to drain response body before retry; connection may not be reused"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, host = %host, "exchange failed");
                    }
                }

                attempt += 1;
                tracing::debug!(
                    retry = attempt,
                    max_retries = config.max_retries,
                    trigger = ?trigger,
                    method = %method,
                    host = %host,
                    backoff_ms = backoff.as_millis(),
                    "retrying request"
                );
                tokio::time::sleep(backoff).await;

                let Some(body) = template.try_clone() else {
                    return Err(HttpError::Body("repeatable body could not be cloned".into()));
                };
                let mut req = Request::from_parts((*parts).clone(), body);
                if let Ok(value) = HeaderValue::try_from(attempt.to_string()) {
                    req.headers_mut().insert(RETRY_ATTEMPT_HEADER, value);
                }

                let mut svc = inner.clone();
                outcome = match svc.ready().await {
                    Ok(svc) => svc.call(req).await,
                    Err(e) => Err(e),
                };
            }
        })
    }
}

/// Drain at most `limit` bytes so an HTTP/1.1 connection can be reused.
async fn drain_response_body(response: Response<ResponseBody>, limit: usize) -> Result<(), HttpError> {
    let content_length = response
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    if content_length.is_some_and(|len| len > limit as u64) {
        tracing::trace!(?content_length, limit, "skipping drain: body exceeds limit");
        return Ok(());
    }

    let mut body = std::pin::pin!(response.into_body());
    let mut drained = 0usize;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::Body)?;
        if let Some(chunk) = frame.data_ref() {
            drained += chunk.len();
            if drained >= limit {
                break;
            }
        }
    }
    Ok(())
}

/// Unresolvable hosts and refused ports fail the same way on every attempt,
/// so [`HttpError::Connect`] is never retried.
fn retry_trigger(err: &HttpError) -> RetryTrigger {
    match err {
        HttpError::Transport(_) => RetryTrigger::TransportError,
        HttpError::Timeout(_) => RetryTrigger::Timeout,
        _ => RetryTrigger::NonRetryable,
    }
}

/// Backoff before retry number `attempt + 1`.
///
/// Non-finite or negative inputs are sanitized instead of panicking.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    const MAX_BACKOFF_SECS: f64 = 86_400.0;

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };
    let initial = backoff.initial.as_secs_f64();
    let max = backoff.max.as_secs_f64().min(MAX_BACKOFF_SECS);

    let raw = initial * multiplier.powi(exponent);
    let clamped = if raw.is_finite() { raw.clamp(0.0, max) } else { max };
    let delay = Duration::from_secs_f64(clamped);

    if backoff.jitter {
        let factor = rand::rng().random_range(0.0..=0.25);
        delay + delay.mul_f64(factor)
    } else {
        delay
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::{Empty, Full};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type BoxFuture = Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, HttpError>> + Send>>;

    /// Fails with a transport error `failures` times, then answers 200.
    #[derive(Clone)]
    struct Flaky {
        calls: Arc<AtomicUsize>,
        failures: usize,
        seen_attempt_headers: Arc<parking_lot::Mutex<Vec<Option<String>>>>,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                failures,
                seen_attempt_headers: Arc::default(),
            }
        }
    }

    impl Service<Request<RequestBody>> for Flaky {
        type Response = Response<ResponseBody>;
        type Error = HttpError;
        type Future = BoxFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), HttpError>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_attempt_headers.lock().push(
                req.headers()
                    .get(RETRY_ATTEMPT_HEADER)
                    .map(|v| v.to_str().unwrap().to_owned()),
            );
            let fail = n < self.failures;
            Box::pin(async move {
                if fail {
                    Err(HttpError::Transport("connection reset".into()))
                } else {
                    let body = Full::new(Bytes::from_static(b"ok"))
                        .map_err(|never| match never {})
                        .boxed();
                    Ok(Response::new(body))
                }
            })
        }
    }

    fn config(max_retries: usize) -> RetryConfig {
        RetryConfig {
            max_retries,
            backoff: ExponentialBackoff::fast(),
            ..RetryConfig::default()
        }
    }

    fn request(body: RequestBody) -> Request<RequestBody> {
        Request::post("http://example.test/").body(body).unwrap()
    }

    #[tokio::test]
    async fn retries_transport_errors_until_success() {
        let inner = Flaky::new(2);
        let svc = RetryLayer::new(config(2)).layer(inner.clone());

        let resp = svc.oneshot(request(RequestBody::from("payload"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *inner.seen_attempt_headers.lock(),
            vec![None, Some("1".to_owned()), Some("2".to_owned())]
        );
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let inner = Flaky::new(5);
        let svc = RetryLayer::new(config(2)).layer(inner.clone());

        let err = svc.oneshot(request(RequestBody::from("payload"))).await.unwrap_err();
        assert!(matches!(err, HttpError::Transport(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn one_shot_body_is_never_retried() {
        let inner = Flaky::new(1);
        let svc = RetryLayer::new(config(5)).layer(inner.clone());

        let stream = RequestBody::from_stream(Full::new(Bytes::from_static(b"stream")));
        let err = svc.oneshot(request(stream)).await.unwrap_err();
        assert!(matches!(err, HttpError::Transport(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_or_unknown_host_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = tower::service_fn(move |_req: Request<RequestBody>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Response<ResponseBody>, _>(HttpError::Connect("connection refused".into())) }
        });
        let svc = RetryLayer::new(config(3)).layer(tower::util::BoxCloneService::new(inner));

        let err = svc.oneshot(request(RequestBody::from("payload"))).await.unwrap_err();
        assert!(matches!(err, HttpError::Connect(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_not_retried_by_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = tower::service_fn(move |_req: Request<RequestBody>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Response<ResponseBody>, _>(HttpError::Timeout(Duration::from_millis(5))) }
        });
        let svc = RetryLayer::new(config(3)).layer(tower::util::BoxCloneService::new(inner));

        let err = svc.oneshot(request(RequestBody::empty())).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_configured_status() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = tower::service_fn(move |_req: Request<RequestBody>| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let status = if n == 0 { 503 } else { 200 };
                let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed();
                Ok::<_, HttpError>(Response::builder().status(status).body(body).unwrap())
            }
        });
        let cfg = RetryConfig {
            always_retry: HashSet::from([RetryTrigger::Status(503)]),
            ..config(1)
        };
        let svc = RetryLayer::new(cfg).layer(tower::util::BoxCloneService::new(inner));

        let resp = svc.oneshot(request(RequestBody::empty())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(300),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(calculate_backoff(&backoff, 0), Duration::from_millis(100));
        assert_eq!(calculate_backoff(&backoff, 1), Duration::from_millis(200));
        assert_eq!(calculate_backoff(&backoff, 5), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let backoff = ExponentialBackoff {
            jitter: true,
            ..ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1))
        };
        for _ in 0..50 {
            let d = calculate_backoff(&backoff, 0);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(125));
        }
    }

    #[test]
    fn bad_multiplier_is_sanitized() {
        let backoff = ExponentialBackoff {
            multiplier: f64::NAN,
            jitter: false,
            ..ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1))
        };
        assert_eq!(calculate_backoff(&backoff, 3), Duration::from_millis(10));
    }
}
