#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bytes::Bytes;
use common::{FlakyServer, init_tracing};
use http::Request;
use http_body_util::Full;
use http_transport::config::{SenderConfig, SessionConfig};
use http_transport::sender::{HttpMethod, HttpSender, MessageContext};
use http_transport::{HttpSession, RequestBody};

fn fast_retries(retries: usize) -> SessionConfig {
    SessionConfig {
        max_execute_retries: retries,
        retry_backoff_ms: 5,
        retry_backoff_max_ms: 20,
        timeout_ms: 5_000,
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn dropped_connections_are_retried_until_success() {
    init_tracing();
    let server = FlakyServer::start(2, "ok").await;

    let config = SenderConfig {
        url: Some(server.url("/flaky")),
        method: HttpMethod::Get,
        session: fast_retries(2),
        ..SenderConfig::default()
    };
    let sender = HttpSender::configure(config).unwrap();
    let result = sender.send_message("", &mut MessageContext::new()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.result, "ok");
    assert_eq!(server.accepted(), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_the_transport_error() {
    let server = FlakyServer::start(5, "never").await;

    let config = SenderConfig {
        url: Some(server.url("/flaky")),
        method: HttpMethod::Post,
        session: fast_retries(1),
        ..SenderConfig::default()
    };
    let sender = HttpSender::configure(config).unwrap();
    let err = sender
        .send_message("<payload/>", &mut MessageContext::new())
        .await
        .unwrap_err();

    assert!(err.is_transport(), "unexpected error: {err}");
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn streamed_body_is_sent_once() {
    let server = FlakyServer::start(1, "ok").await;
    let session = HttpSession::builder().config(fast_retries(3)).build().unwrap();

    let request = Request::post(server.url("/upload"))
        .body(RequestBody::from_stream(Full::new(Bytes::from_static(b"streamed"))))
        .unwrap();
    let err = session.send(request).await.unwrap_err();

    assert!(err.is_transport(), "unexpected error: {err}");
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn connection_is_released_after_reading() {
    let server = FlakyServer::start(0, "released").await;
    let session = HttpSession::builder().config(fast_retries(0)).build().unwrap();

    let request = Request::get(server.url("/r")).body(RequestBody::empty()).unwrap();
    let envelope = session.execute(request).await.unwrap();
    assert_eq!(session.pool_stats().leased(), 1);

    assert_eq!(envelope.text().await.unwrap(), "released");
    assert_eq!(session.pool_stats().leased(), 0);
}
