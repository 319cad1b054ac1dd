use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use zeroize::Zeroizing;

use super::{ConnectionSlot, PoolSettings, PoolStats, PooledIo, SlotRegistry};
use crate::auth::ProxyAuthenticator;
use crate::error::{BoxError, ConnectFailure, ProxyAuthFailure};

/// Upper bound on a proxy's CONNECT response head.
const MAX_TUNNEL_RESPONSE: usize = 8 * 1024;

/// TCP connector under the hyper client.
///
/// Every connection holds a semaphore permit until its socket closes, so the
/// number of open connections never exceeds `max_connections`. At the cap an
/// idle connection, whatever its route, is evicted to make room; when every
/// connection is in use the connect waits for a permit inside the request
/// timeout.
#[derive(Clone)]
pub struct TransportConnector {
    settings: Arc<PoolSettings>,
    permits: Arc<Semaphore>,
    registry: Arc<SlotRegistry>,
    stats: PoolStats,
    proxy: Option<Arc<ProxyAuthenticator>>,
}

impl std::fmt::Debug for TransportConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnector")
            .field("max_connections", &self.settings.max_connections)
            .field("available_permits", &self.permits.available_permits())
            .field("proxy", &self.proxy.as_ref().map(|p| p.host()))
            .finish_non_exhaustive()
    }
}

impl TransportConnector {
    #[must_use]
    pub fn new(
        settings: Arc<PoolSettings>,
        stats: PoolStats,
        proxy: Option<Arc<ProxyAuthenticator>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_connections));
        Self {
            settings,
            permits,
            registry: Arc::default(),
            stats,
            proxy,
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, BoxError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }
        // an evicted connection hands its permit back once hyper drops it
        self.registry.evict_idle();
        Ok(self.permits.clone().acquire_owned().await?)
    }

    async fn connect(self, uri: Uri) -> Result<PooledIo, BoxError> {
        let permit = self.acquire().await?;

        let https = uri.scheme_str() == Some("https");
        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "uri has no host"))?
            .to_owned();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let (stream, proxied) = match &self.proxy {
            Some(proxy) if https => (self.open_tunnel(proxy, &host, port).await?, false),
            Some(proxy) => (self.dial(proxy.host(), proxy.port()).await?, true),
            None => (self.dial(&host, port).await?, false),
        };

        tracing::debug!(host = %host, port, proxied, "opened connection");
        let stale_after = self
            .settings
            .stale_checking
            .then_some(self.settings.stale_timeout);
        let io = PooledIo::new(stream, permit, &self.stats, stale_after, proxied);
        self.registry.register(io.slot());
        if let Some(ttl) = self.settings.time_to_live {
            schedule_retirement(io.slot(), ttl);
        }
        Ok(io)
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, BoxError> {
        let Some(limit) = self.settings.connect_timeout else {
            return resolve_and_connect(host, port).await;
        };
        tokio::time::timeout(limit, resolve_and_connect(host, port))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                )
            })?
    }

    /// Establish a CONNECT tunnel through the proxy to `host:port`.
    ///
    /// A 407 without credentials attached is answered once by reconnecting
    /// with `Proxy-Authorization`; the proxy closes the first socket anyway
    /// on most implementations.
    async fn open_tunnel(
        &self,
        proxy: &ProxyAuthenticator,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, BoxError> {
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        loop {
            let mut stream = self.dial(proxy.host(), proxy.port()).await?;
            let header = proxy.cached_header();

            let mut request = Zeroizing::new(Vec::with_capacity(256));
            request.extend_from_slice(
                format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n").as_bytes(),
            );
            if let Some(value) = &header {
                request.extend_from_slice(b"Proxy-Authorization: ");
                request.extend_from_slice(value.as_bytes());
                request.extend_from_slice(b"\r\n");
            }
            request.extend_from_slice(b"\r\n");
            stream.write_all(&request).await?;

            let status_line = read_response_head(&mut stream).await?;
            let status = parse_status(&status_line)?;

            match status {
                200..=299 => {
                    tracing::debug!(proxy_host = proxy.host(), target = %authority, "proxy tunnel established");
                    return Ok(stream);
                }
                407 if proxy.on_challenge(header.is_some()) => {}
                407 => {
                    tracing::warn!(proxy_host = proxy.host(), target = %authority, "proxy rejected tunnel credentials");
                    return Err(Box::new(ProxyAuthFailure(status_line)));
                }
                _ => {
                    return Err(Box::new(io::Error::other(format!(
                        "proxy refused tunnel to {authority}: {status_line}"
                    ))));
                }
            }
        }
    }
}

/// Resolve `host` and connect to the first address that accepts.
///
/// A name that does not resolve and a refusal on every address become
/// [`ConnectFailure`]; other socket errors pass through unchanged.
async fn resolve_and_connect(host: &str, port: u16) -> Result<TcpStream, BoxError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ConnectFailure::UnknownHost {
            host: host.to_owned(),
            source,
        })?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    let err: BoxError = match last_err {
        None => {
            return Err(Box::new(ConnectFailure::UnknownHost {
                host: host.to_owned(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
            }));
        }
        Some(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Box::new(ConnectFailure::Refused {
                authority: format!("{host}:{port}"),
                source: e,
            })
        }
        Some(e) => Box::new(e),
    };
    Err(err)
}

/// Retire the connection once `ttl` has passed. The timer only holds a weak
/// reference, so a connection closed earlier is not kept alive.
fn schedule_retirement(slot: &Arc<ConnectionSlot>, ttl: std::time::Duration) {
    let slot = Arc::downgrade(slot);
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if let Some(slot) = slot.upgrade() {
            slot.retire();
        }
    });
}

/// Read until the blank line ending the response head; returns the status line.
async fn read_response_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_TUNNEL_RESPONSE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy response head too large",
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed connection during tunnel setup",
            ));
        }
        head.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&head);
    Ok(text.lines().next().unwrap_or_default().trim().to_owned())
}

fn parse_status(status_line: &str) -> io::Result<u16> {
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed proxy response: {status_line}"),
            )
        })
}

impl tower::Service<Uri> for TransportConnector {
    type Response = PooledIo;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<PooledIo, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}
