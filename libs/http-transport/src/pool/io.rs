use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

use super::{ConnectionSlot, OpenGuard, PoolStats};

/// Per-connection metadata attached to every response served over it.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub established_at: Instant,
    pub slot: Arc<ConnectionSlot>,
}

/// A pooled TCP stream.
///
/// Holds one connection permit for as long as the socket lives. When stale
/// checking is on and the stream has been idle longer than the threshold, the
/// next write first peeks the socket: EOF, an error, or unsolicited bytes mean
/// the peer is gone and the write fails with `ConnectionAborted`.
///
/// Once its [`ConnectionSlot`] is evicted the stream reads as EOF, so hyper
/// closes it even while it sits idle in the pool.
#[derive(Debug)]
pub struct PooledIo {
    io: TokioIo<TcpStream>,
    info: ConnectionInfo,
    proxied: bool,
    stale_after: Option<Duration>,
    last_activity: Instant,
    _permit: OwnedSemaphorePermit,
    _open: OpenGuard,
}

impl PooledIo {
    /// Wrap a freshly connected socket. `proxied` marks a plain-http
    /// connection to a forward proxy (requests go out in absolute form).
    #[must_use]
    pub fn new(
        stream: TcpStream,
        permit: OwnedSemaphorePermit,
        stats: &PoolStats,
        stale_after: Option<Duration>,
        proxied: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            io: TokioIo::new(stream),
            info: ConnectionInfo {
                established_at: now,
                slot: ConnectionSlot::new(),
            },
            proxied,
            stale_after,
            last_activity: now,
            _permit: permit,
            _open: stats.opened(),
        }
    }

    #[must_use]
    pub fn slot(&self) -> &Arc<ConnectionSlot> {
        &self.info.slot
    }

    /// Called before every write: an evicted connection refuses new
    /// exchanges, a live one becomes busy.
    fn begin_write(&self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.info.slot.is_evicted() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection evicted from pool",
            ));
        }
        self.check_stale(cx)?;
        self.info.slot.mark_busy();
        Ok(())
    }

    fn check_stale(&self, cx: &mut Context<'_>) -> io::Result<()> {
        let Some(threshold) = self.stale_after else {
            return Ok(());
        };
        if self.last_activity.elapsed() <= threshold {
            return Ok(());
        }

        let mut peeked = [0u8; 1];
        let mut buf = tokio::io::ReadBuf::new(&mut peeked);
        let stale = match self.io.inner().poll_peek(cx, &mut buf) {
            Poll::Pending => false,
            Poll::Ready(Ok(_) | Err(_)) => true,
        };
        if stale {
            tracing::debug!(
                idle_ms = self.last_activity.elapsed().as_millis(),
                "discarding stale pooled connection"
            );
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "stale pooled connection",
            ));
        }
        Ok(())
    }
}

impl Read for PooledIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.info.slot.is_evicted() {
            return Poll::Ready(Ok(()));
        }
        let polled = Pin::new(&mut this.io).poll_read(cx, buf);
        if polled.is_ready() {
            this.last_activity = Instant::now();
        } else {
            this.info.slot.park_reader(cx.waker());
        }
        polled
    }
}

impl Write for PooledIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.begin_write(cx)?;
        let polled = Pin::new(&mut this.io).poll_write(cx, buf);
        if let Poll::Ready(Ok(_)) = polled {
            this.last_activity = Instant::now();
        }
        polled
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.begin_write(cx)?;
        let polled = Pin::new(&mut this.io).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(_)) = polled {
            this.last_activity = Instant::now();
        }
        polled
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl Connection for PooledIo {
    fn connected(&self) -> Connected {
        let connected = Connected::new().extra(self.info.clone());
        if self.proxied {
            connected.proxy(true)
        } else {
            connected
        }
    }
}
