//! Raw duplex connection handed between the handshake phases
//!
//! A [`RawConnection`] is owned by exactly one phase at a time: the dialer or
//! HTTP server while it is being established, the handshake code while the
//! negotiation bytes are exchanged, then the multiplexed session. Every
//! handoff is a move, so the connection is closed at most once and only by
//! its current owner.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Trait object for raw streams (type-erased AsyncRead + AsyncWrite)
trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// A type-erased byte connection
///
/// Bytes that an HTTP layer already pulled off the socket past the request
/// head are replayed before reading from the socket again.
pub struct RawConnection {
    inner: Box<dyn RawStream>,
    prefix: Option<Bytes>,
    stalled: WriteStall,
}

/// Shared view of whether the last write to a connection is still pending
///
/// Set while the socket refuses bytes, cleared once a write or flush
/// completes.
#[derive(Debug, Clone, Default)]
pub(crate) struct WriteStall(Arc<AtomicBool>);

impl WriteStall {
    pub(crate) fn is_stalled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn track<T>(&self, poll: Poll<T>) -> Poll<T> {
        self.0.store(poll.is_pending(), Ordering::Release);
        poll
    }
}

impl RawConnection {
    /// Wrap any `AsyncRead + AsyncWrite` stream
    pub fn new<S>(inner: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Box::new(inner),
            prefix: None,
            stalled: WriteStall::default(),
        }
    }

    /// Wrap a stream whose first bytes were already read into `prefix`
    pub fn with_prefix<S>(inner: S, prefix: Bytes) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Box::new(inner),
            prefix: (!prefix.is_empty()).then_some(prefix),
            stalled: WriteStall::default(),
        }
    }

    /// Number of replayed bytes not yet read
    pub fn buffered(&self) -> usize {
        self.prefix.as_ref().map_or(0, Bytes::len)
    }

    /// Handle for watching write backpressure after the connection moves
    pub(crate) fn write_stall(&self) -> WriteStall {
        self.stalled.clone()
    }

    /// Shut down the write side and release the connection
    pub async fn close(mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

impl AsyncRead for RawConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(prefix) = &mut self.prefix {
            let n = std::cmp::min(buf.remaining(), prefix.len());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);
            if prefix.is_empty() {
                self.prefix = None;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(self.inner.as_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for RawConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(self.inner.as_mut()).poll_write(cx, buf);
        self.stalled.track(poll)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(self.inner.as_mut()).poll_flush(cx);
        self.stalled.track(poll)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.inner.as_mut()).poll_shutdown(cx)
    }
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_prefix_is_replayed_first() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = RawConnection::with_prefix(client, Bytes::from_static(b"head"));
        assert_eq!(conn.buffered(), 4);

        server.write_all(b"tail").await.unwrap();

        let mut buf = [0u8; 8];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"headtail");
        assert_eq!(conn.buffered(), 0);
    }

    #[tokio::test]
    async fn test_prefix_split_across_small_reads() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = RawConnection::with_prefix(client, Bytes::from_static(b"abcdef"));

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        assert_eq!(conn.buffered(), 2);
    }

    #[tokio::test]
    async fn test_close_signals_eof_to_peer() {
        let (client, mut server) = tokio::io::duplex(64);
        let conn = RawConnection::new(client);
        conn.close().await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(server.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_stall_follows_backpressure() {
        let (client, mut server) = tokio::io::duplex(4);
        let mut conn = RawConnection::new(client);
        let stall = conn.write_stall();
        assert!(!stall.is_stalled());

        // The pipe holds four bytes; the fifth cannot be written yet.
        conn.write_all(b"abcd").await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            conn.write_all(b"e"),
        )
        .await;
        assert!(blocked.is_err());
        assert!(stall.is_stalled());

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        conn.write_all(b"e").await.unwrap();
        assert!(!stall.is_stalled());
    }

    #[test]
    fn test_empty_prefix_is_dropped() {
        let (client, _server) = tokio::io::duplex(8);
        let conn = RawConnection::with_prefix(client, Bytes::new());
        assert_eq!(conn.buffered(), 0);
    }
}
