//! Multiplexed session over a raw connection
//!
//! This module adapts `tokio-yamux` to the small surface the handshake needs:
//! open a session in either role, open or accept logical streams, and close.
//!
//! A yamux session only makes progress while it is polled, so every
//! [`Session`] owns a driver task that polls it and forwards inbound streams.
//! The driver owns the raw connection. Closing or dropping the [`Session`]
//! asks the driver to shut down: it first writes out every frame the streams
//! have already queued, then sends GoAway, and releases the connection once
//! the peer answers or [`CLOSE_GRACE`] passes.
//!
//! # Example
//!
//! ```ignore
//! use yamux_upgrade::mux::{MuxConfig, Session};
//!
//! let mut session = Session::accept_session(conn, MuxConfig::default());
//! let stream = session.accept().await?;
//! ```

use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_yamux::Control;
use tokio_yamux::session::Session as YamuxSession;
use tokio_yamux::stream::StreamHandle;

use crate::conn::{RawConnection, WriteStall};
use crate::error::{Error, Result};

/// Multiplexer tuning, passed through to `tokio-yamux` unexamined
pub type MuxConfig = tokio_yamux::config::Config;

/// A logical stream within a session
pub type MuxStream = StreamHandle;

/// Upper bound on a graceful shutdown: draining queued frames, sending
/// GoAway and waiting for the peer's answer
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Which side of the yamux protocol a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Initiator (odd stream ids)
    Client,
    /// Responder (even stream ids)
    Server,
}

/// A running multiplexed session
///
/// The session owns the raw connection. Closing the session, or dropping it,
/// is the only way the connection gets released. Either way, data already
/// written to its streams is delivered before the connection goes away.
pub struct Session {
    mode: Mode,
    control: Control,
    incoming: mpsc::UnboundedReceiver<MuxStream>,
    shutdown: oneshot::Sender<()>,
    driver: JoinHandle<()>,
}

impl Session {
    /// Start a session in the role that initiates logical streams
    pub fn open_session(conn: RawConnection, config: MuxConfig) -> Self {
        let stall = conn.write_stall();
        Self::spawn(YamuxSession::new_client(conn, config), stall, Mode::Client)
    }

    /// Start a session in the role that expects to accept the first stream
    pub fn accept_session(conn: RawConnection, config: MuxConfig) -> Self {
        let stall = conn.write_stall();
        Self::spawn(YamuxSession::new_server(conn, config), stall, Mode::Server)
    }

    fn spawn(inner: YamuxSession<RawConnection>, stall: WriteStall, mode: Mode) -> Self {
        let control = inner.control();
        let (tx, incoming) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();

        let driver = tokio::spawn(drive(inner, stall, mode, tx, shutdown_rx));

        Self {
            mode,
            control,
            incoming,
            shutdown,
            driver,
        }
    }

    /// Which side of the protocol this session plays
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Open a new logical stream
    pub async fn open(&mut self) -> Result<MuxStream> {
        let mut control = self.control.clone();
        control
            .open_stream()
            .await
            .map_err(|e| Error::Mux(format!("{e:?}")))
    }

    /// Wait for the peer to open a logical stream
    ///
    /// Fails with [`Error::SessionClosed`] once the connection is gone.
    pub async fn accept(&mut self) -> Result<MuxStream> {
        self.incoming.recv().await.ok_or(Error::SessionClosed)
    }

    /// Returns true while the driver is still running
    pub fn is_open(&self) -> bool {
        !self.driver.is_finished()
    }

    /// Close the session and the connection it owns
    ///
    /// Waits until queued stream data has been written, GoAway has been sent
    /// and the connection released, or [`CLOSE_GRACE`] has passed.
    pub async fn close(self) {
        let Self {
            mode,
            shutdown,
            driver,
            ..
        } = self;

        let _ = shutdown.send(());
        if let Err(error) = driver.await {
            tracing::debug!(?mode, %error, "session driver did not finish cleanly");
        }
    }
}

/// Poll the yamux session until it ends or a shutdown is requested
///
/// Dropping the [`Session`] drops `shutdown`, which counts as a request.
async fn drive(
    mut inner: YamuxSession<RawConnection>,
    stall: WriteStall,
    mode: Mode,
    tx: mpsc::UnboundedSender<MuxStream>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            next = inner.next() => match next {
                Some(Ok(stream)) => {
                    if tx.send(stream).is_err() {
                        tracing::trace!(?mode, "inbound stream dropped, session released");
                    }
                }
                Some(Err(error)) => {
                    tracing::debug!(?mode, ?error, "session driver stopped");
                    return;
                }
                None => {
                    tracing::trace!(?mode, "session driver finished");
                    return;
                }
            },
            _ = &mut shutdown => break,
        }
    }

    drop(tx);
    if tokio::time::timeout(CLOSE_GRACE, graceful_shutdown(&mut inner, &stall))
        .await
        .is_err()
    {
        tracing::debug!(?mode, "session did not shut down within the grace period");
    }
    tracing::trace!(?mode, "session driver finished");
}

/// Flush queued frames, send GoAway, then wait for the peer to answer
async fn graceful_shutdown(inner: &mut YamuxSession<RawConnection>, stall: &WriteStall) {
    // GoAway discards whatever is still queued, so drain first.
    if !poll_fn(|cx| poll_drained(&mut *inner, stall, cx)).await {
        return;
    }

    if let Err(error) = poll_fn(|cx| Poll::Ready(inner.shutdown(cx))).await {
        tracing::debug!(?error, "failed to send GoAway");
        return;
    }

    // Streams the peer opens from now on are refused by dropping them.
    while let Some(next) = inner.next().await {
        if next.is_err() {
            break;
        }
    }
}

/// Records whether the session woke itself while being polled
struct WakeFlag {
    woken: AtomicBool,
    task: Waker,
}

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        self.task.wake_by_ref();
    }
}

/// Ready once the session has handed every queued frame to the socket
///
/// Resolves to false if the session ended on its own meanwhile. A pending
/// poll only counts as drained when the session did not schedule more work
/// for itself and the socket accepted everything written to it.
fn poll_drained(
    inner: &mut YamuxSession<RawConnection>,
    stall: &WriteStall,
    cx: &mut Context<'_>,
) -> Poll<bool> {
    loop {
        let flag = Arc::new(WakeFlag {
            woken: AtomicBool::new(false),
            task: cx.waker().clone(),
        });
        let waker = Waker::from(flag.clone());
        let mut session_cx = Context::from_waker(&waker);

        match inner.poll_next_unpin(&mut session_cx) {
            // Refused: dropping the handle resets the stream on the next poll.
            Poll::Ready(Some(Ok(_late))) => continue,
            Poll::Ready(Some(Err(error))) => {
                tracing::debug!(?error, "session failed while draining");
                return Poll::Ready(false);
            }
            Poll::Ready(None) => return Poll::Ready(false),
            Poll::Pending if flag.woken.load(Ordering::Acquire) || stall.is_stalled() => {
                return Poll::Pending;
            }
            Poll::Pending => return Poll::Ready(true),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Session::open_session(RawConnection::new(a), MuxConfig::default());
        let server = Session::accept_session(RawConnection::new(b), MuxConfig::default());
        (client, server)
    }

    #[tokio::test]
    async fn test_open_is_seen_by_accept() {
        let (mut client, mut server) = pair();
        assert_eq!(client.mode(), Mode::Client);
        assert_eq!(server.mode(), Mode::Server);

        let mut outbound = client.open().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();
        outbound.flush().await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_both_sides_can_open() {
        let (mut client, mut server) = pair();

        let mut from_server = server.open().await.unwrap();
        from_server.write_all(b"pong").await.unwrap();
        from_server.flush().await.unwrap();

        let mut at_client = client.accept().await.unwrap();
        let mut buf = [0u8; 4];
        at_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_close_ends_peer_accept() {
        let (client, mut server) = pair();
        client.close().await;

        let accepted = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .expect("peer noticed the close");
        assert!(matches!(accepted, Err(Error::SessionClosed)));
    }

    async fn write_and_release(session: &mut Session) {
        let mut outbound = session.open().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();
        outbound.flush().await.unwrap();
    }

    async fn read_ping(server: &mut Session) {
        let mut inbound = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .expect("stream arrived")
            .unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_close_delivers_written_data() {
        let (mut client, mut server) = pair();
        write_and_release(&mut client).await;
        client.close().await;

        read_ping(&mut server).await;
    }

    #[tokio::test]
    async fn test_drop_delivers_written_data() {
        let (mut client, mut server) = pair();
        write_and_release(&mut client).await;
        drop(client);

        read_ping(&mut server).await;
    }

    #[tokio::test]
    async fn test_close_finishes_within_grace() {
        let (mut client, _server) = pair();
        write_and_release(&mut client).await;

        let started = tokio::time::Instant::now();
        client.close().await;
        assert!(started.elapsed() <= CLOSE_GRACE + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_drop_releases_connection() {
        let (client, mut server) = pair();
        drop(client);

        let accepted = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .expect("peer noticed the drop");
        assert!(accepted.is_err());
    }
}
