//! Client side of the upgrade handshake
//!
//! [`Dialer::dial`] resolves a `yamux://` URI, connects, sends the upgrade
//! request and waits for the server's `101` on the first yamux stream.
//!
//! The connect-and-negotiate attempt runs as its own task and races the
//! handshake timeout. When the timeout wins, the attempt is abandoned rather
//! than cancelled: it keeps running until its own I/O finishes, and if it
//! ends up with a session nobody is waiting for, it closes that session.
//!
//! # Example
//!
//! ```ignore
//! use http::HeaderMap;
//! use yamux_upgrade::{Config, Dialer};
//!
//! let dialer = Dialer::new(Config::default());
//! let (mut session, response) = dialer.dial("yamux://example.com/rpc", &HeaderMap::new()).await?;
//! let mut stream = session.accept().await?;
//! ```

use std::io;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Response};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::Config;
use crate::conn::RawConnection;
use crate::error::{Error, Result};
use crate::handshake;
use crate::mux::{MuxConfig, Session};
use crate::target::ConnectionTarget;

/// Outcome of one handshake attempt
type Established = (Session, Response<()>);

/// Dials `yamux://` URIs
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    config: Config,
}

impl Dialer {
    /// Create a new dialer with the given configuration
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Get the dialer configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect to `uri` and negotiate a yamux session
    ///
    /// Caller `headers` are added to the upgrade request; `Upgrade` and
    /// `Connection` are reserved. On success the session is in the role that
    /// accepts streams opened by the server, and the returned response is
    /// the server's `101`.
    ///
    /// # Errors
    ///
    /// URI and header errors are returned before any connection is made.
    /// [`Error::HandshakeTimeout`] means the configured timeout elapsed first;
    /// transport and bad-handshake errors come from the attempt itself, which
    /// has already closed its connection.
    pub async fn dial(&self, uri: &str, headers: &HeaderMap) -> Result<Established> {
        let target = ConnectionTarget::parse(uri)?;
        let request =
            handshake::build_request(&target, headers, self.config.cookies.as_deref())?;
        let wire = handshake::encode_request(&request);

        let handshake_timeout = self.config.effective_handshake_timeout();
        let tcp_timeout = self.config.effective_tcp_timeout();
        let mux = self.config.mux.clone();
        let addr = target.dial_address();

        tracing::debug!(%target, ?handshake_timeout, "dialing");

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = establish(&addr, wire, tcp_timeout, mux).await;
            if let Err(Ok((session, _))) = tx.send(outcome) {
                tracing::debug!(%addr, "closing session from an abandoned handshake");
                session.close().await;
            }
        });

        tokio::select! {
            outcome = rx => match outcome {
                Ok(Ok(established)) => {
                    tracing::info!(%target, "yamux session established");
                    Ok(established)
                }
                Ok(Err(error)) => {
                    tracing::debug!(%target, %error, "handshake failed");
                    Err(error)
                }
                Err(_) => Err(Error::Transport(io::Error::other(
                    "handshake task ended without a result",
                ))),
            },
            _ = tokio::time::sleep(handshake_timeout) => {
                tracing::warn!(%target, ?handshake_timeout, "handshake timed out");
                Err(Error::HandshakeTimeout)
            }
        }
    }
}

/// Dial `uri` with the default configuration
pub async fn dial(uri: &str, headers: &HeaderMap) -> Result<Established> {
    Dialer::default().dial(uri, headers).await
}

/// Connect, send the request and negotiate the session
///
/// Every path that does not hand the session back closes what it opened:
/// the TCP stream before a session exists, the session after.
async fn establish(
    addr: &str,
    request: Bytes,
    tcp_timeout: Duration,
    mux: MuxConfig,
) -> Result<Established> {
    let mut tcp = match tokio::time::timeout(tcp_timeout, TcpStream::connect(addr)).await {
        Ok(connected) => connected?,
        Err(_) => {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "tcp connect timed out",
            )));
        }
    };
    tcp.set_nodelay(true).ok();
    tracing::trace!(%addr, "tcp connected");

    if let Err(error) = write_request(&mut tcp, &request).await {
        let _ = RawConnection::new(tcp).close().await;
        return Err(error.into());
    }

    let mut session = Session::accept_session(RawConnection::new(tcp), mux);
    match negotiate(&mut session).await {
        Ok(response) => Ok((session, response)),
        Err(error) => {
            session.close().await;
            Err(error)
        }
    }
}

async fn write_request(tcp: &mut TcpStream, request: &[u8]) -> io::Result<()> {
    tcp.write_all(request).await?;
    tcp.flush().await
}

/// Accept the handshake stream and verify the response it carries
async fn negotiate(session: &mut Session) -> Result<Response<()>> {
    let mut stream = match session.accept().await {
        Ok(stream) => stream,
        Err(Error::SessionClosed) => {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the handshake stream opened",
            )));
        }
        Err(error) => return Err(error),
    };

    let response = handshake::read_response(&mut stream).await?;
    handshake::verify_response(&response)?;
    Ok(response)
}
