//! Minimal HTTP/1.1 serving context with hijack support
//!
//! [`read_request`] reads one request head off a connection and hands back
//! the request together with an [`Http1Responder`] that still owns the
//! connection. The responder either writes an ordinary error response or
//! gives the connection up to [`upgrade`](crate::upgrade).
//!
//! [`UpgradeServer`] puts both together behind a `TcpListener`.

use std::fmt;
use std::future::Future;
use std::io;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Request, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::conn::RawConnection;
use crate::error::{Error, Result};
use crate::handshake::{self, MAX_HEADER_SIZE, MAX_HEADERS};
use crate::mux::{MuxConfig, Session};
use crate::server::{self, Hijack, ResponseWriter};

/// Read one HTTP/1.1 request head from `io`
///
/// Any bytes read past the head stay with the returned responder and are
/// replayed to whoever hijacks the connection. A head that cannot be parsed
/// gets a best-effort plain-text `400` before the error is returned.
pub async fn read_request<S>(mut io: S) -> Result<(Request<()>, Http1Responder)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match read_head(&mut io).await {
        Ok((request, leftover)) => {
            let conn = RawConnection::with_prefix(io, leftover);
            Ok((request, Http1Responder::new(conn)))
        }
        Err(Error::InvalidHttp(reason)) => {
            let mut responder = Http1Responder::new(RawConnection::new(io));
            responder.write_error(StatusCode::BAD_REQUEST, reason).await;
            Err(Error::InvalidHttp(reason))
        }
        Err(error) => Err(error),
    }
}

async fn read_head<S>(io: &mut S) -> Result<(Request<()>, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::InvalidHttp("request too large"));
        }

        let n = io.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the request head",
            )));
        }

        if let Some((request, consumed)) = parse_request(&buf)? {
            return Ok((request, buf.split_off(consumed).freeze()));
        }
    }
}

/// Parse a complete request head, returning it and its length in bytes
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request<()>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let version = match req.version {
                Some(1) => Version::HTTP_11,
                _ => Version::HTTP_10,
            };

            let mut builder = Request::builder()
                .method(req.method.unwrap_or("GET"))
                .uri(req.path.unwrap_or("/"))
                .version(version);
            for header in req.headers.iter() {
                builder = builder.header(header.name, header.value);
            }

            let request = builder
                .body(())
                .map_err(|_| Error::InvalidHttp("invalid request head"))?;
            Ok(Some((request, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(httparse::Error::TooManyHeaders) => Err(Error::InvalidHttp("too many headers")),
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP request")),
    }
}

/// Response side of an HTTP/1.1 connection
///
/// Holds the connection until it is hijacked; afterwards every write is a
/// no-op because the connection belongs to someone else.
pub struct Http1Responder {
    conn: Option<RawConnection>,
}

impl Http1Responder {
    fn new(conn: RawConnection) -> Self {
        Self { conn: Some(conn) }
    }

    /// Returns true once the connection has been hijacked
    pub fn is_hijacked(&self) -> bool {
        self.conn.is_none()
    }
}

impl Hijack for Http1Responder {
    fn hijack(&mut self) -> io::Result<RawConnection> {
        self.conn
            .take()
            .ok_or_else(|| io::Error::other("connection already hijacked"))
    }
}

impl ResponseWriter for Http1Responder {
    async fn write_error(&mut self, status: StatusCode, message: &str) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        let response = handshake::build_error_response(status, message);
        let written = async {
            conn.write_all(&response).await?;
            conn.flush().await
        };
        if let Err(error) = written.await {
            tracing::debug!(%error, %status, "failed to write error response");
        }
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        Some(self)
    }
}

impl fmt::Debug for Http1Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Responder")
            .field("hijacked", &self.is_hijacked())
            .finish()
    }
}

/// Upgrade server over plain TCP
///
/// Every accepted connection gets one request; eligible upgrades become
/// sessions, anything else gets a plain-text `400`.
#[derive(Clone, Default)]
pub struct UpgradeServer {
    mux: MuxConfig,
    headers: HeaderMap,
}

impl UpgradeServer {
    /// Create a new server with the given multiplexer configuration
    pub fn new(mux: MuxConfig) -> Self {
        Self {
            mux,
            headers: HeaderMap::new(),
        }
    }

    /// Extra headers sent on every `101` response
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Upgrade one TCP connection
    ///
    /// Returns the session and the request that asked for it.
    pub async fn accept(&self, stream: TcpStream) -> Result<(Session, Request<()>)> {
        stream.set_nodelay(true).ok();
        let (request, mut responder) = read_request(stream).await?;

        match server::upgrade(&request, &mut responder, &self.headers, self.mux.clone()).await {
            Ok(session) => Ok((session, request)),
            Err(Error::NotUpgradeRequest) => {
                responder
                    .write_error(StatusCode::BAD_REQUEST, "not an upgrade request")
                    .await;
                Err(Error::NotUpgradeRequest)
            }
            Err(error) => Err(error),
        }
    }

    /// Serve upgrades from a TCP listener
    ///
    /// Calls `handler` with each established session. Runs until accepting
    /// from the listener fails.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tokio::net::TcpListener;
    /// use yamux_upgrade::UpgradeServer;
    ///
    /// let listener = TcpListener::bind("0.0.0.0:8080").await?;
    /// UpgradeServer::default()
    ///     .serve(listener, |mut session, request| async move {
    ///         println!("session for {}", request.uri());
    ///         while let Ok(stream) = session.accept().await {
    ///             // handle stream...
    ///         }
    ///     })
    ///     .await?;
    /// ```
    pub async fn serve<F, Fut>(&self, listener: TcpListener, handler: F) -> Result<()>
    where
        F: Fn(Session, Request<()>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "serving yamux upgrades");
        }

        loop {
            let (stream, addr) = listener.accept().await?;

            let handler = handler.clone();
            let server = self.clone();

            tokio::spawn(async move {
                match server.accept(stream).await {
                    Ok((session, request)) => {
                        tracing::debug!(%addr, uri = %request.uri(), "session established");
                        handler(session, request).await;
                    }
                    Err(error) => {
                        tracing::warn!(%addr, %error, "upgrade failed");
                    }
                }
            });
        }
    }
}

impl fmt::Debug for UpgradeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeServer")
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
