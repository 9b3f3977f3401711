//! Server side of the upgrade handshake
//!
//! [`upgrade`] runs entirely on the request-handling task. It checks the
//! request, takes the raw connection away from the HTTP layer, starts a yamux
//! session in the role that opens streams, and writes the `101` response on
//! the session's first stream.
//!
//! The HTTP layer is abstracted by two traits: [`ResponseWriter`] for the
//! ordinary (best-effort) error path and [`Hijack`] for serving contexts that
//! can give up their socket.
//!
//! # Example
//!
//! ```ignore
//! use yamux_upgrade::{http1, upgrade, MuxConfig};
//!
//! let (request, mut responder) = http1::read_request(tcp).await?;
//! let mut session = upgrade(&request, &mut responder, &HeaderMap::new(), MuxConfig::default()).await?;
//! let stream = session.open().await?;
//! ```

use std::io;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Request, StatusCode};
use tokio::io::AsyncWriteExt;

use crate::conn::RawConnection;
use crate::error::{Error, Result};
use crate::handshake;
use crate::mux::{MuxConfig, Session};

/// Takes exclusive ownership of a serving context's raw connection
pub trait Hijack {
    /// Move the connection out of the HTTP layer
    ///
    /// After a successful call the HTTP layer must not touch the connection
    /// again; a second call fails.
    fn hijack(&mut self) -> io::Result<RawConnection>;
}

/// The response side of a serving context
#[allow(async_fn_in_trait)]
pub trait ResponseWriter {
    /// Write a complete plain-text error response, best effort
    async fn write_error(&mut self, status: StatusCode, message: &str);

    /// The hijack capability, if this context has one
    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        None
    }
}

/// Upgrade an HTTP request to a yamux session
///
/// `extra` headers are added to the `101` response, with control bytes in
/// their values replaced by spaces.
///
/// # Errors
///
/// - [`Error::NotUpgradeRequest`] if the request is not an eligible upgrade;
///   nothing is written and the connection stays with the HTTP layer.
/// - [`Error::DuplicateHeader`] if `extra` carries `Upgrade` or `Connection`;
///   checked before the connection is hijacked.
/// - [`Error::HijackUnsupported`] if the serving context cannot hijack; a
///   `500` is written through `writer`.
/// - [`Error::Transport`] if hijacking or writing the response fails. Once a
///   session exists it is closed before the error is returned.
pub async fn upgrade<B, W>(
    request: &Request<B>,
    writer: &mut W,
    extra: &HeaderMap,
    mux: MuxConfig,
) -> Result<Session>
where
    W: ResponseWriter,
{
    if !handshake::is_upgrade_request(request) {
        return Err(Error::NotUpgradeRequest);
    }

    let response = handshake::build_response(extra)?;

    let hijacked = writer.hijacker().map(|hijacker| hijacker.hijack());

    let conn = match hijacked {
        Some(Ok(conn)) => conn,
        None => {
            writer
                .write_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "webserver doesn't support hijacking",
                )
                .await;
            return Err(Error::HijackUnsupported);
        }
        Some(Err(error)) => {
            writer
                .write_error(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string())
                .await;
            return Err(Error::Transport(error));
        }
    };
    tracing::debug!(uri = %request.uri(), "connection hijacked");

    // From here on the session owns the connection.
    let mut session = Session::open_session(conn, mux);
    match send_response(&mut session, &response).await {
        Ok(()) => {
            tracing::debug!(uri = %request.uri(), "upgrade complete");
            Ok(session)
        }
        Err(error) => {
            tracing::debug!(uri = %request.uri(), %error, "upgrade failed after hijack");
            session.close().await;
            Err(error)
        }
    }
}

async fn send_response(session: &mut Session, response: &[u8]) -> Result<()> {
    let mut stream = session.open().await?;
    stream.write_all(response).await?;
    stream.flush().await?;
    Ok(())
}

/// A response writer with no raw connection behind it
///
/// Records the error response instead of sending it. Useful for serving
/// contexts that multiplex requests themselves and so can never hijack.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    body: BytesMut,
}

impl BufferedResponse {
    /// Create an empty response
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of the written response, if any
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Body of the written response
    pub fn body(&self) -> Bytes {
        self.body.clone().freeze()
    }
}

impl ResponseWriter for BufferedResponse {
    async fn write_error(&mut self, status: StatusCode, message: &str) {
        self.status = Some(status);
        self.body.clear();
        self.body.extend_from_slice(message.as_bytes());
        self.body.extend_from_slice(b"\n");
    }
}
