//! Error types for the upgrade handshake
//!
//! Both directions of the handshake share one closed set of failure kinds so
//! callers can match on them instead of comparing messages.

use std::io;

use http::HeaderName;
use thiserror::Error;

/// Result type alias for handshake operations
pub type Result<T> = std::result::Result<T, Error>;

/// Handshake error kinds
#[derive(Debug, Error)]
pub enum Error {
    /// The connection URI is not a `yamux://` URI, or carries user info
    #[error("malformed yamux uri")]
    MalformedUri,

    /// The URI scheme is recognized but not supported
    #[error("scheme `{0}` is not supported yet")]
    UnsupportedScheme(&'static str),

    /// A caller-supplied header collides with a negotiation header
    #[error("header `{0}` is reserved for the upgrade negotiation")]
    DuplicateHeader(HeaderName),

    /// The inbound request is not an eligible upgrade request
    #[error("not an upgrade request")]
    NotUpgradeRequest,

    /// The serving context cannot hand over its raw connection
    #[error("webserver doesn't support hijacking")]
    HijackUnsupported,

    /// Dial, read or write failure on the underlying connection
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The upgrade response did not match the negotiation
    #[error("bad handshake: {0}")]
    BadHandshake(&'static str),

    /// The handshake did not complete within the configured timeout
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Inbound HTTP could not be parsed by the serving context
    #[error("invalid HTTP: {0}")]
    InvalidHttp(&'static str),

    /// The multiplexed session is no longer running
    #[error("multiplexed session closed")]
    SessionClosed,

    /// The multiplexer refused an operation
    #[error("multiplexer error: {0}")]
    Mux(String),
}

impl Error {
    /// Returns true if the caller gave up waiting for the handshake
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::HandshakeTimeout)
    }

    /// Returns true if the network itself failed
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Transport(e) => e,
            Error::HandshakeTimeout => {
                io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")
            }
            Error::SessionClosed => {
                io::Error::new(io::ErrorKind::NotConnected, "multiplexed session closed")
            }
            other => io::Error::other(other.to_string()),
        }
    }
}
