//! # yamux-upgrade: HTTP/1.1 upgrade to a yamux session
//!
//! A client and server that start out speaking plain HTTP/1.1 over one TCP
//! connection switch, with a single request/response pair, to a yamux
//! multiplexed session on the same connection.
//!
//! - The client ([`Dialer`]) sends `GET` with `Upgrade: yamux`, immediately
//!   starts a yamux session in server mode on the raw connection, and reads
//!   the `101 Switching Protocols` response from the first stream the server
//!   opens. The whole exchange races a handshake timeout.
//! - The server ([`upgrade`]) checks the request, hijacks the raw connection
//!   from its HTTP layer, starts a yamux session in client mode, and writes
//!   the response on a freshly opened stream.
//!
//! Once a [`Session`] exists it owns the connection; closing or dropping the
//! session is the only way the connection is released.
//!
//! ## Example
//!
//! ```ignore
//! use http::HeaderMap;
//! use yamux_upgrade::{Config, Dialer, UpgradeServer};
//!
//! // Server
//! let server = UpgradeServer::default();
//! server.serve(listener, |mut session, _request| async move {
//!     let stream = session.open().await;
//!     // use the stream...
//! }).await?;
//!
//! // Client
//! let dialer = Dialer::new(Config::default());
//! let (mut session, _response) = dialer.dial("yamux://localhost:8080/", &HeaderMap::new()).await?;
//! let stream = session.accept().await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod client;
pub mod conn;
pub mod cookie;
pub mod error;
pub mod handshake;
pub mod http1;
pub mod mux;
pub mod server;
pub mod target;

pub use client::{Dialer, dial};
pub use conn::RawConnection;
pub use cookie::{Cookie, CookieSource, MemoryCookieJar};
pub use error::{Error, Result};
pub use handshake::is_upgrade_request;
pub use http1::UpgradeServer;
pub use mux::{MuxConfig, MuxStream, Session};
pub use server::{BufferedResponse, Hijack, ResponseWriter, upgrade};
pub use target::ConnectionTarget;

/// URI scheme accepted by the dialer
pub const SCHEME: &str = "yamux";

/// Encrypted-variant scheme, recognized and rejected
pub const SECURE_SCHEME: &str = "yamuxs";

/// Value of the `Upgrade` header on both sides of the negotiation
pub const UPGRADE_TOKEN: &str = "yamux";

/// Port dialed when the URI has none (plain HTTP)
pub const DEFAULT_PORT: u16 = 80;

/// Handshake timeout used when the configured one is zero
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP connect bound used when the configured one is zero
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Configuration for the dialing side of the handshake
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use yamux_upgrade::Config;
///
/// let config = Config::builder()
///     .handshake_timeout(Duration::from_secs(5))
///     .tcp_timeout(Duration::from_secs(30))
///     .build();
/// assert_eq!(config.effective_handshake_timeout(), Duration::from_secs(5));
/// ```
#[derive(Clone, Default)]
pub struct Config {
    /// Bound on the whole handshake: connect, negotiate and verify
    /// (zero = [`DEFAULT_HANDSHAKE_TIMEOUT`])
    pub handshake_timeout: Duration,
    /// Bound on the TCP connect step only (zero = [`DEFAULT_TCP_TIMEOUT`])
    pub tcp_timeout: Duration,
    /// Multiplexer tuning, passed through unexamined
    pub mux: MuxConfig,
    /// Source of cookies attached to the upgrade request
    pub cookies: Option<Arc<dyn CookieSource>>,
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// The handshake timeout with the zero default applied
    pub fn effective_handshake_timeout(&self) -> Duration {
        if self.handshake_timeout.is_zero() {
            DEFAULT_HANDSHAKE_TIMEOUT
        } else {
            self.handshake_timeout
        }
    }

    /// The TCP connect bound with the zero default applied
    pub fn effective_tcp_timeout(&self) -> Duration {
        if self.tcp_timeout.is_zero() {
            DEFAULT_TCP_TIMEOUT
        } else {
            self.tcp_timeout
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("tcp_timeout", &self.tcp_timeout)
            .field("cookies", &self.cookies.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for dialer configuration
#[derive(Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the overall handshake timeout (zero restores the default)
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the TCP connect bound (zero restores the default)
    pub fn tcp_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp_timeout = timeout;
        self
    }

    /// Set the multiplexer configuration
    pub fn mux(mut self, mux: MuxConfig) -> Self {
        self.config.mux = mux;
        self
    }

    /// Attach cookies from `source` to every upgrade request
    pub fn cookies(mut self, source: Arc<dyn CookieSource>) -> Self {
        self.config.cookies = Some(source);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::client::Dialer;
    pub use crate::error::{Error, Result};
    pub use crate::mux::{MuxStream, Session};
    pub use crate::server::{ResponseWriter, upgrade};
}
