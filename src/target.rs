//! Connection URI parsing
//!
//! A connection URI has the shape `yamux://host[:port][/path][?query]`.
//! Only the authority is checked for user info; host syntax is left to the
//! TCP dial.

use std::fmt;

use crate::error::{Error, Result};
use crate::{DEFAULT_PORT, SCHEME, SECURE_SCHEME};

/// Scheme of a connection URI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain `yamux://` over unencrypted HTTP/1.1
    Yamux,
}

impl Scheme {
    /// The scheme as it appears in a URI
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Yamux => SCHEME,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed connection URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    scheme: Scheme,
    host: String,
    path: String,
    query: String,
}

impl ConnectionTarget {
    /// Parse a connection URI
    ///
    /// # Example
    ///
    /// ```
    /// use yamux_upgrade::target::ConnectionTarget;
    ///
    /// let target = ConnectionTarget::parse("yamux://example.com:8080/rpc?v=2").unwrap();
    /// assert_eq!(target.host(), "example.com:8080");
    /// assert_eq!(target.path(), "/rpc");
    /// assert_eq!(target.query(), "v=2");
    /// ```
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = match uri.split_once("://") {
            Some((SCHEME, rest)) => rest,
            Some((SECURE_SCHEME, _)) => return Err(Error::UnsupportedScheme(SECURE_SCHEME)),
            _ => return Err(Error::MalformedUri),
        };

        // A fragment never reaches the request line, so it cannot be honored.
        if rest.contains('#') {
            return Err(Error::MalformedUri);
        }

        let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        if authority.contains('@') {
            return Err(Error::MalformedUri);
        }

        Ok(Self {
            scheme: Scheme::Yamux,
            host: authority.to_string(),
            path: path.to_string(),
            query: query.to_string(),
        })
    }

    /// The URI scheme
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The authority as written in the URI, port included if present
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The host without any port
    pub fn hostname(&self) -> &str {
        match self.explicit_port() {
            Some((name, _)) => name,
            None => &self.host,
        }
    }

    /// The port to dial, defaulting to 80
    pub fn port(&self) -> u16 {
        self.explicit_port()
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// The request path, `/` when the URI had none
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, empty when absent
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Path plus query, as sent on the request line
    pub fn request_target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// The `host:port` address handed to the TCP dialer
    pub fn dial_address(&self) -> String {
        if self.explicit_port().is_some() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, DEFAULT_PORT)
        }
    }

    // `[::1]` has colons but no port; `[::1]:9000` has both.
    fn explicit_port(&self) -> Option<(&str, &str)> {
        let (name, port) = self.host.rsplit_once(':')?;
        if name.starts_with('[') && !name.ends_with(']') {
            return None;
        }
        Some((name, port))
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        Ok(())
    }
}
