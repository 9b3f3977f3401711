//! Cookie sources for the upgrade request
//!
//! The dialer asks a [`CookieSource`] for the cookies that apply to a target
//! and attaches each one as its own `Cookie` header.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::target::ConnectionTarget;

/// A single name/value cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
}

impl Cookie {
    /// Create a new cookie
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Supplies the cookies applicable to a connection target
pub trait CookieSource: Send + Sync {
    /// Cookies to send with an upgrade request to `target`
    fn cookies(&self, target: &ConnectionTarget) -> Vec<Cookie>;
}

impl<F> CookieSource for F
where
    F: Fn(&ConnectionTarget) -> Vec<Cookie> + Send + Sync,
{
    fn cookies(&self, target: &ConnectionTarget) -> Vec<Cookie> {
        self(target)
    }
}

#[derive(Debug, Clone)]
struct StoredCookie {
    path: String,
    cookie: Cookie,
}

/// In-memory cookie jar keyed by hostname
///
/// A cookie applies when the target's hostname matches and the target path
/// starts with the cookie's path. Setting a cookie with the same name and
/// path replaces the previous value.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    hosts: RwLock<HashMap<String, Vec<StoredCookie>>>,
}

impl MemoryCookieJar {
    /// Create an empty jar
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie for every path on `host`
    pub fn set(&self, host: &str, cookie: Cookie) {
        self.set_with_path(host, "/", cookie);
    }

    /// Store a cookie scoped to `path` on `host`
    pub fn set_with_path(&self, host: &str, path: &str, cookie: Cookie) {
        let mut hosts = self.hosts.write();
        let stored = hosts.entry(host.to_ascii_lowercase()).or_default();

        match stored
            .iter_mut()
            .find(|s| s.path == path && s.cookie.name == cookie.name)
        {
            Some(existing) => existing.cookie = cookie,
            None => stored.push(StoredCookie {
                path: path.to_string(),
                cookie,
            }),
        }
    }

    /// Remove every cookie stored for `host`
    pub fn clear(&self, host: &str) {
        self.hosts.write().remove(&host.to_ascii_lowercase());
    }

    /// Number of cookies across all hosts
    pub fn len(&self) -> usize {
        self.hosts.read().values().map(Vec::len).sum()
    }

    /// Returns true if the jar holds no cookies
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CookieSource for MemoryCookieJar {
    fn cookies(&self, target: &ConnectionTarget) -> Vec<Cookie> {
        let hosts = self.hosts.read();
        let Some(stored) = hosts.get(&target.hostname().to_ascii_lowercase()) else {
            return Vec::new();
        };

        stored
            .iter()
            .filter(|s| target.path().starts_with(&s.path))
            .map(|s| s.cookie.clone())
            .collect()
    }
}
