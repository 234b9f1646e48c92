//! Connection descriptors
//!
//! A [`ConnectionDetails`] identifies one proxied flow: the two endpoints and
//! whether the flow is carried over TLS. Descriptors are immutable; when a
//! flow's destination or security changes (CONNECT bridging) a new descriptor
//! is built instead.

use std::fmt;
use std::net::SocketAddr;

/// Host and port of one end of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndPoint {
    host: String,
    port: u16,
}

impl EndPoint {
    /// Create an endpoint. The host is stored lower-cased.
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: host.as_ref().to_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for EndPoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable identity of a single proxied flow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDetails {
    local: EndPoint,
    remote: EndPoint,
    is_secure: bool,
}

impl ConnectionDetails {
    /// Create a descriptor.
    ///
    /// Returns `None` when both ends are the same socket, which can only
    /// happen for a misconfigured proxy pointed at itself.
    pub fn new(local: EndPoint, remote: EndPoint, is_secure: bool) -> Option<Self> {
        if local == remote {
            return None;
        }

        Some(Self {
            local,
            remote,
            is_secure,
        })
    }

    pub fn local(&self) -> &EndPoint {
        &self.local
    }

    pub fn remote(&self) -> &EndPoint {
        &self.remote
    }

    pub fn local_host(&self) -> &str {
        self.local.host()
    }

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    pub fn remote_host(&self) -> &str {
        self.remote.host()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Descriptor for the opposite direction of the same connection
    pub fn other_end(&self) -> Self {
        Self {
            local: self.remote.clone(),
            remote: self.local.clone(),
            is_secure: self.is_secure,
        }
    }

    /// A string that is the same for descriptors of either end of a
    /// connection.
    pub fn connection_identity(&self) -> String {
        let (first, second) = if self.local <= self.remote {
            (&self.local, &self.remote)
        } else {
            (&self.remote, &self.local)
        };

        format!(
            "{}|{}|{}|{}|{}",
            first.host(),
            first.port(),
            second.host(),
            second.port(),
            self.is_secure
        )
    }

    /// Base URL of the remote end, e.g. `https://example.org:443` for
    /// `url_base("http")` on a secure connection.
    pub fn url_base(&self, protocol: &str) -> String {
        format!(
            "{}{}{}",
            protocol,
            if self.is_secure { "s://" } else { "://" },
            self.remote
        )
    }
}

impl fmt::Display for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}
