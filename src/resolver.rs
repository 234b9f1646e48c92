//! Destination resolver for proxy mode
//!
//! Inspects the first buffer read from a new client connection and works
//! out where it should be forwarded. Two request shapes are understood:
//!
//! ```text
//! METHOD http://HOST[:PORT]/path ...   plain HTTP proxy request, port 80 by default
//! CONNECT HOST:PORT ...                HTTPS tunnel request, port required
//! ```
//!
//! Only the first buffer is examined; a request line split across reads is
//! not reassembled. Lines are matched anywhere in the buffer, the first
//! match wins, and absolute-URI requests take precedence over CONNECT.

use crate::connection::EndPoint;
use lazy_static::lazy_static;
use regex::bytes::Regex;
use std::borrow::Cow;
use thiserror::Error;

/// Default port for `http://` URIs without an explicit port
pub const DEFAULT_HTTP_PORT: u16 = 80;

lazy_static! {
    /// `METHOD http://host[:port]/path`: method, host, port, path
    static ref ABSOLUTE_URI_LINE: Regex =
        Regex::new(r"(?m-u)^([A-Z]+)[ \t]+http://([^/:\s]+):?(\d*)(/.*)").unwrap();

    /// `CONNECT host:port`: host, port
    static ref CONNECT_LINE: Regex =
        Regex::new(r"(?m-u)^CONNECT[ \t]+([^:\s]+):(\d+)").unwrap();
}

/// Resolution errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Failed to determine proxy destination from message")]
    NoDestination,

    #[error("Invalid port '{0}'")]
    InvalidPort(String),
}

/// What the client asked the proxy to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRequest {
    /// Plain HTTP request with an absolute URI
    Http(EndPoint),

    /// HTTPS tunnel request
    Connect(EndPoint),
}

impl ProxyRequest {
    pub fn destination(&self) -> &EndPoint {
        match self {
            ProxyRequest::Http(endpoint) | ProxyRequest::Connect(endpoint) => endpoint,
        }
    }
}

/// Resolve the destination of a new proxy connection from its first buffer
pub fn resolve(buffer: &[u8]) -> Result<ProxyRequest, ResolveError> {
    match resolve_http(buffer) {
        Err(ResolveError::NoDestination) => resolve_connect(buffer).map(ProxyRequest::Connect),
        other => other.map(ProxyRequest::Http),
    }
}

/// Resolve an absolute-URI request line only
pub fn resolve_http(buffer: &[u8]) -> Result<EndPoint, ResolveError> {
    let captures = ABSOLUTE_URI_LINE
        .captures(buffer)
        .ok_or(ResolveError::NoDestination)?;

    let port = match &captures[3] {
        b"" => DEFAULT_HTTP_PORT,
        digits => parse_port(digits)?,
    };

    Ok(EndPoint::new(String::from_utf8_lossy(&captures[2]), port))
}

/// Resolve a CONNECT request line only
pub fn resolve_connect(buffer: &[u8]) -> Result<EndPoint, ResolveError> {
    let captures = CONNECT_LINE
        .captures(buffer)
        .ok_or(ResolveError::NoDestination)?;

    let port = parse_port(&captures[2])?;

    Ok(EndPoint::new(String::from_utf8_lossy(&captures[1]), port))
}

/// Rewrite every absolute-URI request line in `buffer` to origin form.
///
/// `GET http://example.org:8080/path HTTP/1.1` becomes `GET /path HTTP/1.1`.
/// All other bytes are copied unchanged. Returns `None` if no line matched,
/// so callers can forward the original buffer without copying.
pub fn strip_absolute_uri(buffer: &[u8]) -> Option<Vec<u8>> {
    match ABSOLUTE_URI_LINE.replace_all(buffer, &b"${1} ${4}"[..]) {
        Cow::Borrowed(_) => None,
        Cow::Owned(rewritten) => Some(rewritten),
    }
}

fn parse_port(digits: &[u8]) -> Result<u16, ResolveError> {
    let text = String::from_utf8_lossy(digits);
    match text.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ResolveError::InvalidPort(text.into_owned())),
    }
}
