use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::filter::ECHO_TOKEN;
use crate::tls::TlsError;

/// Configuration errors. All of these are fatal before any socket is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Accept timeout must not be negative (got {0})")]
    NegativeTimeout(i64),

    #[error("Certificate and private key can only be given in HTTPS mode")]
    IdentityWithoutHttps,

    #[error("Certificate and private key must be given together")]
    IncompleteIdentity,

    #[error("Unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("Invalid filter name '{0}'")]
    InvalidFilterName(String),

    #[error("Filter '{0}' is already registered")]
    DuplicateFilter(String),

    #[error("Failed to construct filter '{name}': {reason}")]
    FilterConstruction { name: String, reason: String },

    #[error("Local port {0} is also the local TLS port")]
    PortClash(u16),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    // Listener
    pub local_host: String,
    pub local_port: u16,

    // Fixed destination (port forwarding mode)
    pub remote_host: String,
    pub remote_port: u16,

    // Modes
    pub proxy: bool,
    pub https: bool,

    // TLS identity (PEM)
    pub certificate_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,

    /// Port of the inner TLS engine in HTTPS proxy mode, 0 for ephemeral
    pub local_tls_port: u16,

    /// Seconds to wait for a connection before the engine stops, 0 waits forever
    pub accept_timeout_secs: i64,

    // Filters
    pub use_colour: bool,
    pub request_filters: Vec<String>,
    pub response_filters: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_host: "localhost".to_string(),
            local_port: 8001,
            remote_host: "localhost".to_string(),
            remote_port: 7001,
            proxy: false,
            https: false,
            certificate_path: None,
            private_key_path: None,
            local_tls_port: 9001,
            accept_timeout_secs: 0,
            use_colour: false,
            request_filters: vec![ECHO_TOKEN.to_string()],
            response_filters: vec![ECHO_TOKEN.to_string()],
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Self::default();

        let local_host = env::var("CAPTURE_LOCAL_HOST").unwrap_or(defaults.local_host);
        let local_port = env_or("CAPTURE_LOCAL_PORT", defaults.local_port)
            .context("Invalid CAPTURE_LOCAL_PORT")?;

        let remote_host = env::var("CAPTURE_REMOTE_HOST").unwrap_or(defaults.remote_host);
        let remote_port = env_or("CAPTURE_REMOTE_PORT", defaults.remote_port)
            .context("Invalid CAPTURE_REMOTE_PORT")?;

        let proxy = env_or("CAPTURE_PROXY", defaults.proxy).context("Invalid CAPTURE_PROXY")?;
        let https = env_or("CAPTURE_HTTPS", defaults.https).context("Invalid CAPTURE_HTTPS")?;

        let certificate_path = env::var("CAPTURE_CERTIFICATE_PATH").ok().map(PathBuf::from);
        let private_key_path = env::var("CAPTURE_PRIVATE_KEY_PATH").ok().map(PathBuf::from);

        let local_tls_port = env_or("CAPTURE_LOCAL_TLS_PORT", defaults.local_tls_port)
            .context("Invalid CAPTURE_LOCAL_TLS_PORT")?;
        let accept_timeout_secs = env_or("CAPTURE_ACCEPT_TIMEOUT_SECS", defaults.accept_timeout_secs)
            .context("Invalid CAPTURE_ACCEPT_TIMEOUT_SECS")?;

        let use_colour =
            env_or("CAPTURE_COLOUR", defaults.use_colour).context("Invalid CAPTURE_COLOUR")?;

        let request_filters = env::var("CAPTURE_REQUEST_FILTERS")
            .map(|v| parse_filter_list(&v))
            .unwrap_or(defaults.request_filters);
        let response_filters = env::var("CAPTURE_RESPONSE_FILTERS")
            .map(|v| parse_filter_list(&v))
            .unwrap_or(defaults.response_filters);

        Ok(Self {
            local_host,
            local_port,
            remote_host,
            remote_port,
            proxy,
            https,
            certificate_path,
            private_key_path,
            local_tls_port,
            accept_timeout_secs,
            use_colour,
            request_filters,
            response_filters,
        })
    }

    /// Check the combination of settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_timeout_secs < 0 {
            return Err(ConfigError::NegativeTimeout(self.accept_timeout_secs));
        }

        match (&self.certificate_path, &self.private_key_path) {
            (None, None) => {}
            (Some(_), Some(_)) if self.https => {}
            (Some(_), Some(_)) => return Err(ConfigError::IdentityWithoutHttps),
            _ => return Err(ConfigError::IncompleteIdentity),
        }

        if self.proxy && self.https && self.local_port == self.local_tls_port && self.local_port != 0
        {
            return Err(ConfigError::PortClash(self.local_port));
        }

        Ok(())
    }

    /// `None` when accepting should never time out
    pub fn accept_timeout(&self) -> Option<Duration> {
        match self.accept_timeout_secs {
            secs if secs > 0 => Some(Duration::from_secs(secs as u64)),
            _ => None,
        }
    }

    /// Whether a PEM identity was configured
    pub fn has_identity(&self) -> bool {
        self.certificate_path.is_some() && self.private_key_path.is_some()
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => Ok(value.trim().parse()?),
        Err(_) => Ok(default),
    }
}

/// Split a filter list on commas and whitespace. An empty list means no
/// filtering at all.
pub fn parse_filter_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}
