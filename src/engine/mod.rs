//! Capture engines
//!
//! An engine owns one listening socket. Each accepted connection gets its
//! own setup task (destination resolution, outbound connect, TLS
//! handshakes) which then starts the two stream pumps. The accept loop
//! never waits on a connection's setup.
//!
//! - [`PortForwarderEngine`] - forwards everything to a fixed remote endpoint
//! - [`HttpProxyEngine`] - HTTP proxy, destination taken from each request
//! - [`TlsBridgeEngine`] - TLS-terminating engine behind CONNECT requests
//!
//! [`Engine`] picks the right one for a [`Config`].

pub mod listener;
pub mod forwarder;
pub mod http_proxy;
pub mod tls_bridge;

pub use listener::{AcceptOutcome, Accepted, EngineCore, ShutdownHandle};
pub use forwarder::PortForwarderEngine;
pub use http_proxy::HttpProxyEngine;
pub use tls_bridge::{BridgeTargets, TlsBridgeEngine};

use crate::config::{Config, ConfigError};
use crate::connection::{ConnectionDetails, EndPoint};
use crate::filter::{Direction, Filter, FilterRegistry};
use crate::resolver::ResolveError;
use crate::tls::{self, TlsError, TlsIdentity};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

/// Errors that end an engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
}

impl From<TlsError> for EngineError {
    fn from(e: TlsError) -> Self {
        EngineError::Config(ConfigError::Tls(e))
    }
}

/// Errors that abandon a single connection. They are logged by the
/// connection's task and never reach the accept loop.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Connection from {0} would be forwarded to itself")]
    SelfConnection(EndPoint),

    #[error("No bridge destination registered for {0}")]
    UnknownBridgePeer(SocketAddr),

    #[error("HTTPS proxying is not enabled")]
    HttpsDisabled,
}

/// Request and response filter chains of one engine
#[derive(Clone)]
pub struct FilterPair {
    pub request: Arc<dyn Filter>,
    pub response: Arc<dyn Filter>,
}

impl FilterPair {
    pub fn new(request: Arc<dyn Filter>, response: Arc<dyn Filter>) -> Self {
        Self { request, response }
    }

    /// Build both chains from the configured tokens
    pub fn from_config(config: &Config, registry: &FilterRegistry) -> Result<Self, ConfigError> {
        Ok(Self {
            request: registry.build_chain(&config.request_filters, Direction::Request)?,
            response: registry.build_chain(&config.response_filters, Direction::Response)?,
        })
    }

    /// Tell both chains the engine is shutting down
    pub fn stop(&self) {
        self.request.stop();
        self.response.stop();
    }
}

/// Both halves of TLS interception: the acceptor presented to clients and
/// the connector used towards servers
#[derive(Clone)]
pub struct TlsPair {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

impl TlsPair {
    /// Client side from the configured identity (or a generated one);
    /// server side presents the configured identity, if any, as a client
    /// certificate.
    pub fn from_config(config: &Config) -> Result<Self, TlsError> {
        let identity = TlsIdentity::from_paths(
            config.certificate_path.as_deref(),
            config.private_key_path.as_deref(),
        )?;

        let client_identity = config.has_identity().then_some(&identity);

        Ok(Self {
            acceptor: tls::create_tls_acceptor(&identity)?,
            connector: tls::create_tls_connector(client_identity)?,
        })
    }
}

/// Build a descriptor, refusing flows that loop back onto themselves
pub(crate) fn connection_details(
    local: EndPoint,
    remote: EndPoint,
    is_secure: bool,
) -> Result<ConnectionDetails, ConnectionError> {
    let looped = local.clone();
    ConnectionDetails::new(local, remote, is_secure).ok_or(ConnectionError::SelfConnection(looped))
}

/// Open a plain TCP connection to `destination`
pub(crate) async fn connect(destination: &EndPoint) -> Result<TcpStream, ConnectionError> {
    Ok(TcpStream::connect((destination.host(), destination.port())).await?)
}

/// Open a TLS connection to `destination`
pub(crate) async fn connect_tls(
    connector: &TlsConnector,
    destination: &EndPoint,
) -> Result<TlsStream<TcpStream>, ConnectionError> {
    let server_name = tls::server_name(destination.host())?;
    let stream = connect(destination).await?;
    Ok(connector.connect(server_name, stream).await?)
}

/// The startup message
fn log_startup(config: &Config, filters: &FilterPair) {
    info!(
        "[ENGINE] Initialising {} capture engine",
        if config.https { "SSL" } else { "standard" }
    );
    info!("[ENGINE]   Request filters:    {}", filters.request.name());
    info!("[ENGINE]   Response filters:   {}", filters.response.name());
    info!("[ENGINE]   Local host:         {}", config.local_host);
    info!("[ENGINE]   Local port:         {}", config.local_port);

    if config.proxy {
        info!("[ENGINE]   Proxying requests");
    } else {
        info!("[ENGINE]   Remote host:        {}", config.remote_host);
        info!("[ENGINE]   Remote port:        {}", config.remote_port);
    }
}

/// Engine selected from configuration
pub enum Engine {
    PortForwarder(PortForwarderEngine),
    HttpProxy(HttpProxyEngine),
}

impl Engine {
    /// Validate `config`, build the filter chains and bind.
    ///
    /// Every configuration error is reported here, before any socket is
    /// opened.
    pub async fn bind(config: &Config, registry: &FilterRegistry) -> Result<Self, EngineError> {
        config.validate()?;

        let filters = FilterPair::from_config(config, registry)?;
        let tls = if config.https {
            Some(TlsPair::from_config(config)?)
        } else {
            None
        };

        log_startup(config, &filters);

        let engine = if config.proxy {
            Engine::HttpProxy(HttpProxyEngine::bind(config, filters, tls).await?)
        } else {
            Engine::PortForwarder(PortForwarderEngine::bind(config, filters, tls).await?)
        };

        info!(
            "[ENGINE] Engine initialised, listening on port {}",
            engine.local_addr().port()
        );

        Ok(engine)
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Engine::PortForwarder(engine) => engine.local_addr(),
            Engine::HttpProxy(engine) => engine.local_addr(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        match self {
            Engine::PortForwarder(engine) => engine.shutdown_handle(),
            Engine::HttpProxy(engine) => engine.shutdown_handle(),
        }
    }

    /// Accept connections until the accept timeout expires or the engine
    /// is stopped. Filters are stopped before this returns.
    pub async fn run(self) -> Result<(), EngineError> {
        match self {
            Engine::PortForwarder(engine) => engine.run().await,
            Engine::HttpProxy(engine) => engine.run().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{MemorySink, Transcript};

    fn registry() -> FilterRegistry {
        FilterRegistry::new(Transcript::new(MemorySink::new()), false)
    }

    fn local_config() -> Config {
        Config {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            local_tls_port: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_bind() {
        let config = Config {
            accept_timeout_secs: -5,
            ..local_config()
        };
        assert!(matches!(
            Engine::bind(&config, &registry()).await,
            Err(EngineError::Config(ConfigError::NegativeTimeout(-5)))
        ));
    }

    #[tokio::test]
    async fn test_unknown_filter_rejected() {
        let config = Config {
            response_filters: vec!["no.such.Filter".to_string()],
            ..local_config()
        };
        assert!(matches!(
            Engine::bind(&config, &registry()).await,
            Err(EngineError::Config(ConfigError::UnknownFilter(_)))
        ));
    }

    #[tokio::test]
    async fn test_engine_selection() {
        let engine = Engine::bind(&local_config(), &registry()).await.unwrap();
        assert!(matches!(engine, Engine::PortForwarder(_)));
        assert_ne!(engine.local_addr().port(), 0);

        let config = Config {
            proxy: true,
            ..local_config()
        };
        let engine = Engine::bind(&config, &registry()).await.unwrap();
        assert!(matches!(engine, Engine::HttpProxy(_)));
    }

    #[tokio::test]
    async fn test_stopped_engine_returns() {
        let engine = Engine::bind(&local_config(), &registry()).await.unwrap();
        engine.shutdown_handle().stop();
        assert!(engine.run().await.is_ok());
    }

    #[test]
    fn test_self_connection_refused() {
        let endpoint = EndPoint::new("localhost", 8001);
        assert!(matches!(
            connection_details(endpoint.clone(), endpoint, false),
            Err(ConnectionError::SelfConnection(_))
        ));
    }
}
