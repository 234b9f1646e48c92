//! capture-proxy - intercepting TCP proxy for recording HTTP and HTTPS traffic
//!
//! The proxy sits between a client and a server, splits every connection
//! into its two directions and runs each buffer through a chain of
//! filters before forwarding it. Filters see everything that passes; the
//! built-in echo filter writes a readable transcript of it.
//!
//! ## Modes
//!
//! - **Port forwarding**: every connection goes to one fixed remote endpoint,
//!   optionally with TLS on both legs.
//! - **HTTP proxy**: the destination is read from each request's
//!   absolute URI. With HTTPS enabled, `CONNECT` requests are terminated
//!   and re-encrypted so their plaintext passes through the filters too.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use capture_proxy::{Config, Engine, FilterRegistry, Transcript};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         proxy: true,
//!         accept_timeout_secs: 60,
//!         ..Config::default()
//!     };
//!
//!     let registry = FilterRegistry::new(Transcript::stdout(), config.use_colour);
//!     let engine = Engine::bind(&config, &registry).await?;
//!     engine.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `engine` - listeners, accept loops and per-connection setup
//! - `pump` - moves bytes in one direction through a filter
//! - `filter` - the filter trait, built-in filters and the registry
//! - `resolver` - destination discovery for proxy mode
//! - `tls` - TLS identity and rustls configuration

// Core proxy modules
pub mod config;
pub mod connection;
pub mod engine;
pub mod pump;
pub mod resolver;

// Filters
pub mod filter;

// TLS utilities
pub mod tls;

// Re-export commonly used types

/// Configuration types
pub use config::{Config, ConfigError};

/// Connection descriptors
pub use connection::{ConnectionDetails, EndPoint};

/// Engines
pub use engine::{
    AcceptOutcome, BridgeTargets, ConnectionError, Engine, EngineError, HttpProxyEngine,
    PortForwarderEngine, ShutdownHandle, TlsBridgeEngine,
};

/// Filters
pub use filter::{
    CompositeFilter, Direction, EchoFilter, Filter, FilterContext, FilterError, FilterRegistry,
    MemorySink, NullFilter, StripAbsoluteUriFilter, TerminalColour, Transcript,
};

/// Stream pump
pub use pump::{pump, spawn_pair, PumpSummary};

/// Destination resolution
pub use resolver::{resolve, ProxyRequest, ResolveError};

/// TLS
pub use tls::{TlsError, TlsIdentity};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
