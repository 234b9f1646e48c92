//! Content filters
//!
//! Every buffer that flows through a proxied connection is handed to a
//! [`Filter`] before it is forwarded. Filters observe connection lifecycle
//! events and data, and may write a transcript of what they see. They are
//! created once when an engine starts and shared by every connection, so
//! implementations must tolerate concurrent calls.
//!
//! Built-in filters:
//! - [`NullFilter`] - does nothing
//! - [`EchoFilter`] - writes a readable transcript of each buffer
//! - [`CompositeFilter`] - runs a list of filters in order
//! - [`StripAbsoluteUriFilter`] - rewrites proxy request lines to origin form
//!
//! User filters are registered by name with a [`FilterRegistry`].

pub mod colour;
pub mod composite;
pub mod echo;
pub mod null;
pub mod registry;
pub mod strip;

use crate::connection::ConnectionDetails;
use thiserror::Error;

pub use colour::TerminalColour;
pub use composite::CompositeFilter;
pub use echo::{EchoFilter, MemorySink, Transcript};
pub use null::NullFilter;
pub use registry::{FilterContext, FilterRegistry, ECHO_TOKEN, NONE_TOKEN};
pub use strip::StripAbsoluteUriFilter;

/// Errors raised by filters while handling a connection
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Failed to write filter output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filter output lock poisoned")]
    OutputPoisoned,

    #[error("{0}")]
    Failed(String),
}

impl FilterError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Direction of a stream within a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server
    Request,
    /// Server to client
    Response,
}

impl Direction {
    /// Transcript colour used for this direction when colour is enabled
    pub fn colour(self) -> TerminalColour {
        match self {
            Direction::Request => TerminalColour::Red,
            Direction::Response => TerminalColour::Blue,
        }
    }
}

/// Observer of the bytes flowing in one direction of a connection
pub trait Filter: Send + Sync {
    /// Name shown in the engine startup message
    fn name(&self) -> &str;

    /// A stream has been opened
    fn connection_opened(&self, _details: &ConnectionDetails) -> Result<(), FilterError> {
        Ok(())
    }

    /// Handle one buffer read from the stream.
    ///
    /// Return `Some(bytes)` to forward `bytes` instead of `buffer`. The
    /// buffer boundaries are whatever the network delivered, so a filter
    /// must not assume it sees whole messages.
    fn handle(
        &self,
        details: &ConnectionDetails,
        buffer: &[u8],
    ) -> Result<Option<Vec<u8>>, FilterError>;

    /// A stream has been closed
    fn connection_closed(&self, _details: &ConnectionDetails) -> Result<(), FilterError> {
        Ok(())
    }

    /// The engine is shutting down
    fn stop(&self) {}
}
