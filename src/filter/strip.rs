//! Absolute-URI stripping decorator for HTTP proxy mode

use super::{Filter, FilterError};
use crate::connection::ConnectionDetails;
use crate::resolver::strip_absolute_uri;
use std::sync::Arc;

/// Wraps the request filter chain of an HTTP proxy engine.
///
/// The delegate sees the buffer as the client sent it. Whatever the
/// delegate returns (or the original buffer) then has every
/// `METHOD http://host[:port]/path` request line rewritten to origin form
/// before it reaches the server.
pub struct StripAbsoluteUriFilter {
    delegate: Arc<dyn Filter>,
}

impl StripAbsoluteUriFilter {
    pub fn new(delegate: Arc<dyn Filter>) -> Self {
        Self { delegate }
    }
}

impl Filter for StripAbsoluteUriFilter {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn connection_opened(&self, details: &ConnectionDetails) -> Result<(), FilterError> {
        self.delegate.connection_opened(details)
    }

    fn handle(
        &self,
        details: &ConnectionDetails,
        buffer: &[u8],
    ) -> Result<Option<Vec<u8>>, FilterError> {
        match self.delegate.handle(details, buffer)? {
            Some(replaced) => Ok(Some(strip_absolute_uri(&replaced).unwrap_or(replaced))),
            None => Ok(strip_absolute_uri(buffer)),
        }
    }

    fn connection_closed(&self, details: &ConnectionDetails) -> Result<(), FilterError> {
        self.delegate.connection_closed(details)
    }

    fn stop(&self) {
        self.delegate.stop()
    }
}
