//! Filter that does nothing

use super::{Filter, FilterError};
use crate::connection::ConnectionDetails;

/// Pass-through filter. Used where no observation is wanted, including the
/// raw relay half of a CONNECT bridge.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullFilter;

impl Filter for NullFilter {
    fn name(&self) -> &str {
        "NullFilter"
    }

    fn handle(
        &self,
        _details: &ConnectionDetails,
        _buffer: &[u8],
    ) -> Result<Option<Vec<u8>>, FilterError> {
        Ok(None)
    }
}
