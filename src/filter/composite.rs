//! Ordered chain of filters

use super::{Filter, FilterError};
use crate::connection::ConnectionDetails;
use std::sync::Arc;

/// Runs a list of filters in registration order.
///
/// A chain is itself a [`Filter`], so chains nest. When a filter replaces
/// the buffer, the filters after it see the replacement and the chain
/// returns the last replacement.
#[derive(Clone, Default)]
pub struct CompositeFilter {
    filters: Vec<Arc<dyn Filter>>,
    name: String,
}

impl CompositeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filter: Arc<dyn Filter>) {
        if !self.name.is_empty() {
            self.name.push_str(", ");
        }
        self.name.push_str(filter.name());
        self.filters.push(filter);
    }

    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl FromIterator<Arc<dyn Filter>> for CompositeFilter {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Filter>>>(iter: I) -> Self {
        let mut composite = Self::new();
        for filter in iter {
            composite.add(filter);
        }
        composite
    }
}

impl std::fmt::Debug for CompositeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeFilter")
            .field("filters", &self.name)
            .finish()
    }
}

impl Filter for CompositeFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection_opened(&self, details: &ConnectionDetails) -> Result<(), FilterError> {
        for filter in &self.filters {
            filter.connection_opened(details)?;
        }
        Ok(())
    }

    fn handle(
        &self,
        details: &ConnectionDetails,
        buffer: &[u8],
    ) -> Result<Option<Vec<u8>>, FilterError> {
        let mut replacement: Option<Vec<u8>> = None;

        for filter in &self.filters {
            let input = replacement.as_deref().unwrap_or(buffer);
            if let Some(bytes) = filter.handle(details, input)? {
                replacement = Some(bytes);
            }
        }

        Ok(replacement)
    }

    fn connection_closed(&self, details: &ConnectionDetails) -> Result<(), FilterError> {
        for filter in &self.filters {
            filter.connection_closed(details)?;
        }
        Ok(())
    }

    fn stop(&self) {
        for filter in &self.filters {
            filter.stop();
        }
    }
}
