//! Filter registry
//!
//! Maps the filter tokens found in configuration to filter instances.
//! `NONE` and `ECHO` are built in; anything else must be registered by name
//! before the engine is built.

use super::{
    CompositeFilter, Direction, EchoFilter, Filter, FilterError, NullFilter, Transcript,
};
use crate::config::ConfigError;
use std::collections::HashMap;
use std::sync::Arc;

/// Token for [`NullFilter`]
pub const NONE_TOKEN: &str = "NONE";

/// Token for [`EchoFilter`]
pub const ECHO_TOKEN: &str = "ECHO";

/// What a filter factory is given when an engine builds its chains
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub direction: Direction,
    pub transcript: Transcript,
    pub use_colour: bool,
}

type FilterFactory =
    Box<dyn Fn(&FilterContext) -> Result<Arc<dyn Filter>, FilterError> + Send + Sync>;

pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
    transcript: Transcript,
    use_colour: bool,
}

impl FilterRegistry {
    pub fn new(transcript: Transcript, use_colour: bool) -> Self {
        Self {
            factories: HashMap::new(),
            transcript,
            use_colour,
        }
    }

    /// Register a user filter under `name`
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), ConfigError>
    where
        F: Fn(&FilterContext) -> Result<Arc<dyn Filter>, FilterError> + Send + Sync + 'static,
    {
        let name = name.into();

        if name.is_empty()
            || name.chars().any(char::is_whitespace)
            || name == NONE_TOKEN
            || name == ECHO_TOKEN
        {
            return Err(ConfigError::InvalidFilterName(name));
        }

        if self.factories.contains_key(&name) {
            return Err(ConfigError::DuplicateFilter(name));
        }

        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    pub fn is_registered(&self, token: &str) -> bool {
        token == NONE_TOKEN || token == ECHO_TOKEN || self.factories.contains_key(token)
    }

    /// Build the filter named by one token
    pub fn build(&self, token: &str, direction: Direction) -> Result<Arc<dyn Filter>, ConfigError> {
        match token {
            NONE_TOKEN => Ok(Arc::new(NullFilter)),
            ECHO_TOKEN => {
                let echo = EchoFilter::new(self.transcript.clone());
                Ok(if self.use_colour {
                    Arc::new(echo.with_colour(direction.colour()))
                } else {
                    Arc::new(echo)
                })
            }
            name => {
                let factory = self
                    .factories
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownFilter(name.to_string()))?;

                factory(&self.context(direction)).map_err(|e| ConfigError::FilterConstruction {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Build the chain for one direction.
    ///
    /// No tokens gives a [`NullFilter`], one token gives that filter and
    /// several give a [`CompositeFilter`] in the listed order. An unknown
    /// token is reported before any factory runs.
    pub fn build_chain<S: AsRef<str>>(
        &self,
        tokens: &[S],
        direction: Direction,
    ) -> Result<Arc<dyn Filter>, ConfigError> {
        for token in tokens {
            let token: &str = token.as_ref();
            if !self.is_registered(token) {
                return Err(ConfigError::UnknownFilter(token.to_string()));
            }
        }

        match tokens {
            [] => Ok(Arc::new(NullFilter)),
            [token] => self.build(token.as_ref(), direction),
            tokens => {
                let mut composite = CompositeFilter::new();
                for token in tokens {
                    composite.add(self.build(token.as_ref(), direction)?);
                }
                Ok(Arc::new(composite))
            }
        }
    }

    fn context(&self, direction: Direction) -> FilterContext {
        FilterContext {
            direction,
            transcript: self.transcript.clone(),
            use_colour: self.use_colour,
        }
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("FilterRegistry")
            .field("registered", &names)
            .field("use_colour", &self.use_colour)
            .finish()
    }
}
