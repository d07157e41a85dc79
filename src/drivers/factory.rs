//! Driver factory: source type -> constructor, one driver per collection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::{Collection, Driver, DriverPerCollection, SourceConfig};

/// Errors raised while turning a [`SourceConfig`] into drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown source type: {0}")]
    UnknownSourceType(String),

    #[error("error creating [{source_type}] driver for [{collection}] collection: {reason}")]
    Creation {
        source_type: String,
        collection: String,
        reason: String,
    },
}

/// Builds a driver for one collection of a source.
pub trait DriverConstructor: Send + Sync {
    fn create(
        &self,
        config: &SourceConfig,
        collection: &Collection,
    ) -> anyhow::Result<Arc<dyn Driver>>;
}

impl<F> DriverConstructor for F
where
    F: Fn(&SourceConfig, &Collection) -> anyhow::Result<Arc<dyn Driver>> + Send + Sync,
{
    fn create(
        &self,
        config: &SourceConfig,
        collection: &Collection,
    ) -> anyhow::Result<Arc<dyn Driver>> {
        self(config, collection)
    }
}

/// Registry of driver constructors keyed by source type.
///
/// Built once at startup and injected into the sources service.
#[derive(Default, Clone)]
pub struct DriverFactory {
    constructors: HashMap<String, Arc<dyn DriverConstructor>>,
}

impl fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("DriverFactory")
            .field("types", &types)
            .finish()
    }
}

impl DriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for a source type.
    pub fn register(
        &mut self,
        source_type: impl Into<String>,
        constructor: impl DriverConstructor + 'static,
    ) -> &mut Self {
        self.constructors
            .insert(source_type.into(), Arc::new(constructor));
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(
        mut self,
        source_type: impl Into<String>,
        constructor: impl DriverConstructor + 'static,
    ) -> Self {
        self.register(source_type, constructor);
        self
    }

    pub fn supports(&self, source_type: &str) -> bool {
        self.constructors.contains_key(source_type)
    }

    /// Build one driver per collection of `config`.
    ///
    /// Any failure aborts the whole source: a partially built source is never
    /// returned.
    pub fn create(
        &self,
        name: &str,
        config: &SourceConfig,
    ) -> Result<DriverPerCollection, DriverError> {
        let normalized = config.normalize(name)?;
        info!(source = %name, source_type = %normalized.source_type, "initializing source");

        let constructor = self
            .constructors
            .get(&normalized.source_type)
            .ok_or_else(|| DriverError::UnknownSourceType(normalized.source_type.clone()))?;

        // Constructors see the resolved type even when the config left it empty.
        let mut resolved = config.clone();
        resolved.source_type = normalized.source_type.clone();

        let mut drivers = DriverPerCollection::with_capacity(normalized.collections.len());
        for collection in &normalized.collections {
            let driver = constructor.create(&resolved, collection).map_err(|e| {
                DriverError::Creation {
                    source_type: normalized.source_type.clone(),
                    collection: collection.name.clone(),
                    reason: format!("{e:#}"),
                }
            })?;
            drivers.insert(collection.name.clone(), driver);
        }
        Ok(drivers)
    }
}
