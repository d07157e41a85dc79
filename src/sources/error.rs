//! Errors surfaced by the sources service.

use std::fmt;

use thiserror::Error;

use super::lock::LockError;
use super::meta::MetaError;
use super::pool::PoolError;
use super::provider::ConfigError;
use super::watcher::WatchError;

#[derive(Error, Debug)]
pub enum SourcesError {
    #[error("source [{0}] doesn't exist")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start sources watcher: {0}")]
    Watch(#[from] WatchError),

    #[error("failed to create sync pool: {0}")]
    Pool(#[from] PoolError),

    #[error("failed to start pool monitor: {0}")]
    Monitor(#[source] std::io::Error),

    #[error("error getting [{source_id}] source [{collection}] collection {what}: {error}")]
    MetaStorage {
        source_id: String,
        collection: String,
        what: &'static str,
        #[source]
        error: MetaError,
    },
}

/// Why one collection could not be dispatched.
#[derive(Error, Debug)]
pub enum DispatchFailure {
    #[error("error locking [{source_id}] source [{collection}] collection: {error}")]
    Lock {
        source_id: String,
        collection: String,
        #[source]
        error: LockError,
    },

    #[error("error running sync task [{source_id}] source [{collection}] collection: {error}")]
    Submit {
        source_id: String,
        collection: String,
        #[source]
        error: PoolError,
    },
}

impl DispatchFailure {
    pub fn collection(&self) -> &str {
        match self {
            Self::Lock { collection, .. } | Self::Submit { collection, .. } => collection,
        }
    }
}

/// Independent per-collection dispatch failures of one sync call.
#[derive(Debug, Default)]
pub struct DispatchErrors {
    failures: Vec<DispatchFailure>,
}

impl DispatchErrors {
    pub fn push(&mut self, failure: DispatchFailure) {
        self.failures.push(failure);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DispatchFailure> {
        self.failures.iter()
    }

    /// `Ok` when nothing failed.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for DispatchErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n\t* {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DispatchErrors {}

impl IntoIterator for DispatchErrors {
    type Item = DispatchFailure;
    type IntoIter = std::vec::IntoIter<DispatchFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}

/// Failure of [`SourceService::sync`](super::SourceService::sync).
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("source [{0}] doesn't exist")]
    NotFound(String),

    #[error("source [{0}] has no live destinations")]
    EmptyDestinations(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchErrors),
}
