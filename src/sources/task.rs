//! One dispatched sync of one collection.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, warn};

use super::destinations::Storage;
use super::lock::LockGuard;
use super::meta::{MetaStorage, STATUS_FAILED, STATUS_RUNNING, STATUS_SUCCESS};
use super::pool::PoolTask;
use crate::drivers::Driver;

/// Identifier of a (source, collection) job.
pub fn task_identifier(source_id: &str, collection: &str) -> String {
    format!("{source_id}_{collection}")
}

/// Everything a worker needs to sync one collection.
///
/// The lock guard travels with the task; it is released when the task is
/// dropped, whether the driver returned, failed or panicked.
pub struct SyncTask {
    source_id: String,
    collection: String,
    identifier: String,
    driver: Arc<dyn Driver>,
    destinations: Arc<[Arc<dyn Storage>]>,
    meta: Arc<dyn MetaStorage>,
    lock: LockGuard,
}

impl fmt::Debug for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTask")
            .field("identifier", &self.identifier)
            .field("destinations", &self.destinations.len())
            .field("lock", &self.lock)
            .finish()
    }
}

impl SyncTask {
    pub fn new(
        source_id: &str,
        collection: &str,
        driver: Arc<dyn Driver>,
        destinations: Arc<[Arc<dyn Storage>]>,
        meta: Arc<dyn MetaStorage>,
        lock: LockGuard,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            collection: collection.to_string(),
            identifier: task_identifier(source_id, collection),
            driver,
            destinations,
            meta,
            lock,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn set_status(&self, status: &str) {
        if let Err(e) = self
            .meta
            .update_collection_status(&self.source_id, &self.collection, status)
        {
            warn!(task = %self.identifier, status, error = %e, "failed to update collection status");
        }
    }

    fn set_log(&self, log: &str) {
        if let Err(e) = self
            .meta
            .update_collection_log(&self.source_id, &self.collection, log)
        {
            warn!(task = %self.identifier, error = %e, "failed to update collection log");
        }
    }

    /// Run the driver against the destinations and record the outcome.
    pub fn execute(&self) -> anyhow::Result<()> {
        let started_at = Utc::now();
        let start = Instant::now();
        info!(task = %self.identifier, destinations = self.destinations.len(), "sync started");
        self.set_status(STATUS_RUNNING);
        self.set_log(&format!("{} [{}] sync started", started_at.to_rfc3339(), self.identifier));

        let result = self.driver.sync(&self.destinations);
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => {
                info!(task = %self.identifier, duration_ms, "sync finished");
                self.set_status(STATUS_SUCCESS);
                self.set_log(&format!(
                    "{} [{}] sync finished in {duration_ms}ms",
                    Utc::now().to_rfc3339(),
                    self.identifier
                ));
            }
            Err(e) => {
                error!(task = %self.identifier, duration_ms, error = %e, "sync failed");
                self.set_status(STATUS_FAILED);
                self.set_log(&format!(
                    "{} [{}] sync failed after {duration_ms}ms: {e:#}",
                    Utc::now().to_rfc3339(),
                    self.identifier
                ));
            }
        }
        result
    }
}

impl PoolTask for SyncTask {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn run(self) {
        let _ = self.execute();
        // `self.lock` drops here.
    }
}
