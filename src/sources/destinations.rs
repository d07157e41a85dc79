//! Destination storages as seen by the sources service.
//!
//! Storage engines are provided by the destinations subsystem; this module
//! only names the handles a sync task needs and offers a static registry for
//! wiring them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::Value;

/// A live destination storage.
pub trait Storage: Send + Sync {
    /// Destination id the storage was configured under.
    fn id(&self) -> &str;

    /// Write a batch of objects into `table`.
    fn store(&self, table: &str, objects: &[Value]) -> anyhow::Result<()>;
}

/// Handle to a destination that may not be initialized yet.
pub trait StorageProxy: Send + Sync {
    /// The storage, or `None` while the destination is still initializing.
    fn get(&self) -> Option<Arc<dyn Storage>>;
}

/// Resolves destination ids to storage proxies.
pub trait DestinationsService: Send + Sync {
    fn storage_by_id(&self, id: &str) -> Option<Arc<dyn StorageProxy>>;
}

/// Proxy over an already initialized storage.
pub struct ReadyStorage(Arc<dyn Storage>);

impl ReadyStorage {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self(storage)
    }
}

impl StorageProxy for ReadyStorage {
    fn get(&self) -> Option<Arc<dyn Storage>> {
        Some(self.0.clone())
    }
}

/// Proxy that becomes ready once a storage is attached.
#[derive(Default)]
pub struct LazyStorage {
    cell: OnceCell<Arc<dyn Storage>>,
}

impl LazyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the initialized storage. Returns `false` if one was already
    /// attached.
    pub fn attach(&self, storage: Arc<dyn Storage>) -> bool {
        self.cell.set(storage).is_ok()
    }

    pub fn is_ready(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl StorageProxy for LazyStorage {
    fn get(&self) -> Option<Arc<dyn Storage>> {
        self.cell.get().cloned()
    }
}

/// Fixed id -> proxy mapping.
#[derive(Default, Clone)]
pub struct StaticDestinations {
    proxies: HashMap<String, Arc<dyn StorageProxy>>,
}

impl fmt::Debug for StaticDestinations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticDestinations")
            .field("ids", &self.proxies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, proxy: Arc<dyn StorageProxy>) {
        self.proxies.insert(id.into(), proxy);
    }

    /// Register an initialized storage under its own id.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        let id = storage.id().to_string();
        self.insert(id, Arc::new(ReadyStorage::new(storage)));
        self
    }

    pub fn with_proxy(mut self, id: impl Into<String>, proxy: Arc<dyn StorageProxy>) -> Self {
        self.insert(id, proxy);
        self
    }
}

impl DestinationsService for StaticDestinations {
    fn storage_by_id(&self, id: &str) -> Option<Arc<dyn StorageProxy>> {
        self.proxies.get(id).cloned()
    }
}
