//! The sources service: registry, reload, dispatch and status reads.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::destinations::{DestinationsService, Storage};
use super::error::{DispatchErrors, DispatchFailure, SourcesError, SyncError};
use super::lock::{DistributedLock, LockGuard};
use super::meta::{MetaError, MetaStorage};
use super::observe::{LogNotifier, LogObserver, Notifier, PoolMonitor, PoolObserver};
use super::pool::{PoolError, WorkerPool};
use super::provider::{SourceConfigs, SourcesProvider, parse_from_bytes};
use super::registry::{SourceRegistry, Unit};
use super::task::{SyncTask, task_identifier};
use super::watcher::{ConfigWatcher, ResourceLoader};
use crate::drivers::DriverFactory;

const SERVICE_NAME: &str = "sources";

/// Runtime knobs of the sources service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Number of sync worker threads; must be positive when sources exist.
    pub pool_size: usize,
    /// Poll interval of file/HTTP sources providers (zero: load once).
    pub reload_interval: Duration,
    /// Interval between pool usage samples.
    pub monitor_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            pool_size: 16,
            reload_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(20),
        }
    }
}

/// External systems the service talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub destinations: Arc<dyn DestinationsService>,
    pub meta: Arc<dyn MetaStorage>,
    pub lock: Arc<dyn DistributedLock>,
    pub notifier: Arc<dyn Notifier>,
    pub observer: Arc<dyn PoolObserver>,
}

impl Collaborators {
    /// Collaborators that report panics and pool usage to the log only.
    pub fn new(
        destinations: Arc<dyn DestinationsService>,
        meta: Arc<dyn MetaStorage>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            destinations,
            meta,
            lock,
            notifier: Arc::new(LogNotifier),
            observer: Arc::new(LogObserver),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = observer;
        self
    }
}

pub struct SourceService {
    registry: SourceRegistry,
    factory: DriverFactory,
    destinations: Arc<dyn DestinationsService>,
    meta: Arc<dyn MetaStorage>,
    lock: Arc<dyn DistributedLock>,
    pool: Option<Arc<WorkerPool<SyncTask>>>,
    monitor: Option<PoolMonitor>,
    watcher: Mutex<Option<ConfigWatcher>>,
    closed: AtomicBool,
}

impl SourceService {
    /// Build the service and load sources from `provider`.
    ///
    /// Static and inline JSON configuration errors are returned. A file or
    /// HTTP provider is fetched once right away and then polled; its fetch and
    /// parse errors are only logged.
    pub fn new(
        provider: Option<SourcesProvider>,
        settings: &ServiceSettings,
        factory: DriverFactory,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>, SourcesError> {
        let Some(provider) = provider else {
            warn!("sources aren't configured");
            return Ok(Arc::new(Self::assemble(factory, collaborators, None, None)));
        };

        // Decode inline payloads before spawning any thread.
        let initial = match &provider {
            SourcesProvider::Static(configs) => Some(configs.clone()),
            SourcesProvider::InlineJson(json) => Some(parse_from_bytes(json.as_bytes())?),
            SourcesProvider::File(_) | SourcesProvider::Http(_) => None,
        };

        let pool = Arc::new(WorkerPool::new(
            SERVICE_NAME,
            settings.pool_size,
            collaborators.notifier.clone(),
        )?);
        let sampled = pool.clone();
        let monitor = PoolMonitor::start(
            settings.monitor_interval,
            move || (sampled.running(), sampled.free()),
            collaborators.observer.clone(),
        )
        .map_err(SourcesError::Monitor)?;

        let service = Arc::new(Self::assemble(
            factory,
            collaborators,
            Some(pool),
            Some(monitor),
        ));

        match (initial, provider) {
            (Some(configs), _) => {
                service.load(configs);
            }
            (None, SourcesProvider::File(path)) => {
                service.start_watching(ResourceLoader::File(path), settings.reload_interval)?;
            }
            (None, SourcesProvider::Http(url)) => {
                service.start_watching(ResourceLoader::Http(url), settings.reload_interval)?;
            }
            (None, _) => {}
        }

        if service.registry.snapshot().is_empty() {
            error!("sources are empty");
        }
        Ok(service)
    }

    fn assemble(
        factory: DriverFactory,
        collaborators: Collaborators,
        pool: Option<Arc<WorkerPool<SyncTask>>>,
        monitor: Option<PoolMonitor>,
    ) -> Self {
        Self {
            registry: SourceRegistry::new(),
            factory,
            destinations: collaborators.destinations,
            meta: collaborators.meta,
            lock: collaborators.lock,
            pool,
            monitor,
            watcher: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn start_watching(
        self: &Arc<Self>,
        loader: ResourceLoader,
        interval: Duration,
    ) -> Result<(), SourcesError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let watcher = ConfigWatcher::watch(SERVICE_NAME, loader, interval, move |payload| {
            if let Some(service) = weak.upgrade() {
                // Errors are logged inside reload; the previous registry stays.
                let _ = service.reload(payload);
            }
        })?;
        *self.watcher.lock() = Some(watcher);
        Ok(())
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Rebuild the registry from `configs`, replacing every source.
    ///
    /// Sources that fail to build are logged and left out; the others are
    /// registered. Returns the new registry version.
    pub fn load(&self, configs: SourceConfigs) -> u64 {
        let mut units = HashMap::with_capacity(configs.len());
        for (name, config) in configs {
            match self.factory.create(&name, &config) {
                Ok(drivers) => {
                    info!(source = %name, collections = drivers.len(), "source has been initialized");
                    units.insert(name, Unit::new(drivers, config.destinations));
                }
                Err(e) => {
                    error!(
                        source = %name,
                        source_type = %config.resolved_type(&name),
                        error = %e,
                        "error initializing source"
                    );
                }
            }
        }
        let count = units.len();
        let version = self.registry.replace(units);
        debug!(version, sources = count, "sources registry replaced");
        version
    }

    /// Apply a JSON payload from the sources provider.
    ///
    /// A payload that does not parse leaves the registry untouched.
    pub fn reload(&self, payload: &[u8]) -> Result<u64, SourcesError> {
        match parse_from_bytes(payload) {
            Ok(configs) => Ok(self.load(configs)),
            Err(e) => {
                error!(error = %e, "error updating sources; keeping previous configuration");
                Err(e.into())
            }
        }
    }

    /// Dispatch one sync task per collection of `source_id`.
    ///
    /// Returns once every collection was dispatched or failed to dispatch;
    /// the outcome of the sync itself is recorded in meta storage.
    pub fn sync(&self, source_id: &str) -> Result<(), SyncError> {
        let unit = self
            .registry
            .get(source_id)
            .ok_or_else(|| SyncError::NotFound(source_id.to_string()))?;

        let storages = self.live_destinations(source_id, &unit);
        if storages.is_empty() {
            return Err(SyncError::EmptyDestinations(source_id.to_string()));
        }
        let storages: Arc<[Arc<dyn Storage>]> = storages.into();

        let mut errors = DispatchErrors::default();
        for (collection, driver) in unit.drivers() {
            let guard = match LockGuard::acquire(&self.lock, source_id, collection) {
                Ok(guard) => guard,
                Err(error) => {
                    warn!(source = %source_id, collection = %collection, error = %error, "failed to lock collection");
                    errors.push(DispatchFailure::Lock {
                        source_id: source_id.to_string(),
                        collection: collection.to_string(),
                        error,
                    });
                    continue;
                }
            };

            let task = SyncTask::new(
                source_id,
                collection,
                driver.clone(),
                storages.clone(),
                self.meta.clone(),
                guard,
            );
            // A rejected task is dropped with its guard, releasing the lock.
            let submitted = match &self.pool {
                Some(pool) => pool.submit(task),
                None => Err(PoolError::Closed),
            };
            match submitted {
                Ok(()) => {
                    debug!(task = %task_identifier(source_id, collection), "sync task dispatched");
                }
                Err(error) => {
                    warn!(source = %source_id, collection = %collection, error = %error, "failed to dispatch sync task");
                    errors.push(DispatchFailure::Submit {
                        source_id: source_id.to_string(),
                        collection: collection.to_string(),
                        error,
                    });
                }
            }
        }

        errors.into_result().map_err(SyncError::from)
    }

    fn live_destinations(&self, source_id: &str, unit: &Unit) -> Vec<Arc<dyn Storage>> {
        let mut storages = Vec::with_capacity(unit.destination_ids().len());
        for destination_id in unit.destination_ids() {
            match self.destinations.storage_by_id(destination_id) {
                Some(proxy) => match proxy.get() {
                    Some(storage) => storages.push(storage),
                    None => error!(
                        source = %source_id,
                        destination = %destination_id,
                        "unable to get destination: destination isn't initialized"
                    ),
                },
                None => error!(
                    source = %source_id,
                    destination = %destination_id,
                    "unable to get destination: doesn't exist"
                ),
            }
        }
        storages
    }

    /// Status of every collection of `source_id`.
    pub fn status(&self, source_id: &str) -> Result<BTreeMap<String, String>, SourcesError> {
        self.read_meta(source_id, "status", |meta, s, c| meta.collection_status(s, c))
    }

    /// Last log of every collection of `source_id`.
    pub fn logs(&self, source_id: &str) -> Result<BTreeMap<String, String>, SourcesError> {
        self.read_meta(source_id, "logs", |meta, s, c| meta.collection_log(s, c))
    }

    fn read_meta<F>(
        &self,
        source_id: &str,
        what: &'static str,
        read: F,
    ) -> Result<BTreeMap<String, String>, SourcesError>
    where
        F: Fn(&dyn MetaStorage, &str, &str) -> Result<String, MetaError>,
    {
        let unit = self
            .registry
            .get(source_id)
            .ok_or_else(|| SourcesError::NotFound(source_id.to_string()))?;

        let mut values = BTreeMap::new();
        for collection in unit.collections() {
            let value = read(self.meta.as_ref(), source_id, collection).map_err(|error| {
                SourcesError::MetaStorage {
                    source_id: source_id.to_string(),
                    collection: collection.to_string(),
                    what,
                    error,
                }
            })?;
            values.insert(collection.to_string(), value);
        }
        Ok(values)
    }

    /// `(running, free)` of the sync pool, if the service has one.
    pub fn pool_usage(&self) -> Option<(usize, usize)> {
        self.pool.as_ref().map(|p| (p.running(), p.free()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop watching, monitoring and accepting tasks. Tasks already
    /// dispatched run to completion.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        if let Some(pool) = &self.pool {
            pool.close();
        }
        info!("sources service closed");
    }
}

impl Drop for SourceService {
    fn drop(&mut self) {
        self.close();
    }
}
