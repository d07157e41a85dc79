use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use sourcesync::drivers::{Collection, Driver, DriverConstructor, DriverFactory, SourceConfig};
use sourcesync::sources::{
    Collaborators, DistributedLock, InMemoryMetaStorage, LocalLock, LockError, LockHandle,
    MetaError, MetaStorage, Notifier, ServiceSettings, SourceService, SourcesProvider,
    StaticDestinations, Storage,
};

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Restores an environment variable on drop.
#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A latch drivers can block on until the test opens it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

#[allow(dead_code)]
impl Gate {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        while !*open {
            if self.cv.wait_until(&mut open, deadline).timed_out() {
                return;
            }
        }
    }
}

/// Shared record of driver executions.
#[derive(Default)]
pub struct DriverLog {
    started: Mutex<Vec<String>>,
    active: Mutex<HashMap<String, usize>>,
    max_active: Mutex<HashMap<String, usize>>,
    finished: AtomicUsize,
    pub gate: Gate,
}

#[allow(dead_code)]
impl DriverLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().len()
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.lock().values().sum()
    }

    /// Highest number of simultaneous runs seen for one identifier.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.lock().values().copied().max().unwrap_or(0)
    }

    fn enter(&self, identifier: &str) {
        self.started.lock().push(identifier.to_string());
        let mut active = self.active.lock();
        let now = active.entry(identifier.to_string()).or_default();
        *now += 1;
        let mut max = self.max_active.lock();
        let peak = max.entry(identifier.to_string()).or_default();
        *peak = (*peak).max(*now);
    }

    fn leave(&self, identifier: &str) {
        if let Some(n) = self.active.lock().get_mut(identifier) {
            *n -= 1;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a scripted driver does, read from the collection `behavior` parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
    Block,
}

struct ScriptedDriver {
    identifier: String,
    table: String,
    behavior: Behavior,
    sleep: Duration,
    log: Arc<DriverLog>,
}

struct Leave<'a>(&'a ScriptedDriver);

impl Drop for Leave<'_> {
    fn drop(&mut self) {
        self.0.log.leave(&self.0.identifier);
    }
}

impl Driver for ScriptedDriver {
    fn sync(&self, destinations: &[Arc<dyn Storage>]) -> anyhow::Result<()> {
        self.log.enter(&self.identifier);
        let _leave = Leave(self);
        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
        match self.behavior {
            Behavior::Succeed => {}
            Behavior::Fail => anyhow::bail!("upstream returned 503"),
            Behavior::Panic => panic!("driver exploded"),
            Behavior::Block => self.log.gate.wait(Duration::from_secs(10)),
        }
        let row = serde_json::json!({ "collection": self.identifier });
        for storage in destinations {
            storage.store(&self.table, std::slice::from_ref(&row))?;
        }
        Ok(())
    }
}

/// Builds [`ScriptedDriver`]s; identifiers are `<type>_<collection>`.
pub struct ScriptedConstructor {
    log: Arc<DriverLog>,
}

impl DriverConstructor for ScriptedConstructor {
    fn create(
        &self,
        config: &SourceConfig,
        collection: &Collection,
    ) -> anyhow::Result<Arc<dyn Driver>> {
        let param = |key: &str| collection.parameters.get(key);
        let behavior = match param("behavior").and_then(Value::as_str) {
            None | Some("ok") => Behavior::Succeed,
            Some("fail") => Behavior::Fail,
            Some("panic") => Behavior::Panic,
            Some("block") => Behavior::Block,
            Some("refuse") => anyhow::bail!("collection {} is not supported", collection.name),
            Some(other) => anyhow::bail!("unknown behavior {other}"),
        };
        let sleep = Duration::from_millis(param("sleep_ms").and_then(Value::as_u64).unwrap_or(0));
        let table = if collection.table_name.is_empty() {
            collection.name.clone()
        } else {
            collection.table_name.clone()
        };
        Ok(Arc::new(ScriptedDriver {
            identifier: format!("{}_{}", config.source_type, collection.name),
            table,
            behavior,
            sleep,
            log: self.log.clone(),
        }))
    }
}

/// Factory knowing the `crm`, `shop` and `erp` source types.
pub fn scripted_factory(log: &Arc<DriverLog>) -> DriverFactory {
    let mut factory = DriverFactory::new();
    for source_type in ["crm", "shop", "erp"] {
        factory.register(source_type, ScriptedConstructor { log: log.clone() });
    }
    factory
}

/// Storage that keeps every written row.
#[derive(Default)]
pub struct MemoryStorage {
    id: String,
    rows: Mutex<Vec<(String, Value)>>,
}

#[allow(dead_code)]
impl MemoryStorage {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            rows: Mutex::new(Vec::new()),
        })
    }

    pub fn tables(&self) -> BTreeSet<String> {
        self.rows.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl Storage for MemoryStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn store(&self, table: &str, objects: &[Value]) -> anyhow::Result<()> {
        let mut rows = self.rows.lock();
        rows.extend(objects.iter().map(|o| (table.to_string(), o.clone())));
        Ok(())
    }
}

/// Lock delegating to [`LocalLock`], failing on demand for chosen collections.
#[derive(Default)]
pub struct FlakyLock {
    inner: LocalLock,
    unavailable: Mutex<HashSet<String>>,
    holders: Mutex<HashMap<(String, String), usize>>,
    max_holders: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, collection: &str) {
        self.unavailable.lock().insert(collection.to_string());
    }

    pub fn is_locked(&self, source_id: &str, collection: &str) -> bool {
        self.inner.is_locked(source_id, collection)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders seen for one (source, collection).
    pub fn max_holders(&self) -> usize {
        self.max_holders.load(Ordering::SeqCst)
    }
}

impl DistributedLock for FlakyLock {
    fn lock(&self, source_id: &str, collection: &str) -> Result<LockHandle, LockError> {
        if self.unavailable.lock().contains(collection) {
            return Err(LockError::Unavailable("lock service timed out".to_string()));
        }
        let handle = self.inner.lock(source_id, collection)?;
        {
            let mut holders = self.holders.lock();
            let now = holders
                .entry((source_id.to_string(), collection.to_string()))
                .or_default();
            *now += 1;
            self.max_holders.fetch_max(*now, Ordering::SeqCst);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn unlock(&self, handle: &LockHandle) {
        let key = (handle.source_id.clone(), handle.collection.clone());
        if let Some(n) = self.holders.lock().get_mut(&key) {
            *n = n.saturating_sub(1);
        }
        self.inner.unlock(handle);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Meta storage whose reads always fail.
pub struct BrokenMeta;

impl MetaStorage for BrokenMeta {
    fn collection_status(&self, _: &str, _: &str) -> Result<String, MetaError> {
        Err(MetaError::Unavailable("meta database is down".to_string()))
    }

    fn collection_log(&self, _: &str, _: &str) -> Result<String, MetaError> {
        Err(MetaError::Unavailable("meta database is down".to_string()))
    }

    fn update_collection_status(&self, _: &str, _: &str, _: &str) -> Result<(), MetaError> {
        Ok(())
    }

    fn update_collection_log(&self, _: &str, _: &str, _: &str) -> Result<(), MetaError> {
        Ok(())
    }
}

/// Notifier counting panics.
#[derive(Default)]
pub struct CountingNotifier {
    panics: Mutex<Vec<(String, String)>>,
}

#[allow(dead_code)]
impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.panics.lock().len()
    }

    pub fn last(&self) -> Option<(String, String)> {
        self.panics.lock().last().cloned()
    }
}

impl Notifier for CountingNotifier {
    fn task_panicked(&self, identifier: &str, message: &str) {
        self.panics
            .lock()
            .push((identifier.to_string(), message.to_string()));
    }
}

/// Everything a service test needs to inspect afterwards.
#[allow(dead_code)]
pub struct Harness {
    pub service: Arc<SourceService>,
    pub log: Arc<DriverLog>,
    pub lock: Arc<FlakyLock>,
    pub meta: Arc<dyn MetaStorage>,
    pub warehouse: Arc<MemoryStorage>,
    pub notifier: Arc<CountingNotifier>,
}

#[allow(dead_code)]
impl Harness {
    /// Wait for every dispatched task to finish.
    pub fn wait_idle(&self) -> bool {
        wait_until(Duration::from_secs(10), || {
            self.service.pool_usage().is_none_or(|(running, _)| running == 0)
        })
    }
}

/// Options for [`harness`]; defaults to a pool of 4 and in-memory meta.
#[allow(dead_code)]
pub struct HarnessOptions {
    pub pool_size: usize,
    pub reload_interval: Duration,
    pub meta: Arc<dyn MetaStorage>,
    pub lock: Arc<FlakyLock>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            reload_interval: Duration::ZERO,
            meta: Arc::new(InMemoryMetaStorage::new()),
            lock: FlakyLock::new(),
        }
    }
}

/// Sources service writing to a single `warehouse` destination.
#[allow(dead_code)]
pub fn harness(provider: Option<SourcesProvider>, options: HarnessOptions) -> Harness {
    try_harness(provider, options).expect("service starts")
}

#[allow(dead_code)]
pub fn try_harness(
    provider: Option<SourcesProvider>,
    options: HarnessOptions,
) -> Result<Harness, sourcesync::sources::SourcesError> {
    let log = DriverLog::new();
    let warehouse = MemoryStorage::new("warehouse");
    let destinations = StaticDestinations::new().with_storage(warehouse.clone());
    let notifier = Arc::new(CountingNotifier::default());
    let settings = ServiceSettings {
        pool_size: options.pool_size,
        reload_interval: options.reload_interval,
        monitor_interval: Duration::from_secs(3600),
    };
    let collaborators = Collaborators::new(
        Arc::new(destinations),
        options.meta.clone(),
        options.lock.clone(),
    )
    .with_notifier(notifier.clone());

    let service = SourceService::new(provider, &settings, scripted_factory(&log), collaborators)?;
    Ok(Harness {
        service,
        log,
        lock: options.lock,
        meta: options.meta,
        warehouse,
        notifier,
    })
}

/// Inline JSON provider for `value`.
#[allow(dead_code)]
pub fn inline(value: Value) -> Option<SourcesProvider> {
    Some(SourcesProvider::InlineJson(value.to_string()))
}
