//! Source synchronization.
//!
//! Sources are external systems whose data is pulled periodically and written
//! to destinations. Each source is split into collections that sync
//! independently.
//!
//! # Architecture
//!
//! - **registry**: versioned snapshot of source name -> [`Unit`]
//! - **provider** / **watcher**: where source declarations come from, and
//!   polling of file/HTTP providers
//! - **pool**: bounded worker pool running [`SyncTask`]s
//! - **lock**, **meta**, **destinations**: collaborator contracts plus
//!   in-process implementations
//! - **service**: [`SourceService`], the entry point tying it all together
//!
//! # Sync flow
//!
//! `sync(source)` looks the source up, resolves its live destinations, then
//! for every collection acquires the collection lock and submits a task. The
//! call returns after dispatch; task outcomes land in meta storage and are
//! read back with `status` / `logs`.
//!
//! ```rust,ignore
//! use sourcesync::sources::{Collaborators, ServiceSettings, SourceService, SourcesProvider};
//!
//! let service = SourceService::new(
//!     Some(SourcesProvider::parse("file:///etc/sourcesync/sources.json")?),
//!     &ServiceSettings::default(),
//!     factory,
//!     Collaborators::new(destinations, meta, lock),
//! )?;
//! service.sync("crm")?;
//! println!("{:?}", service.status("crm")?);
//! ```

pub mod destinations;
pub mod error;
pub mod lock;
pub mod meta;
pub mod observe;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod service;
pub mod task;
pub mod watcher;

pub use destinations::{
    DestinationsService, LazyStorage, ReadyStorage, StaticDestinations, Storage, StorageProxy,
};
pub use error::{DispatchErrors, DispatchFailure, SourcesError, SyncError};
pub use lock::{DistributedLock, LocalLock, LockError, LockGuard, LockHandle};
pub use meta::{
    InMemoryMetaStorage, MetaError, MetaStorage, STATUS_FAILED, STATUS_RUNNING, STATUS_SUCCESS,
    SqliteMetaStorage,
};
pub use observe::{LogNotifier, LogObserver, Notifier, PoolMonitor, PoolObserver};
pub use pool::{PoolError, PoolTask, WorkerPool};
pub use provider::{ConfigError, SourceConfigs, SourcesProvider, parse_from_bytes};
pub use registry::{Snapshot, SourceRegistry, Unit};
pub use service::{Collaborators, ServiceSettings, SourceService};
pub use task::{SyncTask, task_identifier};
pub use watcher::{ConfigWatcher, ResourceLoader, WatchError};
