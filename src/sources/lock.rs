//! Cluster-wide mutual exclusion per (source, collection).
//!
//! A [`DistributedLock`] is provided by the synchronization subsystem of the
//! deployment. The sources service only ever holds locks through a
//! [`LockGuard`], which releases the lock exactly once when dropped, including
//! when a sync task unwinds.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("[{source_id}] source [{collection}] collection is already locked")]
    AlreadyLocked {
        source_id: String,
        collection: String,
    },

    #[error("lock service unavailable: {0}")]
    Unavailable(String),

    #[error("lock acquisition timed out after {0:?}")]
    Timeout(Duration),
}

/// Proof of a granted lock, handed back on release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockHandle {
    pub source_id: String,
    pub collection: String,
    /// Identifies this particular grant; opaque to callers.
    pub token: u64,
}

pub trait DistributedLock: Send + Sync {
    /// Acquire the lock for (`source_id`, `collection`). Implementations own
    /// any retry or timeout policy.
    fn lock(&self, source_id: &str, collection: &str) -> Result<LockHandle, LockError>;

    fn unlock(&self, handle: &LockHandle);
}

/// Scoped lock acquisition; the lock is released when the guard drops.
pub struct LockGuard {
    lock: Arc<dyn DistributedLock>,
    handle: Option<LockHandle>,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

impl LockGuard {
    pub fn acquire(
        lock: &Arc<dyn DistributedLock>,
        source_id: &str,
        collection: &str,
    ) -> Result<Self, LockError> {
        let handle = lock.lock(source_id, collection)?;
        Ok(Self {
            lock: lock.clone(),
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(
                source = %handle.source_id,
                collection = %handle.collection,
                "releasing collection lock"
            );
            self.lock.unlock(&handle);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// In-process lock for single-node deployments.
///
/// At most one holder per (source, collection); contention fails fast with
/// [`LockError::AlreadyLocked`].
#[derive(Debug, Default)]
pub struct LocalLock {
    held: Mutex<HashMap<(String, String), u64>>,
    next_token: AtomicU64,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, source_id: &str, collection: &str) -> bool {
        self.held
            .lock()
            .contains_key(&(source_id.to_string(), collection.to_string()))
    }
}

impl DistributedLock for LocalLock {
    fn lock(&self, source_id: &str, collection: &str) -> Result<LockHandle, LockError> {
        let key = (source_id.to_string(), collection.to_string());
        let mut held = self.held.lock();
        if held.contains_key(&key) {
            return Err(LockError::AlreadyLocked {
                source_id: key.0,
                collection: key.1,
            });
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(key, token);
        Ok(LockHandle {
            source_id: source_id.to_string(),
            collection: collection.to_string(),
            token,
        })
    }

    fn unlock(&self, handle: &LockHandle) {
        let key = (handle.source_id.clone(), handle.collection.clone());
        let mut held = self.held.lock();
        match held.get(&key) {
            Some(token) if *token == handle.token => {
                held.remove(&key);
            }
            _ => warn!(
                source = %handle.source_id,
                collection = %handle.collection,
                "unlock of a lock that is not held by this handle"
            ),
        }
    }
}
