//! Polling of remote source configuration.
//!
//! A watcher fetches a file or HTTP(S) resource on a fixed interval and hands
//! the payload to a callback whenever its SHA-256 digest differs from the last
//! delivered payload. Fetch failures are logged and retried on the next tick;
//! they never stop the watcher.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Timeout for a single HTTP fetch.
const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("failed to spawn watcher thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How a watched resource is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLoader {
    File(PathBuf),
    Http(String),
}

impl ResourceLoader {
    pub fn fetch(&self) -> Result<Vec<u8>, WatchError> {
        match self {
            Self::File(path) => std::fs::read(path).map_err(|source| WatchError::Read {
                path: path.clone(),
                source,
            }),
            Self::Http(url) => fetch_http(url),
        }
    }

    pub fn location(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Http(url) => url.clone(),
        }
    }
}

fn fetch_http(url: &str) -> Result<Vec<u8>, WatchError> {
    let http_err = |reason: String| WatchError::Http {
        url: url.to_string(),
        reason,
    };
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| http_err(e.to_string()))?;
    let response = client
        .get(url)
        .send()
        .map_err(|e| http_err(e.to_string()))?;
    if !response.status().is_success() {
        return Err(http_err(format!("status {}", response.status())));
    }
    let body = response.bytes().map_err(|e| http_err(e.to_string()))?;
    Ok(body.to_vec())
}

fn digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Running watcher; stops when [`stop`](Self::stop) is called or on drop.
pub struct ConfigWatcher {
    name: String,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigWatcher {
    /// Fetch `loader` once synchronously, delivering the payload if the fetch
    /// succeeds, then keep polling every `interval` on a background thread.
    ///
    /// A zero interval disables polling after the initial fetch.
    pub fn watch<F>(
        name: &str,
        loader: ResourceLoader,
        interval: Duration,
        on_update: F,
    ) -> Result<Self, WatchError>
    where
        F: Fn(&[u8]) + Send + 'static,
    {
        let mut last_digest = poll_once(name, &loader, None, &on_update);

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = if interval.is_zero() {
            info!(watcher = %name, resource = %loader.location(), "resource loaded once; polling disabled");
            None
        } else {
            let thread_name = format!("{name}-watcher");
            let watcher_name = name.to_string();
            info!(
                watcher = %name,
                resource = %loader.location(),
                interval_secs = interval.as_secs(),
                "watching resource"
            );
            Some(thread::Builder::new().name(thread_name).spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    last_digest = poll_once(&watcher_name, &loader, last_digest.take(), &on_update);
                }
                debug!(watcher = %watcher_name, "watcher stopped");
            })?)
        };

        Ok(Self {
            name: name.to_string(),
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&self) {
        self.stop_tx.lock().take();
        if let Some(handle) = self.handle.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One fetch; returns the digest of the last delivered payload.
fn poll_once<F>(
    name: &str,
    loader: &ResourceLoader,
    last_digest: Option<String>,
    on_update: &F,
) -> Option<String>
where
    F: Fn(&[u8]),
{
    match loader.fetch() {
        Ok(payload) => {
            let current = digest(&payload);
            if last_digest.as_deref() == Some(current.as_str()) {
                return last_digest;
            }
            debug!(watcher = %name, digest = %current, "resource changed");
            on_update(&payload);
            Some(current)
        }
        Err(e) => {
            warn!(watcher = %name, error = %e, "failed to load resource");
            last_digest
        }
    }
}
