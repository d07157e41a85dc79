//! Operator notification and pool usage sampling.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, error};

/// Receives failures that need operator attention.
pub trait Notifier: Send + Sync {
    fn task_panicked(&self, identifier: &str, message: &str);
}

/// Receives periodic pool usage samples.
pub trait PoolObserver: Send + Sync {
    fn record_pool_usage(&self, running: usize, free: usize);
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn task_panicked(&self, identifier: &str, message: &str) {
        error!(
            target: "sourcesync::alerts",
            task = %identifier,
            panic = %message,
            "sync task panicked; operator attention required"
        );
    }
}

/// Observer that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl PoolObserver for LogObserver {
    fn record_pool_usage(&self, running: usize, free: usize) {
        debug!(running, free, "sync pool usage");
    }
}

/// Background loop forwarding pool usage to a [`PoolObserver`].
///
/// Samples immediately, then every `interval`, until [`stop`](Self::stop) is
/// called or the monitor is dropped.
pub struct PoolMonitor {
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PoolMonitor {
    pub fn start<F>(
        interval: Duration,
        sample: F,
        observer: Arc<dyn PoolObserver>,
    ) -> std::io::Result<Self>
    where
        F: Fn() -> (usize, usize) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("sources-pool-monitor".to_string())
            .spawn(move || {
                loop {
                    let (running, free) = sample();
                    observer.record_pool_usage(running, free);
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("pool monitor stopped");
            })?;

        Ok(Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop sampling and wait for the loop to exit.
    pub fn stop(&self) {
        // Dropping the sender wakes the loop immediately.
        self.stop_tx.lock().take();
        if let Some(handle) = self.handle.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for PoolMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
