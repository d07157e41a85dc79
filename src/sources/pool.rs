//! Bounded worker pool for sync tasks.
//!
//! A fixed set of worker threads consumes a task queue. Capacity equals the
//! number of workers: a submission is accepted only while fewer than `size`
//! tasks are queued or running, otherwise it is rejected with
//! [`PoolError::Saturated`]. Submission never blocks.
//!
//! Every task runs inside a panic boundary. A panicking task is logged,
//! reported through the [`Notifier`] and the worker carries on with the next
//! task.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};

use super::observe::Notifier;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool size must be positive")]
    InvalidSize,

    #[error("pool is saturated: all {size} workers are busy")]
    Saturated { size: usize },

    #[error("pool is closed")]
    Closed,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Work item executed by a [`WorkerPool`].
pub trait PoolTask: Send + 'static {
    /// Identifier used when reporting failures of this task.
    fn identifier(&self) -> &str;

    fn run(self);
}

pub struct WorkerPool<T: PoolTask> {
    size: usize,
    sender: Mutex<Option<Sender<T>>>,
    in_flight: Arc<AtomicUsize>,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: PoolTask> WorkerPool<T> {
    /// Spawn `size` named worker threads.
    pub fn new(name: &str, size: usize, notifier: Arc<dyn Notifier>) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }

        let (tx, rx) = bounded::<T>(size);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let rx = rx.clone();
            let in_flight = in_flight.clone();
            let notifier = notifier.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{idx}"))
                .spawn(move || worker_loop(rx, in_flight, notifier))
                .map_err(|e| PoolError::Spawn(e.to_string()))?;
            workers.push(handle);
        }

        info!(pool = %name, size, "worker pool started");
        Ok(Self {
            size,
            sender: Mutex::new(Some(tx)),
            in_flight,
            closed: AtomicBool::new(false),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task without blocking.
    ///
    /// On error the task is dropped, which releases whatever it owns.
    pub fn submit(&self, task: T) -> Result<(), PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let size = self.size;
        if self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < size).then_some(n + 1)
            })
            .is_err()
        {
            return Err(PoolError::Saturated { size });
        }

        let sender = self.sender.lock();
        let result = match sender.as_ref() {
            Some(tx) => tx.try_send(task).map_err(|e| match e {
                TrySendError::Full(_) => PoolError::Saturated { size },
                TrySendError::Disconnected(_) => PoolError::Closed,
            }),
            None => Err(PoolError::Closed),
        };
        drop(sender);

        if result.is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    /// Tasks accepted and not yet finished.
    pub fn running(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Remaining capacity.
    pub fn free(&self) -> usize {
        self.size.saturating_sub(self.running())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks. Queued and running tasks still complete; workers
    /// exit once the queue drains.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender.lock().take();
        debug!(size = self.size, "worker pool closed");
    }

    /// Close and wait for every worker to exit.
    pub fn join(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl<T: PoolTask> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop<T: PoolTask>(
    rx: Receiver<T>,
    in_flight: Arc<AtomicUsize>,
    notifier: Arc<dyn Notifier>,
) {
    for task in rx.iter() {
        let _slot = InFlightSlot(&in_flight);
        let identifier = task.identifier().to_string();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || task.run())) {
            let message = panic_message(payload.as_ref());
            error!(task = %identifier, panic = %message, "sync task panicked");
            let notified =
                catch_unwind(AssertUnwindSafe(|| notifier.task_panicked(&identifier, &message)));
            if let Err(payload) = notified {
                error!(
                    task = %identifier,
                    panic = %panic_message(payload.as_ref()),
                    "panic notifier panicked"
                );
            }
        }
    }
}

/// Frees one unit of pool capacity when the task it was taken for is done.
struct InFlightSlot<'a>(&'a AtomicUsize);

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
