//! Fixed-size worker pool with a bounded queue.
//!
//! Each job owns one pool. Submission waits while the queue is full, so a
//! fast listing loop cannot outrun slow workers by more than the queue
//! capacity. Completion is signalled through a watch channel rather than
//! polled.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::MigrateError;

type Task = BoxFuture<'static, ()>;

#[derive(Debug)]
struct Counters {
    submitted: AtomicU64,
    active: AtomicU64,
    completed: watch::Sender<u64>,
}

impl Counters {
    fn is_idle(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0
            && *self.completed.borrow() == self.submitted.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks submitted so far.
    pub submitted: u64,
    /// Tasks finished so far.
    pub completed: u64,
    /// Tasks currently running.
    pub active: u64,
    /// Every worker has exited.
    pub terminated: bool,
}

/// Worker pool for one job.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    terminated: AtomicBool,
}

impl WorkerPool {
    /// Spawns `size` workers reading from a queue of `capacity` tasks.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(name: impl Into<String>, size: usize, capacity: usize) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Task>(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters {
            submitted: AtomicU64::new(0),
            active: AtomicU64::new(0),
            completed: watch::Sender::new(0),
        });

        let workers = (0..size.max(1))
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let counters = Arc::clone(&counters);
                let name = name.clone();
                tokio::spawn(async move {
                    loop {
                        let task = receiver.lock().await.recv().await;
                        let Some(task) = task else {
                            break;
                        };

                        counters.active.fetch_add(1, Ordering::SeqCst);
                        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                            log::error!("{name}: worker {index} task panicked");
                        }
                        counters.active.fetch_sub(1, Ordering::SeqCst);
                        counters.completed.send_modify(|c| *c += 1);
                    }
                    log::trace!("{name}: worker {index} stopped");
                })
            })
            .collect();

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: tokio::sync::Mutex::new(workers),
            counters,
            terminated: AtomicBool::new(false),
        }
    }

    /// Queues `task`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::PoolClosed`] after [`Self::shutdown`].
    pub async fn submit<F>(&self, task: F) -> Result<(), MigrateError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| MigrateError::PoolClosed {
                pool: self.name.clone(),
            })?;

        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        if sender.send(task.boxed()).await.is_err() {
            self.counters.submitted.fetch_sub(1, Ordering::SeqCst);
            return Err(MigrateError::PoolClosed {
                pool: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Tasks submitted so far.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::SeqCst)
    }

    /// Tasks finished so far (including ones that panicked).
    #[must_use]
    pub fn completed(&self) -> u64 {
        *self.counters.completed.borrow()
    }

    /// Tasks currently running.
    #[must_use]
    pub fn active(&self) -> u64 {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.submitted(),
            completed: self.completed(),
            active: self.active(),
            terminated: self.terminated.load(Ordering::SeqCst),
        }
    }

    /// Waits until nothing is running and every submitted task has
    /// finished.
    pub async fn drain(&self) {
        let mut completed = self.counters.completed.subscribe();
        while !self.counters.is_idle() {
            if completed.changed().await.is_err() {
                break;
            }
        }
    }

    /// Closes the queue and waits for every worker to exit. Tasks already
    /// queued still run.
    pub async fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                log::error!("{}: worker failed to join: {e}", self.name);
            }
        }
        self.terminated.store(true, Ordering::SeqCst);
        log::debug!("{}: pool terminated", self.name);
    }
}
