//! Fixed-size pool of worker threads fed from a shared FIFO.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The task never produced a value: it panicked, or the pool was shut
    /// down before accepting it.
    #[error("task canceled")]
    Canceled,
}

struct Queue {
    jobs: VecDeque<Job>,
    running: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

/// Eventual result of a task handed to [`WorkerPool::submit`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    result: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes.
    pub fn join(self) -> Result<T, PoolError> {
        self.result.recv().map_err(|_| PoolError::Canceled)
    }
}

impl WorkerPool {
    /// Start `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                running: true,
            }),
            available: Condvar::new(),
        });

        let workers = (0..size)
            .filter_map(|id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("jchat-worker-{id}"))
                    .spawn(move || worker_loop(shared, id))
                    .map_err(|e| error!(worker = id, error = %e, "Failed to spawn worker"))
                    .ok()
            })
            .collect::<Vec<_>>();

        info!(workers = workers.len(), "Worker pool started");
        Self {
            shared,
            workers: Mutex::new(workers),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a fire-and-forget task. Returns `false` once the pool is shut
    /// down; the task is dropped without running.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = lock(&self.shared.queue);
        if !queue.running {
            warn!("Worker pool is shut down, rejecting task");
            return false;
        }
        queue.jobs.push_back(Box::new(task));
        drop(queue);
        self.shared.available.notify_one();
        true
    }

    /// Queue a task and get a handle to its result.
    pub fn submit<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.execute(move || {
            // The caller may have dropped the handle.
            let _ = tx.send(task());
        });
        TaskHandle { result: rx }
    }

    /// Tasks queued but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).jobs.len()
    }

    /// Stop accepting tasks, let the workers finish everything already
    /// queued, then join them. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = lock(&self.shared.queue);
            if queue.running {
                queue.running = false;
                info!(queued = queue.jobs.len(), "Worker pool shutting down");
            }
        }
        self.shared.available.notify_all();

        let workers = std::mem::take(&mut *lock(&self.workers));
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked outside a task");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize) {
    loop {
        let job = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if !queue.running {
                    debug!(worker = id, "Worker exiting");
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(worker = id, panic = panic_message(&*payload), "Task panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
