use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub type Job = Box<dyn FnOnce() + Send>;

/// A pool that can run a task. Sends and other blocking work go here so the
/// event loops never block on a socket write.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Job) -> Result<()>;

    fn is_shutdown(&self) -> bool;

    /// Stop accepting jobs and wait up to `timeout` for running ones.
    /// Returns whether every worker finished in time.
    fn shutdown_gracefully(&self, timeout: Duration) -> bool;
}

/// Fixed-size pool fed by a bounded crossbeam queue.
pub struct ThreadPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ThreadPool {
    pub fn new(name: &str, threads: usize, queue: usize) -> Result<Self> {
        if threads == 0 || queue == 0 {
            return Err(Error::Config(
                "worker pool needs at least one thread and one queue slot".into(),
            ));
        }

        let (sender, receiver) = bounded::<Job>(queue);
        let workers = (0..threads)
            .map(|id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", name, id))
                    .spawn(move || work(id, receiver))
                    .map_err(Error::from)
            })
            .collect::<Result<Vec<_>>>()?;

        info!("Started worker pool with {} threads", threads);
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            shutdown: AtomicBool::new(false),
        })
    }
}

fn work(id: usize, receiver: Receiver<Job>) {
    debug!("Worker {} started", id);
    while let Ok(job) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job panicked on worker {}", id);
        }
    }
    debug!("Worker {} stopped", id);
}

impl WorkerPool for ThreadPool {
    fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(Error::Shutdown);
        };

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Rejected("worker queue is full".into())),
            Err(TrySendError::Disconnected(_)) => Err(Error::Shutdown),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn shutdown_gracefully(&self, timeout: Duration) -> bool {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return self.workers.lock().is_empty();
        }

        // Dropping the sender lets workers finish the queue and exit.
        self.sender.lock().take();

        let deadline = Instant::now() + timeout;
        let mut workers = self.workers.lock();
        while workers.iter().any(|worker| !worker.is_finished()) {
            if Instant::now() >= deadline {
                warn!("Worker pool did not stop within {:?}", timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        info!("Worker pool stopped");
        true
    }
}
