//! Threads that drive sessions: event loops, the worker pool and the timer.

pub mod event_loop;
pub mod multiplexer;
pub mod timer;
pub mod worker_pool;

use crate::config::RuntimeConfig;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

pub use event_loop::{
    EventLoop, EventLoopGroup, LoopHandle, PRIORITY_CONTROL, PRIORITY_EVENT, PRIORITY_IO,
};
pub use multiplexer::{Multiplexer, Readiness, Selectable, Step};
pub use timer::{Timer, TimerAction, TimerHandle};
pub use worker_pool::{Job, ThreadPool, WorkerPool};

/// How long graceful shutdown waits for in-flight jobs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Everything a set of connections runs on.
///
/// Listeners go to the accept group, connections to the I/O group, and sends to
/// the worker pool. Shut it down explicitly; loop threads keep it alive.
pub struct Runtime {
    accept: EventLoopGroup,
    io: EventLoopGroup,
    workers: Arc<dyn WorkerPool>,
    timer: Timer,
    shutdown: AtomicBool,
}

impl Runtime {
    pub fn new(config: &RuntimeConfig) -> Result<Arc<Self>> {
        let workers = ThreadPool::new("sockloop-worker", config.worker_threads, config.worker_queue)?;
        Self::with_worker_pool(config, Arc::new(workers))
    }

    /// Build a runtime around a caller-supplied pool.
    pub fn with_worker_pool(config: &RuntimeConfig, workers: Arc<dyn WorkerPool>) -> Result<Arc<Self>> {
        let poll_interval = config.poll_interval();
        let accept = EventLoopGroup::new("sockloop-accept", config.accept_threads, poll_interval)?;
        let io = EventLoopGroup::new("sockloop-io", config.io_threads, poll_interval)?;
        let timer = Timer::new("sockloop-timer")?;

        info!(
            "Runtime started: {} accept loops, {} io loops",
            accept.len(),
            io.len()
        );

        Ok(Arc::new(Self {
            accept,
            io,
            workers,
            timer,
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn accept_group(&self) -> &EventLoopGroup {
        &self.accept
    }

    pub fn io_group(&self) -> &EventLoopGroup {
        &self.io
    }

    pub fn workers(&self) -> &Arc<dyn WorkerPool> {
        &self.workers
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting, close every registered connection, drain the worker
    /// pool and stop the timer. Blocks until all threads have exited.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Initiating runtime shutdown");
        self.accept.shutdown();
        self.accept.join();
        self.io.shutdown();
        self.io.join();
        self.workers.shutdown_gracefully(SHUTDOWN_GRACE);
        self.timer.shutdown();
        info!("Runtime shutdown complete");
    }
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_starts_and_stops() {
        let config = RuntimeConfig {
            accept_threads: 1,
            io_threads: 2,
            worker_threads: 1,
            worker_queue: 8,
            poll_interval_ms: 20,
        };
        let runtime = Runtime::new(&config).unwrap();
        assert_eq!(runtime.io_group().len(), 2);

        runtime.shutdown();
        runtime.shutdown();
        assert!(runtime.is_shutdown());
        assert!(runtime.workers().is_shutdown());
        assert!(runtime.io_group().next().is_shutdown());
    }

    #[test]
    fn wait_until_times_out() {
        assert!(wait_until(Duration::from_millis(5), || true));
        assert!(!wait_until(Duration::from_millis(5), || false));
    }
}
