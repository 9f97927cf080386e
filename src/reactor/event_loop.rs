use super::multiplexer::{Multiplexer, WAKER};
use crate::error::{Error, Result};
use mio::{Poll, Waker};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{error, info, warn};

/// Socket read continuation.
pub const PRIORITY_IO: u8 = 4;
/// Dispatcher events.
pub const PRIORITY_EVENT: u8 = 5;
/// Register and unregister control tasks.
pub const PRIORITY_CONTROL: u8 = 6;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

/// Tasks drained per turn before the loop polls again.
const TASKS_PER_TURN: usize = 256;

pub type Task = Box<dyn FnOnce(&mut Multiplexer) + Send>;

struct Queued {
    priority: u8,
    seq: u64,
    task: Task,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence (FIFO).
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue with FIFO order inside each priority.
#[derive(Default)]
pub(crate) struct TaskQueue {
    heap: BinaryHeap<Queued>,
    seq: u64,
}

impl TaskQueue {
    pub(crate) fn push(&mut self, priority: u8, task: Task) {
        self.seq += 1;
        self.heap.push(Queued {
            priority,
            seq: self.seq,
            task,
        });
    }

    pub(crate) fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|queued| queued.task)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

struct Shared {
    id: usize,
    queue: Mutex<TaskQueue>,
    waker: Waker,
    shutdown: AtomicBool,
    thread: OnceLock<ThreadId>,
    submitted: AtomicU64,
}

/// Cloneable handle used to push work onto a loop from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Queue `task` to run on the loop thread with access to its multiplexer.
    pub fn submit<F>(&self, priority: u8, task: F) -> Result<()>
    where
        F: FnOnce(&mut Multiplexer) + Send + 'static,
    {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(Error::InvalidPriority(priority));
        }
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }

        self.shared.queue.lock().push(priority, Box::new(task));
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.waker.wake()?;
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Whether the caller is running on this loop's thread.
    pub fn in_loop(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Total tasks accepted since the loop started.
    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("id", &self.shared.id).finish()
    }
}

/// One worker thread draining a priority queue and polling its multiplexer.
pub struct EventLoop {
    handle: LoopHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn spawn(name: &str, id: usize, poll_interval: Duration) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let handle = LoopHandle {
            shared: Arc::new(Shared {
                id,
                queue: Mutex::new(TaskQueue::default()),
                waker,
                shutdown: AtomicBool::new(false),
                thread: OnceLock::new(),
                submitted: AtomicU64::new(0),
            }),
        };

        let multiplexer = Multiplexer::new(poll, handle.clone());
        let thread_name = format!("{}-{}", name, id);
        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(multiplexer, poll_interval))?;

        Ok(Self {
            handle,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Ask the loop to stop after its current turn.
    pub fn shutdown(&self) {
        if !self.handle.shared.shutdown.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.handle.shared.waker.wake() {
                warn!("Failed to wake event loop {}: {}", self.handle.id(), e);
            }
        }
    }

    pub fn join(&self) {
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Event loop {} panicked", self.handle.id());
            }
        }
    }
}

fn run(mut multiplexer: Multiplexer, poll_interval: Duration) {
    let shared = Arc::clone(&multiplexer.handle().shared);
    let _ = shared.thread.set(thread::current().id());
    info!("Event loop {} started", shared.id);

    while !shared.shutdown.load(Ordering::Acquire) {
        let timeout = if shared.queue.lock().is_empty() {
            poll_interval
        } else {
            Duration::ZERO
        };

        if let Err(e) = multiplexer.turn(timeout) {
            error!("Event loop {} poll failed: {}", shared.id, e);
            break;
        }

        drain(&shared, &mut multiplexer, TASKS_PER_TURN);
    }

    shared.shutdown.store(true, Ordering::Release);
    drain(&shared, &mut multiplexer, usize::MAX);
    multiplexer.shutdown_all();
    drain(&shared, &mut multiplexer, usize::MAX);

    info!("Event loop {} stopped", shared.id);
}

fn drain(shared: &Shared, multiplexer: &mut Multiplexer, limit: usize) {
    for _ in 0..limit {
        // Pop under the lock, run outside it.
        let task = shared.queue.lock().pop();
        let Some(task) = task else {
            break;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| task(multiplexer))).is_err() {
            error!("Task panicked on event loop {}", shared.id);
        }
    }
}

/// Fixed set of loops handed out round-robin.
pub struct EventLoopGroup {
    name: String,
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    pub fn new(name: &str, size: usize, poll_interval: Duration) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config(format!("{} group needs at least one loop", name)));
        }

        let loops = (0..size)
            .map(|id| EventLoop::spawn(name, id, poll_interval))
            .collect::<Result<Vec<_>>>()?;

        info!("Started {} group with {} loops", name, size);
        Ok(Self {
            name: name.to_string(),
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// Next loop in round-robin order.
    pub fn next(&self) -> &LoopHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].handle()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = &LoopHandle> {
        self.loops.iter().map(EventLoop::handle)
    }

    pub fn shutdown(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
    }

    pub fn join(&self) {
        for event_loop in &self.loops {
            event_loop.join();
        }
        info!("{} group stopped", self.name);
    }
}
