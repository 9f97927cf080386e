//! Single timer thread for recurring session checks.

use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Continue,
    Stop,
}

type TimerTask = Box<dyn FnMut() -> TimerAction + Send>;

struct Entry {
    due: Instant,
    seq: u64,
    interval: Duration,
    cancelled: Arc<AtomicBool>,
    task: TimerTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap yields the earliest deadline.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    entries: BinaryHeap<Entry>,
    seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Cancels a scheduled task. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub struct Timer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(name: &str) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(worker))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `task` every `interval` until it returns [`TimerAction::Stop`] or
    /// the handle is cancelled.
    pub fn schedule_repeating<F>(&self, interval: Duration, task: F) -> TimerHandle
    where
        F: FnMut() -> TimerAction + Send + 'static,
    {
        self.schedule(interval, interval, Box::new(task))
    }

    /// Run `task` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Some(task);
        self.schedule(
            delay,
            Duration::ZERO,
            Box::new(move || {
                if let Some(task) = task.take() {
                    task();
                }
                TimerAction::Stop
            }),
        )
    }

    fn schedule(&self, delay: Duration, interval: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.shared.state.lock();
        if state.shutdown {
            cancelled.store(true, Ordering::Release);
            return TimerHandle { cancelled };
        }

        state.seq += 1;
        let seq = state.seq;
        state.entries.push(Entry {
            due: Instant::now() + delay,
            seq,
            interval,
            cancelled: Arc::clone(&cancelled),
            task,
        });
        drop(state);
        self.shared.cond.notify_one();

        TimerHandle { cancelled }
    }

    /// Number of scheduled tasks, cancelled ones included until they come due.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.entries.clear();
        }
        self.shared.cond.notify_all();

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Timer thread panicked");
            }
        }
    }
}

fn run(shared: Arc<Shared>) {
    info!("Timer started");
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }

        let now = Instant::now();
        let due = match state.entries.peek() {
            None => {
                shared.cond.wait(&mut state);
                continue;
            }
            Some(entry) => entry.due,
        };
        if due > now {
            shared.cond.wait_until(&mut state, due);
            continue;
        }

        let Some(mut entry) = state.entries.pop() else {
            continue;
        };
        if entry.cancelled.load(Ordering::Acquire) {
            continue;
        }

        // Run without holding the lock so tasks may schedule or cancel.
        let action = parking_lot::MutexGuard::unlocked(&mut state, || (entry.task)());

        if action == TimerAction::Continue
            && !entry.interval.is_zero()
            && !entry.cancelled.load(Ordering::Acquire)
            && !state.shutdown
        {
            entry.due = Instant::now() + entry.interval;
            state.seq += 1;
            entry.seq = state.seq;
            state.entries.push(entry);
        }
    }
    info!("Timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn repeating_task_runs_until_stopped() {
        let timer = Timer::new("test-timer").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        timer.schedule_repeating(Duration::from_millis(5), move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                TimerAction::Stop
            } else {
                TimerAction::Continue
            }
        });

        thread::sleep(Duration::from_millis(200));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(timer.is_empty());
        timer.shutdown();
    }

    #[test]
    fn cancelled_task_never_runs_again() {
        let timer = Timer::new("test-timer").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = timer.schedule_repeating(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            TimerAction::Continue
        });
        handle.cancel();
        assert!(handle.is_cancelled());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        timer.shutdown();
    }

    #[test]
    fn earliest_deadline_runs_first() {
        let timer = Timer::new("test-timer").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("late", 60u64), ("early", 10), ("middle", 30)] {
            let order = Arc::clone(&order);
            timer.schedule_once(Duration::from_millis(delay), move || order.lock().push(label));
        }

        thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
        timer.shutdown();
    }
}
