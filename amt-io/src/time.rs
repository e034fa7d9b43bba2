//! Shared timer facility
//!
//! A `Scheduler` runs one background thread that executes one-shot closures
//! at their deadlines. Cloning a scheduler shares the same thread; the thread
//! exits once every clone has been dropped. Pending timers are discarded at
//! that point without running.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct TimerState {
    cancelled: AtomicBool,
    fired: AtomicBool,
}

/// Handle to a scheduled closure
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<TimerState>,
    deadline: Instant,
}

impl TimerHandle {
    /// Prevent the closure from running if it has not run yet
    pub fn cancel(&self) {
        self.state.cancelled.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Whether the closure has started running
    pub fn has_fired(&self) -> bool {
        self.state.fired.load(AtomicOrdering::Acquire)
    }

    /// Neither cancelled nor fired
    pub fn is_pending(&self) -> bool {
        !self.is_cancelled() && !self.has_fired()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed or the timer
    /// is no longer pending
    pub fn remaining(&self) -> Duration {
        if !self.is_pending() {
            return Duration::ZERO;
        }
        self.deadline.saturating_duration_since(Instant::now())
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    state: Arc<TimerState>,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One-shot timer scheduler backed by a worker thread
#[derive(Clone)]
pub struct Scheduler {
    sender: Sender<Entry>,
    seq: Arc<AtomicU64>,
}

impl Scheduler {
    /// Start a scheduler thread
    pub fn new() -> io::Result<Self> {
        Self::with_name("amt-timer")
    }

    /// Start a scheduler thread with the given thread name
    pub fn with_name(name: &str) -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(receiver))?;

        Ok(Scheduler {
            sender,
            seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Run `task` once after `delay`
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Run `task` once at `deadline`
    pub fn schedule_at<F>(&self, deadline: Instant, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(TimerState::default());
        let entry = Entry {
            deadline,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            state: Arc::clone(&state),
            task: Box::new(task),
        };

        if self.sender.send(entry).is_err() {
            warn!("Timer thread has exited; timer discarded");
            state.cancelled.store(true, AtomicOrdering::Release);
        }

        TimerHandle { state, deadline }
    }
}

fn run(receiver: Receiver<Entry>) {
    let mut queue: BinaryHeap<Entry> = BinaryHeap::new();

    loop {
        let next = match queue.peek() {
            Some(entry) => receiver.recv_deadline(entry.deadline),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match next {
            Ok(entry) => queue.push(entry),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                trace!("Timer thread exiting, {} timers discarded", queue.len());
                return;
            }
        }

        let now = Instant::now();
        while queue.peek().map_or(false, |entry| entry.deadline <= now) {
            if let Some(entry) = queue.pop() {
                if entry.state.cancelled.load(AtomicOrdering::Acquire) {
                    continue;
                }
                entry.state.fired.store(true, AtomicOrdering::Release);
                (entry.task)();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_timer_fires() {
        let scheduler = Scheduler::new().unwrap();
        let (tx, rx) = channel::bounded(1);

        let handle = scheduler.schedule(Duration::from_millis(10), move || {
            tx.send(()).unwrap();
        });

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(handle.has_fired());
        assert_eq!(handle.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let scheduler = Scheduler::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel::unbounded();

        for (delay, tag) in [(30u64, 3), (10, 1), (20, 2)] {
            let order = Arc::clone(&order);
            let tx = tx.clone();
            scheduler.schedule(Duration::from_millis(delay), move || {
                order.lock().push(tag);
                tx.send(()).unwrap();
            });
        }

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let scheduler = Scheduler::new().unwrap();
        let (tx, rx) = channel::unbounded();

        let tx_cancelled = tx.clone();
        let cancelled = scheduler.schedule(Duration::from_millis(10), move || {
            tx_cancelled.send("cancelled").unwrap();
        });
        cancelled.cancel();
        scheduler.schedule(Duration::from_millis(40), move || {
            tx.send("kept").unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "kept");
        assert!(rx.try_recv().is_err());
        assert!(!cancelled.has_fired());
        assert!(!cancelled.is_pending());
    }

    #[test]
    fn test_remaining() {
        let scheduler = Scheduler::new().unwrap();
        let handle = scheduler.schedule(Duration::from_secs(60), || {});

        let remaining = handle.remaining();
        assert!(remaining > Duration::from_secs(59));
        assert!(remaining <= Duration::from_secs(60));

        handle.cancel();
        assert_eq!(handle.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_timer_can_schedule_from_callback() {
        let scheduler = Scheduler::new().unwrap();
        let (tx, rx) = channel::bounded(1);

        let inner = scheduler.clone();
        scheduler.schedule(Duration::from_millis(5), move || {
            inner.schedule(Duration::from_millis(5), move || {
                tx.send(()).unwrap();
            });
        });

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
}
