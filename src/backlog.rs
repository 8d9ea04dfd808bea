//! Bounded queue between harvesters and the writer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};

use crate::store::LogRecord;

struct BacklogState {
    queue: VecDeque<LogRecord>,
    high_water: usize,
}

/// FIFO buffer of accepted records awaiting persistence. Capacity is fixed
/// at construction; `add` suspends when the queue is full, so a slow writer
/// backpressures every harvester instead of dropping records. Shared as an
/// `Arc` injected into harvesters and the writer.
pub struct Backlog {
    capacity: usize,
    slots: Semaphore,
    nonempty: Notify,
    state: Mutex<BacklogState>,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Semaphore::new(capacity),
            nonempty: Notify::new(),
            state: Mutex::new(BacklogState { queue: VecDeque::new(), high_water: 0 }),
        }
    }

    /// Enqueue a record, suspending until a slot frees up when full.
    pub async fn add(&self, record: LogRecord) {
        // The semaphore is never closed, so acquisition only waits.
        if let Ok(permit) = self.slots.acquire().await {
            permit.forget();
        }
        let mut state = self.locked();
        state.queue.push_back(record);
        let len = state.queue.len();
        if len > state.high_water {
            state.high_water = len;
        }
        drop(state);
        self.nonempty.notify_one();
    }

    /// Atomically remove up to `max` records in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<LogRecord> {
        let mut state = self.locked();
        let n = max.min(state.queue.len());
        let drained: Vec<LogRecord> = state.queue.drain(..n).collect();
        drop(state);
        if n > 0 {
            self.slots.add_permits(n);
        }
        drained
    }

    /// Wait until the backlog is non-empty or `idle` elapses.
    pub async fn wait_nonempty(&self, idle: Duration) {
        if !self.is_empty() {
            return;
        }
        let _ = tokio::time::timeout(idle, self.nonempty.notified()).await;
    }

    pub fn len(&self) -> usize {
        self.locked().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest queue length observed since startup.
    pub fn high_water(&self) -> usize {
        self.locked().high_water
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, BacklogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
