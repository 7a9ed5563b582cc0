//! Blocking FIFO between pipeline threads

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::trace;

use crate::frame::FrameRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PopError {
    #[error("timed out waiting for an item")]
    TimedOut,
    #[error("woken up without an item")]
    WokenUp,
}

/// Items that track whether they sit in a queue
pub trait Queued: Send {
    fn on_enqueue(&self) {}
    fn on_dequeue(&self) {}
}

impl Queued for FrameRef {
    fn on_enqueue(&self) {
        self.mark_enqueued();
    }

    fn on_dequeue(&self) {
        self.mark_dequeued();
    }
}

type ReleaseHook<T> = Box<dyn Fn(T) + Send + Sync>;

struct QueueState<T> {
    items: VecDeque<T>,
    wake_generation: u64,
    wait_time: Option<Duration>,
}

pub struct FrameQueue<T: Queued> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    capacity: Option<usize>,
    on_release: Option<ReleaseHook<T>>,
}

impl<T: Queued> FrameQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                wake_generation: 0,
                wait_time: None,
            }),
            ready: Condvar::new(),
            capacity: None,
            on_release: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    /// Called for every item drained by [`FrameQueue::release`].
    pub fn with_release_hook(mut self, hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue and wake one waiter. A bounded queue hands the item back when
    /// full.
    pub fn push_process_q(&self, item: T) -> std::result::Result<(), T> {
        let mut state = self.state.lock();
        if self.capacity.is_some_and(|cap| state.items.len() >= cap) {
            return Err(item);
        }
        item.on_enqueue();
        state.items.push_back(item);
        drop(state);

        self.ready.notify_one();
        Ok(())
    }

    /// Pop the oldest item, waiting up to `timeout` (forever with `None`).
    /// A [`FrameQueue::wake_up`] while waiting returns [`PopError::WokenUp`].
    pub fn wait_and_pop_process_q(
        &self,
        timeout: Option<Duration>,
    ) -> std::result::Result<T, PopError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let generation = state.wake_generation;

        loop {
            if let Some(item) = state.items.pop_front() {
                item.on_dequeue();
                return Ok(item);
            }
            if state.wake_generation != generation {
                return Err(PopError::WokenUp);
            }

            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        if let Some(item) = state.items.pop_front() {
                            item.on_dequeue();
                            return Ok(item);
                        }
                        return Err(PopError::TimedOut);
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Default timeout for [`FrameQueue::wait_and_pop`]; `None` waits forever.
    pub fn set_wait_time(&self, wait: Option<Duration>) {
        self.state.lock().wait_time = wait;
    }

    pub fn wait_time(&self) -> Option<Duration> {
        self.state.lock().wait_time
    }

    /// [`FrameQueue::wait_and_pop_process_q`] with the queue's own wait time
    pub fn wait_and_pop(&self) -> std::result::Result<T, PopError> {
        let wait = self.wait_time();
        self.wait_and_pop_process_q(wait)
    }

    pub fn pop_process_q(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front()?;
        item.on_dequeue();
        Some(item)
    }

    /// Interrupt every current waiter.
    pub fn wake_up(&self) {
        let mut state = self.state.lock();
        state.wake_generation = state.wake_generation.wrapping_add(1);
        drop(state);
        self.ready.notify_all();
    }

    /// Drain every item through the release hook. Returns how many were
    /// drained.
    pub fn release(&self) -> usize {
        let drained: Vec<T> = self.state.lock().items.drain(..).collect();
        let count = drained.len();
        for item in drained {
            item.on_dequeue();
            if let Some(hook) = &self.on_release {
                hook(item);
            }
        }
        if count > 0 {
            trace!(queue = self.name, count, "Queue released");
        }
        count
    }

    pub fn get_size_of_process_q(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.get_size_of_process_q() == 0
    }
}

impl<T: Queued> Drop for FrameQueue<T> {
    fn drop(&mut self) {
        self.release();
    }
}
