//! Bounded ring of frames held for still capture

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use crate::frame::FrameRef;

/// Fixed-depth FIFO of held frames. Eviction is explicit so the caller can
/// return the evicted frame's buffers before the new one goes in.
pub struct HoldRing {
    ring: HeapRb<FrameRef>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_held: AtomicUsize,
    frames_taken: AtomicUsize,
    frames_evicted: AtomicUsize,
}

impl HoldRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Push a frame, handing it back if the ring is full.
    pub fn push(&mut self, frame: FrameRef) -> Result<(), FrameRef> {
        self.ring.try_push(frame)?;
        self.stats.frames_held.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove the oldest frame to make room
    pub fn evict_oldest(&mut self) -> Option<FrameRef> {
        let frame = self.ring.try_pop()?;
        self.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Take the oldest frame for selection
    pub fn take_oldest(&mut self) -> Option<FrameRef> {
        let frame = self.ring.try_pop()?;
        self.stats.frames_taken.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn drain(&mut self) -> Vec<FrameRef> {
        self.ring.pop_iter().collect()
    }

    /// Frame counts held, oldest first
    pub fn counts(&self) -> Vec<u64> {
        self.ring.iter().map(|f| f.count()).collect()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    /// (held, taken, evicted)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.frames_held.load(Ordering::Relaxed),
            self.stats.frames_taken.load(Ordering::Relaxed),
            self.stats.frames_evicted.load(Ordering::Relaxed),
        )
    }
}
