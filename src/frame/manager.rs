//! Session-scoped frame arena

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::entity::EntitySpec;
use super::frame::{Frame, FrameKind, FrameRef};
use crate::buffer::BufferManager;
use crate::error::{Error, Result};

struct Slot {
    frame: FrameRef,
    owners: u32,
}

/// Creates frames, tracks their owners and destroys them once the last
/// owner lets go of a complete frame. Output buffers go back to their pools
/// as soon as no pending stage needs them.
pub struct FrameManager {
    buffers: Arc<BufferManager>,
    slots: Mutex<BTreeMap<u64, Slot>>,
    next_count: AtomicU64,
}

impl FrameManager {
    pub fn new(buffers: Arc<BufferManager>) -> Self {
        Self {
            buffers,
            slots: Mutex::new(BTreeMap::new()),
            next_count: AtomicU64::new(0),
        }
    }

    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    /// New frame owned by the pipeline. Counts start at 1 and never repeat
    /// within a session.
    pub fn create_frame(&self, kind: FrameKind, specs: &[EntitySpec]) -> FrameRef {
        let count = self.next_count.fetch_add(1, Ordering::AcqRel) + 1;
        let frame = Arc::new(Frame::new(count, kind, specs));
        self.slots.lock().insert(
            count,
            Slot {
                frame: frame.clone(),
                owners: 1,
            },
        );

        metrics::counter!("camstage_frames_created").increment(1);
        trace!(frame = count, ?kind, "Frame created");
        frame
    }

    /// Count of the most recently created frame, 0 before the first one
    pub fn last_frame_count(&self) -> u64 {
        self.next_count.load(Ordering::Acquire)
    }

    pub fn get(&self, count: u64) -> Option<FrameRef> {
        self.slots.lock().get(&count).map(|s| s.frame.clone())
    }

    pub fn retain(&self, frame: &Frame) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(&frame.count())
            .filter(|s| s.owners > 0)
            .ok_or(Error::UnknownFrame(frame.count()))?;
        slot.owners += 1;
        Ok(())
    }

    /// Drop one owner. Returns true if the frame was destroyed.
    pub fn release(&self, frame: &Frame) -> Result<bool> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(&frame.count())
            .filter(|s| s.owners > 0)
            .ok_or(Error::UnknownFrame(frame.count()))?;
        slot.owners -= 1;
        Ok(self.try_destroy(&mut slots, frame.count()))
    }

    fn try_destroy(&self, slots: &mut BTreeMap<u64, Slot>, count: u64) -> bool {
        let destroyable = slots.get(&count).is_some_and(|s| {
            s.owners == 0 && s.frame.is_complete() && !s.frame.is_enqueued()
        });
        if !destroyable {
            return false;
        }

        if let Some(slot) = slots.remove(&count) {
            let leftover = slot.frame.take_all_buffers();
            for handle in &leftover {
                self.buffers.release(handle);
            }
            metrics::counter!("camstage_frames_completed").increment(1);
            metrics::histogram!("camstage_frame_lifetime_us")
                .record(slot.frame.created_at().elapsed().as_micros() as f64);
            trace!(frame = count, leftover = leftover.len(), "Frame destroyed");
        }
        true
    }

    /// Return every output buffer the frame no longer needs.
    pub fn return_buffers(&self, frame: &Frame) -> usize {
        let handles = frame.take_releasable_buffers();
        for handle in &handles {
            self.buffers.release(handle);
        }
        handles.len()
    }

    /// Return spent buffers and, once the frame is complete, drop the
    /// pipeline's own reference (exactly once).
    pub fn finish_if_complete(&self, frame: &Frame) -> Result<bool> {
        self.return_buffers(frame);
        if frame.is_complete() && frame.mark_finished() {
            self.release(frame)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Skip all remaining work on `frame` and finish it.
    pub fn abort(&self, frame: &Frame) -> Result<bool> {
        let skipped = frame.abort();
        if !skipped.is_empty() {
            debug!(frame = frame.count(), ?skipped, "Frame aborted");
        }
        self.finish_if_complete(frame)
    }

    /// Forcibly destroy every frame and return all buffers. Used when a
    /// session stops; anything found here leaked past the normal paths.
    pub fn reclaim_all(&self) -> usize {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock();
            std::mem::take(&mut *slots).into_values().collect()
        };

        for slot in &drained {
            slot.frame.abort();
            for handle in slot.frame.take_all_buffers() {
                self.buffers.release(&handle);
            }
        }
        if !drained.is_empty() {
            warn!(frames = drained.len(), "Reclaimed outstanding frames");
        }
        drained.len()
    }

    /// Frames currently alive
    pub fn outstanding(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn contains(&self, count: u64) -> bool {
        self.slots.lock().contains_key(&count)
    }

    /// One line per live frame, oldest first
    pub fn dump(&self) -> Vec<String> {
        self.slots
            .lock()
            .values()
            .map(|s| format!("{} owners={}", s.frame, s.owners))
            .collect()
    }
}
