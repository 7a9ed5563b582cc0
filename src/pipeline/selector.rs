//! Capture frame selection over a bounded history of held frames

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use super::ringbuf::HoldRing;
use crate::error::Result;
use crate::frame::{FrameManager, FrameRef};
use crate::stage::StageId;

/// Which buffer of which stage a hold list pins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HoldKey {
    pub stage: StageId,
    pub is_src: bool,
}

/// Keeps the last few completed frames so a capture request can pick the
/// one matching the shutter instead of whatever arrives next.
///
/// A held frame owns one reference in the frame manager. Eviction and
/// clearing skip the frame's pending capture work, return the pinned buffer
/// and drop that reference. Selection hands the reference to the caller,
/// who must release it.
pub struct CaptureSelector {
    frames: Arc<FrameManager>,
    lists: Mutex<HashMap<HoldKey, HoldRing>>,
    arrived: Condvar,
    hold_count: AtomicUsize,
    wait_time_ms: AtomicU64,
    is_first_frame: AtomicBool,
    /// Shutter frame count, 0 when unset
    trigger: AtomicU64,
    /// Embedded count of the previous frame of the current burst, 0 when none
    last_selected: AtomicU64,
    /// Frames still to select for the current burst
    remaining: AtomicU32,
    canceled: AtomicBool,
    evicted: AtomicU64,
}

impl CaptureSelector {
    pub fn new(frames: Arc<FrameManager>, hold_count: usize, wait_time: Duration) -> Self {
        Self {
            frames,
            lists: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
            hold_count: AtomicUsize::new(hold_count.max(1)),
            wait_time_ms: AtomicU64::new(wait_time.as_millis() as u64),
            is_first_frame: AtomicBool::new(true),
            trigger: AtomicU64::new(0),
            last_selected: AtomicU64::new(0),
            remaining: AtomicU32::new(0),
            canceled: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
        }
    }

    /// Hold `frame` for capture. When the list is at its bound the oldest
    /// frame is evicted and its buffer returned before `frame` goes in.
    #[instrument(level = "trace", skip(self, frame), fields(frame = frame.count()))]
    pub fn manage_frame_hold_list(&self, frame: FrameRef, stage: StageId, is_src: bool) -> Result<()> {
        self.frames.retain(&frame)?;

        let key = HoldKey { stage, is_src };
        let bound = self.hold_count.load(Ordering::Acquire);
        let mut lists = self.lists.lock();
        let ring = lists.entry(key).or_insert_with(|| HoldRing::new(bound));

        while ring.len() >= bound {
            match ring.evict_oldest() {
                Some(old) => {
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("camstage_hold_evicted").increment(1);
                    self.discard(&old, key);
                }
                None => break,
            }
        }
        if let Err(frame) = ring.push(frame) {
            warn!(frame = frame.count(), "Hold list full after eviction");
            self.discard(&frame, key);
        }
        drop(lists);

        self.arrived.notify_all();
        Ok(())
    }

    /// Drop a held frame: skip its pending capture work, return the pinned
    /// buffer and release the hold's reference.
    fn discard(&self, frame: &FrameRef, key: HoldKey) {
        if let Some(producer) = frame.held_producer(key.stage, key.is_src) {
            frame.skip_consumers(producer);
        }
        if let Err(e) = self.frames.finish_if_complete(frame) {
            warn!(frame = frame.count(), error = %e, "Failed to finish discarded frame");
        }
        if let Err(e) = self.frames.release(frame) {
            warn!(frame = frame.count(), error = %e, "Failed to release held frame");
        }
    }

    /// Frame count embedded by hardware in the pinned buffer, falling back to
    /// the frame's own count.
    fn embedded_count(&self, frame: &FrameRef, key: HoldKey) -> u64 {
        frame
            .held_producer(key.stage, key.is_src)
            .and_then(|producer| frame.dst_buffer(producer))
            .and_then(|h| {
                let pool = self.frames.buffers().pool(h.pool).ok()?;
                pool.meta(h.index)
            })
            .map(|meta| meta.frame_count)
            .unwrap_or_else(|| frame.count())
    }

    /// Select a frame for capture. While `is_first_frame` is set and a
    /// shutter trigger is armed, the earliest frame at or after the trigger is
    /// taken; later frames of a burst follow the previous pick in order.
    /// Otherwise the newest held frame is taken. The returned frame carries
    /// one reference the caller must release.
    #[instrument(level = "debug", skip(self))]
    pub fn select_frames(
        &self,
        count: u32,
        stage: StageId,
        is_src: bool,
        retry_budget: u32,
    ) -> Option<FrameRef> {
        let key = HoldKey { stage, is_src };
        if self.remaining.load(Ordering::Acquire) == 0 {
            self.remaining.store(count.max(1), Ordering::Release);
        }

        let first = self.is_first_frame.load(Ordering::Acquire);
        let trigger = self.trigger.load(Ordering::Acquire);
        let previous = self.last_selected.load(Ordering::Acquire);
        let selected = if first && trigger > 0 {
            self.select_after(trigger, key, retry_budget)
        } else if !first && previous > 0 {
            self.select_after(previous + 1, key, retry_budget)
        } else {
            self.select_newest(key, retry_budget)
        };

        match &selected {
            Some(frame) => {
                let left = self.remaining.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                if left == 0 {
                    self.reset_burst();
                } else {
                    self.last_selected
                        .store(self.embedded_count(frame, key), Ordering::Release);
                    self.is_first_frame.store(false, Ordering::Release);
                }
                debug!(frame = frame.count(), first, left, "Frame selected for capture");
            }
            None => {
                self.remaining.store(0, Ordering::Release);
                self.reset_burst();
            }
        }
        selected
    }

    fn reset_burst(&self) {
        self.trigger.store(0, Ordering::Release);
        self.last_selected.store(0, Ordering::Release);
        self.is_first_frame.store(true, Ordering::Release);
    }

    /// Select the earliest frame captured at or after `trigger`, falling back
    /// to the newest frame if none arrives within the retry budget.
    pub fn select_capture_frame(
        &self,
        trigger: u64,
        stage: StageId,
        is_src: bool,
        retry_budget: u32,
    ) -> Option<FrameRef> {
        let key = HoldKey { stage, is_src };
        self.select_after(trigger, key, retry_budget)
            .or_else(|| self.select_newest(key, 0))
    }

    fn select_after(&self, trigger: u64, key: HoldKey, retry_budget: u32) -> Option<FrameRef> {
        let mut lists = self.lists.lock();
        let mut attempts = 0;
        loop {
            if self.canceled.load(Ordering::Acquire) {
                return None;
            }
            if let Some(ring) = lists.get_mut(&key) {
                while let Some(frame) = ring.take_oldest() {
                    if self.embedded_count(&frame, key) >= trigger {
                        return Some(frame);
                    }
                    // Captured before the shutter
                    self.discard(&frame, key);
                }
            }
            if !self.wait(&mut lists, &mut attempts, retry_budget) {
                debug!(trigger, "No frame after trigger within retry budget");
                return None;
            }
        }
    }

    fn select_newest(&self, key: HoldKey, retry_budget: u32) -> Option<FrameRef> {
        let mut lists = self.lists.lock();
        let mut attempts = 0;
        loop {
            if self.canceled.load(Ordering::Acquire) {
                return None;
            }
            if let Some(ring) = lists.get_mut(&key) {
                let mut newest = None;
                while let Some(frame) = ring.take_oldest() {
                    if let Some(older) = newest.replace(frame) {
                        self.discard(&older, key);
                    }
                }
                if newest.is_some() {
                    return newest;
                }
            }
            if !self.wait(&mut lists, &mut attempts, retry_budget) {
                return None;
            }
        }
    }

    fn wait(
        &self,
        lists: &mut MutexGuard<'_, HashMap<HoldKey, HoldRing>>,
        attempts: &mut u32,
        retry_budget: u32,
    ) -> bool {
        if *attempts >= retry_budget {
            return false;
        }
        *attempts += 1;
        let wait = Duration::from_millis(self.wait_time_ms.load(Ordering::Acquire));
        let _ = self.arrived.wait_for(lists, wait);
        true
    }

    pub fn set_trigger(&self, frame_count: u64) {
        self.trigger.store(frame_count, Ordering::Release);
    }

    pub fn trigger(&self) -> u64 {
        self.trigger.load(Ordering::Acquire)
    }

    pub fn set_is_first_frame(&self, first: bool) {
        self.is_first_frame.store(first, Ordering::Release);
    }

    pub fn is_first_frame(&self) -> bool {
        self.is_first_frame.load(Ordering::Acquire)
    }

    /// Change the hold bound; lists above it drop their oldest frames.
    pub fn set_frame_hold_count(&self, count: usize) {
        let count = count.max(1);
        self.hold_count.store(count, Ordering::Release);

        let mut lists = self.lists.lock();
        for (key, ring) in lists.iter_mut() {
            let mut held = ring.drain();
            let excess = held.len().saturating_sub(count);
            for old in held.drain(..excess) {
                self.discard(&old, *key);
            }
            let mut resized = HoldRing::new(count);
            for frame in held {
                if let Err(frame) = resized.push(frame) {
                    self.discard(&frame, *key);
                }
            }
            *ring = resized;
        }
    }

    pub fn frame_hold_count(&self) -> usize {
        self.hold_count.load(Ordering::Acquire)
    }

    pub fn set_wait_time(&self, wait: Duration) {
        self.wait_time_ms
            .store(wait.as_millis() as u64, Ordering::Release);
    }

    /// Total frames currently held across all lists
    pub fn size_of_hold_frames(&self) -> usize {
        self.lists.lock().values().map(HoldRing::len).sum()
    }

    pub fn held_counts(&self, stage: StageId, is_src: bool) -> Vec<u64> {
        self.lists
            .lock()
            .get(&HoldKey { stage, is_src })
            .map(HoldRing::counts)
            .unwrap_or_default()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Abort an in-progress selection and forget burst state.
    pub fn cancel_picture(&self) {
        self.canceled.store(true, Ordering::Release);
        self.remaining.store(0, Ordering::Release);
        self.reset_burst();
        self.arrived.notify_all();
        info!("Capture selection canceled");
    }

    /// Re-arm after a cancel, before the next capture request.
    pub fn reset_cancel(&self) {
        self.canceled.store(false, Ordering::Release);
    }

    /// Discard every held frame. Returns how many were dropped.
    pub fn clear_list(&self) -> usize {
        self.clear_where(|_| true)
    }

    /// Discard the frames held for one stage side only.
    pub fn clear_hold(&self, stage: StageId, is_src: bool) -> usize {
        let target = HoldKey { stage, is_src };
        self.clear_where(|key| key == target)
    }

    fn clear_where(&self, filter: impl Fn(HoldKey) -> bool) -> usize {
        let mut lists = self.lists.lock();
        let mut cleared = 0;
        for (key, ring) in lists.iter_mut().filter(|(key, _)| filter(**key)) {
            for frame in ring.drain() {
                self.discard(&frame, *key);
                cleared += 1;
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{
        AcquirePolicy, AllocationMode, BufferManager, BufferMeta, BufferPool, PlaneLayout,
        PoolInfo,
    };
    use crate::frame::{EntitySpec, EntityState, FrameKind};

    const HOLD: StageId = StageId::Stats;

    fn frames(bayers: usize) -> Arc<FrameManager> {
        let pools = [StageId::Sensor].map(|stage| {
            let pool = BufferPool::new(stage);
            pool.set_info(PoolInfo {
                layout: PlaneLayout::new(vec![32], true),
                min_count: bayers,
                max_count: bayers,
                mode: AllocationMode::AtOnce,
            })
            .unwrap();
            pool.alloc().unwrap();
            pool
        });
        Arc::new(FrameManager::new(Arc::new(BufferManager::new(
            pools,
            AcquirePolicy::default(),
        ))))
    }

    fn specs() -> Vec<EntitySpec> {
        vec![
            EntitySpec {
                stage: StageId::Sensor,
                parent: None,
                consumes_parent: false,
                needs_dst: true,
            },
            EntitySpec {
                stage: StageId::Stats,
                parent: Some(StageId::Sensor),
                consumes_parent: true,
                needs_dst: false,
            },
            EntitySpec {
                stage: StageId::ReprocessIsp,
                parent: Some(StageId::Sensor),
                consumes_parent: true,
                needs_dst: false,
            },
        ]
    }

    /// A frame whose sensor and stats work is done, with capture pending
    fn completed(frames: &FrameManager) -> FrameRef {
        let frame = frames.create_frame(FrameKind::Preview, &specs());
        frames
            .buffers()
            .setup_entity(StageId::Sensor, &frame, None, None)
            .unwrap();
        let bayer = frame.dst_buffer(StageId::Sensor).unwrap();
        frames.buffers().pool(StageId::Sensor).unwrap().write_meta(
            bayer.index,
            BufferMeta {
                frame_count: frame.count(),
                timestamp_ns: 0,
            },
        );
        frame.signal_buffers(StageId::Sensor, true).unwrap();
        frame.set_entity_state(StageId::Sensor, EntityState::Complete).unwrap();
        frame.setup_entity(StageId::Stats, None, None).unwrap();
        frame.signal_buffers(StageId::Stats, true).unwrap();
        frame.set_entity_state(StageId::Stats, EntityState::Complete).unwrap();
        frame
    }

    fn selector(frames: &Arc<FrameManager>, bound: usize) -> CaptureSelector {
        CaptureSelector::new(frames.clone(), bound, Duration::from_millis(5))
    }

    #[test]
    fn test_hold_list_is_bounded() {
        let frames = frames(5);
        let selector = selector(&frames, 3);
        for _ in 0..5 {
            let frame = completed(&frames);
            selector.manage_frame_hold_list(frame.clone(), HOLD, true).unwrap();
            frames.finish_if_complete(&frame).unwrap();
        }

        assert_eq!(selector.held_counts(HOLD, true), vec![3, 4, 5]);
        assert_eq!(selector.evicted(), 2);
        // Evicted frames gave their bayer back and were destroyed
        let sensor = frames.buffers().pool(StageId::Sensor).unwrap();
        assert_eq!(sensor.num_available(), 2);
        assert_eq!(frames.outstanding(), 3);
    }

    #[test]
    fn test_select_first_after_trigger() {
        let frames = frames(5);
        let selector = selector(&frames, 3);
        for _ in 0..5 {
            let frame = completed(&frames);
            selector.manage_frame_hold_list(frame, HOLD, true).unwrap();
        }

        selector.set_trigger(3);
        let picked = selector.select_frames(1, HOLD, true, 0).unwrap();
        assert_eq!(picked.count(), 3);
        assert_eq!(selector.held_counts(HOLD, true), vec![4, 5]);
        assert_eq!(
            picked.entity_state(StageId::ReprocessIsp).unwrap(),
            EntityState::Requested
        );
        frames.release(&picked).unwrap();
    }

    #[test]
    fn test_select_newest_without_trigger() {
        let frames = frames(3);
        let selector = selector(&frames, 3);
        for _ in 0..3 {
            selector
                .manage_frame_hold_list(completed(&frames), HOLD, true)
                .unwrap();
        }

        let picked = selector.select_frames(1, HOLD, true, 0).unwrap();
        assert_eq!(picked.count(), 3);
        assert_eq!(selector.size_of_hold_frames(), 0);
    }

    #[test]
    fn test_burst_is_contiguous() {
        let frames = frames(5);
        let selector = selector(&frames, 5);
        for _ in 0..5 {
            selector
                .manage_frame_hold_list(completed(&frames), HOLD, true)
                .unwrap();
        }

        selector.set_trigger(2);
        let counts: Vec<u64> = (0..3)
            .map(|_| selector.select_frames(3, HOLD, true, 0).unwrap().count())
            .collect();
        assert_eq!(counts, vec![2, 3, 4]);
        assert!(selector.is_first_frame());
        assert_eq!(selector.trigger(), 0);
    }

    #[test]
    fn test_trigger_ignored_outside_first_frame() {
        let frames = frames(5);
        let selector = selector(&frames, 5);
        for _ in 0..5 {
            selector
                .manage_frame_hold_list(completed(&frames), HOLD, true)
                .unwrap();
        }

        selector.set_trigger(2);
        selector.set_is_first_frame(false);
        let picked = selector.select_frames(1, HOLD, true, 0).unwrap();
        assert_eq!(picked.count(), 5);
        assert!(selector.is_first_frame());
        assert_eq!(selector.trigger(), 0);
        frames.release(&picked).unwrap();
    }

    #[test]
    fn test_empty_list_times_out() {
        let frames = frames(1);
        let selector = selector(&frames, 2);
        assert!(selector.select_frames(1, HOLD, true, 2).is_none());
    }

    #[test]
    fn test_cancel_and_clear() {
        let frames = frames(2);
        let selector = selector(&frames, 2);
        for _ in 0..2 {
            let frame = completed(&frames);
            selector.manage_frame_hold_list(frame.clone(), HOLD, true).unwrap();
            frames.finish_if_complete(&frame).unwrap();
        }

        selector.cancel_picture();
        assert!(selector.select_frames(1, HOLD, true, 0).is_none());
        assert_eq!(selector.clear_list(), 2);
        assert_eq!(frames.outstanding(), 0);
        assert_eq!(
            frames.buffers().pool(StageId::Sensor).unwrap().num_available(),
            2
        );
    }

    #[test]
    fn test_clear_hold_only_touches_its_side() {
        let frames = frames(2);
        let selector = selector(&frames, 2);
        for _ in 0..2 {
            let frame = completed(&frames);
            selector.manage_frame_hold_list(frame.clone(), HOLD, true).unwrap();
            frames.finish_if_complete(&frame).unwrap();
        }

        assert_eq!(selector.clear_hold(HOLD, false), 0);
        assert_eq!(selector.size_of_hold_frames(), 2);
        assert_eq!(selector.clear_hold(HOLD, true), 2);
        assert_eq!(frames.outstanding(), 0);
    }
}
