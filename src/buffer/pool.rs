//! Fixed-capacity pool of hardware-memory buffers for one stage

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::stage::StageId;
use crate::utils::align_to_page;

/// Plane sizes of one buffer, in bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneLayout {
    pub planes: Vec<usize>,
    /// Whether hardware writes per-frame metadata alongside the planes
    pub meta_plane: bool,
}

impl PlaneLayout {
    pub fn new(planes: Vec<usize>, meta_plane: bool) -> Self {
        Self { planes, meta_plane }
    }

    pub fn total_size(&self) -> usize {
        self.planes.iter().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    /// `alloc()` maps every buffer up front
    #[default]
    AtOnce,
    /// `alloc()` maps `min_count`, `get_buffer()` grows up to `max_count`
    OnDemand,
}

#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub layout: PlaneLayout,
    pub min_count: usize,
    pub max_count: usize,
    pub mode: AllocationMode,
}

/// Where a buffer currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPosition {
    #[default]
    None,
    InDriver,
    InHal,
    InService,
}

/// Reference to a checked-out buffer. Copyable; ownership is tracked by the
/// frame entity that holds it, not by the handle itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub pool: StageId,
    pub index: usize,
    generation: u32,
}

/// Per-frame metadata hardware embeds in a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMeta {
    pub frame_count: u64,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pool: StageId,
    pub allocated: usize,
    pub available: usize,
    pub checked_out: usize,
    pub misses: u32,
}

struct Slot {
    planes: Vec<MmapMut>,
    checked_out: bool,
    position: BufferPosition,
    meta: Option<BufferMeta>,
}

#[derive(Default)]
struct PoolState {
    info: Option<PoolInfo>,
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    generation: u32,
    allocated: bool,
    misses: u32,
}

impl PoolState {
    fn checked_out(&self) -> usize {
        self.slots.iter().filter(|s| s.checked_out).count()
    }

    fn can_grow(&self) -> bool {
        match &self.info {
            Some(info) => {
                self.allocated
                    && info.mode == AllocationMode::OnDemand
                    && self.slots.len() < info.max_count
            }
            None => false,
        }
    }
}

/// Buffer pool for one pipeline stage.
///
/// `checked_out + available == allocated` holds whenever the lock is released.
pub struct BufferPool {
    id: StageId,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl BufferPool {
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            state: Mutex::new(PoolState::default()),
            returned: Condvar::new(),
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn set_info(&self, info: PoolInfo) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidPoolInfo {
            pool: self.id,
            reason: reason.to_string(),
        };

        if info.layout.planes.is_empty() {
            return Err(invalid("no planes"));
        }
        if info.layout.planes.iter().any(|p| *p == 0) {
            return Err(invalid("zero-sized plane"));
        }
        if info.max_count == 0 || info.min_count > info.max_count {
            return Err(invalid("min_count must be <= max_count and max_count > 0"));
        }

        let mut state = self.state.lock();
        if state.allocated {
            return Err(invalid("pool already allocated"));
        }
        state.info = Some(info);
        Ok(())
    }

    /// Map buffer memory according to the allocation mode.
    pub fn alloc(&self) -> Result<()> {
        let mut state = self.state.lock();
        let info = state.info.clone().ok_or(Error::PoolNotConfigured(self.id))?;
        if state.allocated {
            return Ok(());
        }

        let count = match info.mode {
            AllocationMode::AtOnce => info.max_count,
            AllocationMode::OnDemand => info.min_count,
        };

        let mut slots = Vec::with_capacity(info.max_count);
        for index in 0..count {
            slots.push(self.map_slot(index, &info.layout)?);
        }

        state.free = (0..slots.len()).collect();
        state.slots = slots;
        state.allocated = true;
        state.misses = 0;

        info!(
            pool = %self.id,
            count,
            max = info.max_count,
            mode = ?info.mode,
            bytes = info.layout.total_size(),
            "Buffer pool allocated"
        );
        Ok(())
    }

    fn map_slot(&self, index: usize, layout: &PlaneLayout) -> Result<Slot> {
        let planes = layout
            .planes
            .iter()
            .map(|size| {
                let size = align_to_page(*size);
                MmapMut::map_anon(size).map_err(|source| Error::Allocation {
                    pool: self.id,
                    index,
                    size,
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Slot {
            planes,
            checked_out: false,
            position: BufferPosition::None,
            meta: None,
        })
    }

    /// Hand out a free buffer. Never blocks: an empty pool is reported as
    /// [`Error::BufferUnavailable`] and callers apply their own retry policy.
    pub fn get_buffer(&self, position: BufferPosition) -> Result<(usize, BufferHandle)> {
        let mut state = self.state.lock();
        if !state.allocated {
            return Err(Error::PoolNotConfigured(self.id));
        }

        let index = match state.free.pop_front() {
            Some(index) => index,
            None if state.can_grow() => {
                let layout = match &state.info {
                    Some(info) => info.layout.clone(),
                    None => return Err(Error::PoolNotConfigured(self.id)),
                };
                let index = state.slots.len();
                let slot = self.map_slot(index, &layout)?;
                state.slots.push(slot);
                debug!(pool = %self.id, index, "Buffer pool grew");
                index
            }
            None => {
                state.misses = state.misses.saturating_add(1);
                return Err(Error::BufferUnavailable { pool: self.id });
            }
        };

        let generation = state.generation;
        state.misses = 0;
        let slot = &mut state.slots[index];
        slot.checked_out = true;
        slot.position = position;
        slot.meta = None;

        Ok((
            index,
            BufferHandle {
                pool: self.id,
                index,
                generation,
            },
        ))
    }

    /// Block up to `timeout` until a buffer could be handed out.
    pub fn wait_for_buffer(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.free.is_empty() || state.can_grow() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let _ = self.returned.wait_for(&mut state, timeout);
        !state.free.is_empty() || state.can_grow()
    }

    /// Return a buffer by index. Returning a buffer that is not checked out is
    /// logged and ignored so racing cleanup paths cannot corrupt the free list.
    pub fn put_buffer(&self, index: usize) -> bool {
        let returned = self.put_locked(&mut self.state.lock(), index);
        if returned {
            self.returned.notify_one();
        }
        returned
    }

    /// Return a buffer through its handle; handles from before the last
    /// `reset_buffers` are stale and ignored.
    pub fn put_handle(&self, handle: &BufferHandle) -> bool {
        if handle.pool != self.id {
            warn!(pool = %self.id, other = %handle.pool, "Buffer handle from another pool");
            return false;
        }
        let returned = {
            let mut state = self.state.lock();
            if handle.generation != state.generation {
                debug!(pool = %self.id, index = handle.index, "Ignoring stale buffer handle");
                return false;
            }
            self.put_locked(&mut state, handle.index)
        };
        if returned {
            self.returned.notify_one();
        }
        returned
    }

    fn put_locked(&self, state: &mut PoolState, index: usize) -> bool {
        let Some(slot) = state.slots.get_mut(index) else {
            warn!(pool = %self.id, index, "put_buffer on unknown index");
            return false;
        };
        if !slot.checked_out {
            warn!(pool = %self.id, index, "put_buffer on buffer that is not checked out");
            return false;
        }

        slot.checked_out = false;
        slot.position = BufferPosition::None;
        state.free.push_back(index);
        true
    }

    /// Invalidate every outstanding checkout without unmapping memory.
    pub fn reset_buffers(&self) {
        let mut state = self.state.lock();
        let outstanding = state.checked_out();
        state.generation = state.generation.wrapping_add(1);
        for slot in state.slots.iter_mut() {
            slot.checked_out = false;
            slot.position = BufferPosition::None;
            slot.meta = None;
        }
        state.free = (0..state.slots.len()).collect();
        state.misses = 0;
        drop(state);

        if outstanding > 0 {
            debug!(pool = %self.id, outstanding, "Reset invalidated outstanding buffers");
        }
        self.returned.notify_all();
    }

    /// Unmap all memory. The pool must be allocated again before use.
    pub fn deinit(&self) {
        let mut state = self.state.lock();
        let outstanding = state.checked_out();
        if outstanding > 0 {
            warn!(pool = %self.id, outstanding, "Freeing pool with buffers still checked out");
        }
        state.slots.clear();
        state.free.clear();
        state.allocated = false;
        state.generation = state.generation.wrapping_add(1);
        debug!(pool = %self.id, "Buffer pool freed");
    }

    pub fn set_position(&self, index: usize, position: BufferPosition) {
        if let Some(slot) = self.state.lock().slots.get_mut(index) {
            if slot.checked_out {
                slot.position = position;
            }
        }
    }

    pub fn position(&self, index: usize) -> Option<BufferPosition> {
        self.state.lock().slots.get(index).map(|s| s.position)
    }

    pub fn write_meta(&self, index: usize, meta: BufferMeta) {
        let mut state = self.state.lock();
        let has_meta = state.info.as_ref().is_some_and(|i| i.layout.meta_plane);
        if let Some(slot) = state.slots.get_mut(index) {
            if has_meta {
                slot.meta = Some(meta);
            }
        }
    }

    pub fn meta(&self, index: usize) -> Option<BufferMeta> {
        self.state.lock().slots.get(index).and_then(|s| s.meta)
    }

    /// Run `f` over the mapped planes of a buffer.
    pub fn with_planes_mut<R>(&self, index: usize, f: impl FnOnce(&mut [MmapMut]) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state.slots.get_mut(index).map(|slot| f(&mut slot.planes))
    }

    /// Copy the payload of a buffer (unpadded plane sizes, concatenated).
    pub fn copy_out(&self, index: usize) -> Option<Bytes> {
        let state = self.state.lock();
        let info = state.info.as_ref()?;
        let slot = state.slots.get(index)?;

        let mut out = BytesMut::with_capacity(info.layout.total_size());
        for (plane, size) in slot.planes.iter().zip(&info.layout.planes) {
            out.extend_from_slice(&plane[..*size]);
        }
        Some(out.freeze())
    }

    pub fn num_available(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn num_checked_out(&self) -> usize {
        self.state.lock().checked_out()
    }

    pub fn allocated_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_allocated(&self) -> bool {
        self.state.lock().allocated
    }

    pub fn can_hand_out(&self) -> bool {
        let state = self.state.lock();
        !state.free.is_empty() || state.can_grow()
    }

    pub fn misses(&self) -> u32 {
        self.state.lock().misses
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            pool: self.id,
            allocated: state.slots.len(),
            available: state.free.len(),
            checked_out: state.checked_out(),
            misses: state.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize, mode: AllocationMode) -> BufferPool {
        let pool = BufferPool::new(StageId::Isp);
        pool.set_info(PoolInfo {
            layout: PlaneLayout::new(vec![128, 64], true),
            min_count: 1,
            max_count: count,
            mode,
        })
        .unwrap();
        pool.alloc().unwrap();
        pool
    }

    fn assert_accounting(pool: &BufferPool) {
        let stats = pool.stats();
        assert_eq!(stats.checked_out + stats.available, stats.allocated);
    }

    #[test]
    fn test_get_and_put() {
        let pool = pool(2, AllocationMode::AtOnce);
        assert_eq!(pool.num_available(), 2);

        let (a, _) = pool.get_buffer(BufferPosition::InDriver).unwrap();
        let (b, _) = pool.get_buffer(BufferPosition::InHal).unwrap();
        assert_ne!(a, b);
        assert_accounting(&pool);
        assert!(matches!(
            pool.get_buffer(BufferPosition::InDriver),
            Err(Error::BufferUnavailable { pool: StageId::Isp })
        ));
        assert_eq!(pool.misses(), 1);

        assert!(pool.put_buffer(a));
        assert_accounting(&pool);
        assert_eq!(pool.num_available(), 1);
        assert_eq!(pool.misses(), 1);
        pool.get_buffer(BufferPosition::InDriver).unwrap();
        assert_eq!(pool.misses(), 0);
    }

    #[test]
    fn test_duplicate_put_is_ignored() {
        let pool = pool(2, AllocationMode::AtOnce);
        let (index, _) = pool.get_buffer(BufferPosition::InDriver).unwrap();
        assert!(pool.put_buffer(index));
        assert!(!pool.put_buffer(index));
        assert!(!pool.put_buffer(42));
        assert_eq!(pool.num_available(), 2);
        assert_accounting(&pool);
    }

    #[test]
    fn test_on_demand_grows_to_max() {
        let pool = pool(3, AllocationMode::OnDemand);
        assert_eq!(pool.allocated_count(), 1);

        for _ in 0..3 {
            pool.get_buffer(BufferPosition::InDriver).unwrap();
            assert_accounting(&pool);
        }
        assert_eq!(pool.allocated_count(), 3);
        assert!(pool.get_buffer(BufferPosition::InDriver).is_err());
    }

    #[test]
    fn test_reset_invalidates_handles() {
        let pool = pool(2, AllocationMode::AtOnce);
        let (_, stale) = pool.get_buffer(BufferPosition::InDriver).unwrap();
        pool.reset_buffers();
        assert_eq!(pool.num_available(), 2);

        let (_, fresh) = pool.get_buffer(BufferPosition::InDriver).unwrap();
        assert!(!pool.put_handle(&stale));
        assert_eq!(pool.num_checked_out(), 1);
        assert!(pool.put_handle(&fresh));
        assert_accounting(&pool);
    }

    #[test]
    fn test_stale_handle_cannot_free_a_reissued_buffer() {
        let pool = pool(1, AllocationMode::AtOnce);
        let (index, stale) = pool.get_buffer(BufferPosition::InDriver).unwrap();
        pool.reset_buffers();

        let (reissued, fresh) = pool.get_buffer(BufferPosition::InHal).unwrap();
        assert_eq!(reissued, index);
        assert!(!pool.put_handle(&stale));
        assert_eq!(pool.num_checked_out(), 1);
        assert_eq!(pool.num_available(), 0);

        assert!(pool.put_handle(&fresh));
        assert!(!pool.put_handle(&fresh));
        assert_eq!(pool.num_available(), 1);
        assert_accounting(&pool);
    }

    #[test]
    fn test_invalid_info_rejected() {
        let pool = BufferPool::new(StageId::Sensor);
        let err = pool
            .set_info(PoolInfo {
                layout: PlaneLayout::new(vec![16], false),
                min_count: 4,
                max_count: 2,
                mode: AllocationMode::AtOnce,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPoolInfo { .. }));
        assert!(matches!(pool.alloc(), Err(Error::PoolNotConfigured(_))));
    }

    #[test]
    fn test_wait_for_buffer_wakes_on_put() {
        let pool = std::sync::Arc::new(pool(1, AllocationMode::AtOnce));
        let (index, _) = pool.get_buffer(BufferPosition::InDriver).unwrap();
        assert!(!pool.wait_for_buffer(Duration::ZERO));

        let returner = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                pool.put_buffer(index);
            })
        };
        assert!(pool.wait_for_buffer(Duration::from_secs(2)));
        returner.join().unwrap();
    }

    #[test]
    fn test_position_follows_checkout() {
        let pool = pool(1, AllocationMode::AtOnce);
        let (index, _) = pool.get_buffer(BufferPosition::InDriver).unwrap();
        assert_eq!(pool.position(index), Some(BufferPosition::InDriver));

        pool.set_position(index, BufferPosition::InHal);
        assert_eq!(pool.position(index), Some(BufferPosition::InHal));

        pool.put_buffer(index);
        pool.set_position(index, BufferPosition::InService);
        assert_eq!(pool.position(index), Some(BufferPosition::None));
    }

    #[test]
    fn test_meta_and_copy_out() {
        let pool = pool(1, AllocationMode::AtOnce);
        let (index, _) = pool.get_buffer(BufferPosition::InDriver).unwrap();
        pool.write_meta(
            index,
            BufferMeta {
                frame_count: 7,
                timestamp_ns: 100,
            },
        );
        pool.with_planes_mut(index, |planes| planes[0][0] = 0xAB);

        assert_eq!(pool.meta(index).map(|m| m.frame_count), Some(7));
        let bytes = pool.copy_out(index).unwrap();
        assert_eq!(bytes.len(), 192);
        assert_eq!(bytes[0], 0xAB);
    }

    #[test]
    fn test_deinit_frees_memory() {
        let pool = pool(2, AllocationMode::AtOnce);
        pool.deinit();
        assert_eq!(pool.allocated_count(), 0);
        assert!(!pool.is_allocated());
        assert!(pool.get_buffer(BufferPosition::InDriver).is_err());
    }
}
