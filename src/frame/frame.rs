use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::entity::{BufferState, Entity, EntityPlan, EntitySpec, EntityState};
use crate::buffer::BufferHandle;
use crate::error::{Error, Result};
use crate::stage::{StageId, StageSet};

pub type FrameRef = Arc<Frame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Streaming frame, delivered to display/recording
    Preview,
    /// Pipeline-internal frame (priming, bayer dumps)
    Internal,
}

/// One unit of work flowing through the stage graph.
///
/// Entities are guarded by a single lock so parent checks and state changes
/// happen atomically; everything else is lock-free.
pub struct Frame {
    count: u64,
    kind: FrameKind,
    created_at: Instant,
    entities: Mutex<FrameEntities>,
    skip: AtomicBool,
    timestamp_ns: AtomicU64,
    enqueued: AtomicUsize,
    finished: AtomicBool,
}

struct FrameEntities {
    requested: StageSet,
    list: Vec<Entity>,
}

impl FrameEntities {
    fn index(&self, stage: StageId) -> Option<usize> {
        self.list.iter().position(|e| e.stage() == stage)
    }

    fn get(&self, frame: u64, stage: StageId) -> Result<&Entity> {
        self.list
            .iter()
            .find(|e| e.stage() == stage)
            .ok_or(Error::UnknownEntity { frame, stage })
    }

    fn get_mut(&mut self, frame: u64, stage: StageId) -> Result<&mut Entity> {
        self.list
            .iter_mut()
            .find(|e| e.stage() == stage)
            .ok_or(Error::UnknownEntity { frame, stage })
    }

    /// Stages whose parent is `stage` and that read its output
    fn consumers(&self, stage: StageId) -> impl Iterator<Item = &Entity> {
        self.list
            .iter()
            .filter(move |e| e.spec.parent == Some(stage) && e.spec.consumes_parent)
    }

    /// `stage` followed by everything routed below it
    fn subtree(&self, stage: StageId) -> Vec<StageId> {
        let mut out = vec![stage];
        let mut i = 0;
        while i < out.len() {
            let parent = out[i];
            out.extend(
                self.list
                    .iter()
                    .filter(|e| e.spec.parent == Some(parent))
                    .map(|e| e.stage()),
            );
            i += 1;
        }
        out
    }

    /// Mark every non-terminal entity in `stages` as skipped
    fn skip(&mut self, stages: &[StageId], requested_only: bool) -> Vec<StageId> {
        let mut skipped = Vec::new();
        for entity in self.list.iter_mut() {
            if !stages.contains(&entity.stage()) || entity.state.is_terminal() {
                continue;
            }
            if requested_only && entity.state != EntityState::Requested {
                continue;
            }
            entity.state = EntityState::FrameSkip;
            skipped.push(entity.stage());
        }
        skipped
    }
}

impl Frame {
    pub fn new(count: u64, kind: FrameKind, specs: &[EntitySpec]) -> Self {
        let list: Vec<Entity> = specs.iter().copied().map(Entity::new).collect();
        Self {
            count,
            kind,
            created_at: Instant::now(),
            entities: Mutex::new(FrameEntities {
                requested: list.iter().map(|e| e.stage()).collect(),
                list,
            }),
            skip: AtomicBool::new(false),
            timestamp_ns: AtomicU64::new(0),
            enqueued: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn requested(&self) -> StageSet {
        self.entities.lock().requested
    }

    pub fn has_entity(&self, stage: StageId) -> bool {
        self.entities.lock().requested.contains(stage)
    }

    /// Route the frame through additional stages. Specs for stages the
    /// frame already carries are ignored.
    pub fn attach_entities(&self, specs: &[EntitySpec]) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(Error::UnknownFrame(self.count));
        }
        let mut entities = self.entities.lock();
        for spec in specs {
            if entities.requested.contains(spec.stage) {
                continue;
            }
            entities.requested.insert(spec.stage);
            entities.list.push(Entity::new(*spec));
        }
        Ok(())
    }

    pub fn entity_plan(&self, stage: StageId) -> Result<EntityPlan> {
        Ok(self.entities.lock().get(self.count, stage)?.plan())
    }

    pub fn entity_state(&self, stage: StageId) -> Result<EntityState> {
        Ok(self.entities.lock().get(self.count, stage)?.state)
    }

    pub fn entity_states(&self) -> Vec<(StageId, EntityState)> {
        self.entities
            .lock()
            .list
            .iter()
            .map(|e| (e.stage(), e.state))
            .collect()
    }

    /// Bind buffers to `stage` and mark it processing. Without an explicit
    /// `src`, a consuming stage reads its parent's output buffer.
    pub fn setup_entity(
        &self,
        stage: StageId,
        src: Option<BufferHandle>,
        dst: Option<BufferHandle>,
    ) -> Result<()> {
        let mut entities = self.entities.lock();
        let spec = entities.get(self.count, stage)?.spec;

        let src = match (src, spec.parent) {
            (Some(handle), _) => Some(handle),
            (None, Some(parent)) if spec.consumes_parent => {
                let parent_dst = entities.get(self.count, parent)?.dst;
                match (parent_dst.state, parent_dst.handle) {
                    (BufferState::Complete, Some(handle)) => Some(handle),
                    (state, _) => {
                        return Err(Error::BufferNotReady {
                            frame: self.count,
                            stage: parent,
                            state,
                        })
                    }
                }
            }
            _ => None,
        };

        entities.get_mut(self.count, stage)?.setup(self.count, src, dst)
    }

    /// Move `stage` to `state`. Completing a stage requires its parent to
    /// have finished first.
    pub fn set_entity_state(&self, stage: StageId, state: EntityState) -> Result<()> {
        let mut entities = self.entities.lock();
        if state == EntityState::Complete {
            if let Some(parent) = entities.get(self.count, stage)?.spec.parent {
                let parent_state = match entities.index(parent) {
                    Some(i) => entities.list[i].state,
                    // Parent lives in another graph and has already been consumed
                    None => EntityState::Complete,
                };
                if !parent_state.is_terminal() {
                    return Err(Error::ParentPending {
                        frame: self.count,
                        stage,
                        parent,
                    });
                }
            }
        }
        entities.get_mut(self.count, stage)?.transition(self.count, state)
    }

    /// Record the hardware result for `stage`'s buffers.
    pub fn signal_buffers(&self, stage: StageId, ok: bool) -> Result<()> {
        self.entities
            .lock()
            .get_mut(self.count, stage)?
            .signal_buffers(self.count, ok)
    }

    pub fn dst_buffer(&self, stage: StageId) -> Option<BufferHandle> {
        let entities = self.entities.lock();
        entities.get(self.count, stage).ok()?.dst.handle
    }

    pub fn src_buffer(&self, stage: StageId) -> Option<BufferHandle> {
        let entities = self.entities.lock();
        entities.get(self.count, stage).ok()?.src.handle
    }

    pub fn dst_buffer_state(&self, stage: StageId) -> Result<BufferState> {
        Ok(self.entities.lock().get(self.count, stage)?.dst.state)
    }

    /// Hardware flagged one of `stage`'s buffers as bad
    pub fn buffers_failed(&self, stage: StageId) -> bool {
        let entities = self.entities.lock();
        entities
            .get(self.count, stage)
            .is_ok_and(|e| e.src.state == BufferState::Error || e.dst.state == BufferState::Error)
    }

    /// Skip `stage` and everything routed below it that has not started.
    pub fn skip_subtree(&self, stage: StageId) -> Vec<StageId> {
        let mut entities = self.entities.lock();
        let stages = entities.subtree(stage);
        entities.skip(&stages, true)
    }

    /// Skip `stage` and everything below it, including entities already set
    /// up but never submitted to hardware.
    pub fn skip_from(&self, stage: StageId) -> Vec<StageId> {
        let mut entities = self.entities.lock();
        let stages = entities.subtree(stage);
        entities.skip(&stages, false)
    }

    /// Skip everything below `stage` that has not finished, including work in
    /// flight. Used once the hardware has failed or been flushed.
    pub fn skip_descendants(&self, stage: StageId) -> Vec<StageId> {
        let mut entities = self.entities.lock();
        let stages = entities.subtree(stage);
        entities.skip(&stages[1..], false)
    }

    /// Skip every pending consumer of `producer`'s output, so the buffer can
    /// be returned.
    pub fn skip_consumers(&self, producer: StageId) -> Vec<StageId> {
        let mut entities = self.entities.lock();
        let heads: Vec<StageId> = entities
            .consumers(producer)
            .filter(|e| e.state == EntityState::Requested)
            .map(|e| e.stage())
            .collect();
        let stages: Vec<StageId> = heads.into_iter().flat_map(|s| entities.subtree(s)).collect();
        entities.skip(&stages, true)
    }

    /// Skip every entity that has not reached a terminal state.
    pub fn abort(&self) -> Vec<StageId> {
        let mut entities = self.entities.lock();
        let stages: Vec<StageId> = entities.list.iter().map(|e| e.stage()).collect();
        entities.skip(&stages, false)
    }

    /// The stage whose output a hold on (`stage`, `is_src`) pins
    pub fn held_producer(&self, stage: StageId, is_src: bool) -> Option<StageId> {
        if !is_src {
            return Some(stage);
        }
        let entities = self.entities.lock();
        entities.get(self.count, stage).ok()?.spec.parent
    }

    /// Detach output buffers nobody needs anymore: the producer has finished
    /// and every consumer has either finished or will never run.
    pub fn take_releasable_buffers(&self) -> Vec<BufferHandle> {
        let mut entities = self.entities.lock();
        let releasable: Vec<usize> = entities
            .list
            .iter()
            .enumerate()
            .filter(|(_, e)| e.dst.handle.is_some() && e.state.is_terminal())
            .filter(|(_, e)| {
                entities
                    .consumers(e.stage())
                    .all(|consumer| consumer.state.is_terminal())
            })
            .map(|(i, _)| i)
            .collect();

        let mut handles = Vec::with_capacity(releasable.len());
        for i in releasable {
            if let Some(handle) = entities.list[i].dst.handle.take() {
                handles.push(handle);
            }
        }
        Self::clear_aliases(&mut entities, &handles);
        handles
    }

    /// Detach every output buffer regardless of state.
    pub fn take_all_buffers(&self) -> Vec<BufferHandle> {
        let mut entities = self.entities.lock();
        let handles: Vec<BufferHandle> = entities
            .list
            .iter_mut()
            .filter_map(|e| e.dst.handle.take())
            .collect();
        Self::clear_aliases(&mut entities, &handles);
        handles
    }

    fn clear_aliases(entities: &mut FrameEntities, released: &[BufferHandle]) {
        for entity in entities.list.iter_mut() {
            if entity.src.handle.is_some_and(|h| released.contains(&h)) {
                entity.src.handle = None;
            }
        }
    }

    /// Every entity has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.entities
            .lock()
            .list
            .iter()
            .all(|e| e.state.is_terminal())
    }

    pub fn set_skip(&self, skip: bool) {
        self.skip.store(skip, Ordering::Release);
    }

    /// Frame marked to be dropped after the sensor (e.g. exposure settling)
    pub fn is_skip(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    pub fn set_timestamp(&self, timestamp_ns: u64) {
        self.timestamp_ns.store(timestamp_ns, Ordering::Release);
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp_ns.load(Ordering::Acquire)
    }

    pub(crate) fn mark_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_dequeued(&self) {
        let _ = self
            .enqueued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn is_enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire) > 0
    }

    /// Returns true exactly once, for the caller that finishes the frame.
    pub(crate) fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("count", &self.count)
            .field("kind", &self.kind)
            .field("skip", &self.is_skip())
            .field("entities", &self.entity_states())
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {} [", self.count)?;
        for (i, (stage, state)) in self.entity_states().into_iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{stage}:{state:?}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AllocationMode, BufferPool, BufferPosition, PlaneLayout, PoolInfo};

    fn spec(stage: StageId, parent: Option<StageId>) -> EntitySpec {
        EntitySpec {
            stage,
            parent,
            consumes_parent: parent.is_some(),
            needs_dst: true,
        }
    }

    fn pool(stage: StageId) -> BufferPool {
        let pool = BufferPool::new(stage);
        pool.set_info(PoolInfo {
            layout: PlaneLayout::new(vec![16], false),
            min_count: 2,
            max_count: 2,
            mode: AllocationMode::AtOnce,
        })
        .unwrap();
        pool.alloc().unwrap();
        pool
    }

    fn chain() -> Frame {
        Frame::new(
            1,
            FrameKind::Preview,
            &[
                spec(StageId::Sensor, None),
                spec(StageId::Isp, Some(StageId::Sensor)),
                spec(StageId::Scaler, Some(StageId::Isp)),
            ],
        )
    }

    fn run(frame: &Frame, stage: StageId, pool: &BufferPool) {
        let (_, dst) = pool.get_buffer(BufferPosition::InDriver).unwrap();
        frame.setup_entity(stage, None, Some(dst)).unwrap();
        frame.signal_buffers(stage, true).unwrap();
        frame.set_entity_state(stage, EntityState::Complete).unwrap();
    }

    #[test]
    fn test_parent_must_finish_first() {
        let frame = chain();
        let sensor = pool(StageId::Sensor);
        let (_, dst) = sensor.get_buffer(BufferPosition::InDriver).unwrap();
        frame.setup_entity(StageId::Sensor, None, Some(dst)).unwrap();

        // Isp cannot read a buffer the sensor is still writing
        assert!(matches!(
            frame.setup_entity(StageId::Isp, None, Some(dst)),
            Err(Error::BufferNotReady { .. })
        ));
        assert!(matches!(
            frame.set_entity_state(StageId::Isp, EntityState::Complete),
            Err(Error::ParentPending { .. })
        ));
    }

    #[test]
    fn test_src_aliases_parent_output() {
        let frame = chain();
        let sensor = pool(StageId::Sensor);
        let isp = pool(StageId::Isp);
        run(&frame, StageId::Sensor, &sensor);

        let (_, dst) = isp.get_buffer(BufferPosition::InDriver).unwrap();
        frame.setup_entity(StageId::Isp, None, Some(dst)).unwrap();
        assert_eq!(
            frame.src_buffer(StageId::Isp),
            frame.dst_buffer(StageId::Sensor)
        );
    }

    #[test]
    fn test_unknown_stage() {
        let frame = chain();
        assert!(matches!(
            frame.entity_state(StageId::Jpeg),
            Err(Error::UnknownEntity { frame: 1, .. })
        ));
    }

    #[test]
    fn test_buffers_release_after_consumers() {
        let frame = chain();
        let sensor = pool(StageId::Sensor);
        let isp = pool(StageId::Isp);
        run(&frame, StageId::Sensor, &sensor);

        // Isp has not read the bayer yet
        assert!(frame.take_releasable_buffers().is_empty());

        run(&frame, StageId::Isp, &isp);
        let released = frame.take_releasable_buffers();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].pool, StageId::Sensor);
        assert_eq!(frame.src_buffer(StageId::Isp), None);
    }

    #[test]
    fn test_skip_subtree_completes_frame() {
        let frame = chain();
        let sensor = pool(StageId::Sensor);
        run(&frame, StageId::Sensor, &sensor);
        assert!(!frame.is_complete());

        let skipped = frame.skip_subtree(StageId::Isp);
        assert_eq!(skipped, vec![StageId::Isp, StageId::Scaler]);
        assert!(frame.is_complete());
        assert_eq!(frame.take_releasable_buffers().len(), 1);
    }

    #[test]
    fn test_attached_consumer_pins_buffer() {
        let frame = Frame::new(3, FrameKind::Preview, &[spec(StageId::Sensor, None)]);
        let sensor = pool(StageId::Sensor);
        run(&frame, StageId::Sensor, &sensor);

        frame
            .attach_entities(&[spec(StageId::ReprocessIsp, Some(StageId::Sensor))])
            .unwrap();
        assert!(!frame.is_complete());
        assert!(frame.take_releasable_buffers().is_empty());

        assert_eq!(frame.skip_consumers(StageId::Sensor), vec![StageId::ReprocessIsp]);
        assert!(frame.is_complete());
        assert_eq!(frame.take_releasable_buffers().len(), 1);
    }

    #[test]
    fn test_abort_skips_in_flight_work() {
        let frame = chain();
        let sensor = pool(StageId::Sensor);
        let (_, dst) = sensor.get_buffer(BufferPosition::InDriver).unwrap();
        frame.setup_entity(StageId::Sensor, None, Some(dst)).unwrap();

        assert_eq!(frame.abort().len(), 3);
        assert!(frame.is_complete());
        assert_eq!(frame.take_all_buffers(), vec![dst]);
    }

    #[test]
    fn test_finish_once() {
        let frame = chain();
        assert!(frame.mark_finished());
        assert!(!frame.mark_finished());
    }
}
