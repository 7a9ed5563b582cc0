//! Software model of a hardware stage

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{HardwareStage, StageDone, StageJob};
use crate::buffer::{BufferManager, BufferMeta};
use crate::error::{Error, Result};
use crate::stage::StageId;

/// Failures to inject, counted in completed jobs
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultPlan {
    /// Every n-th job completes with a buffer error
    pub error_every: Option<u64>,
    /// Stop completing jobs after this many
    pub stall_after: Option<u64>,
    /// Report a device fault after this many
    pub fault_after: Option<u64>,
}

struct Pending {
    ready_at: Instant,
    job: StageJob,
}

#[derive(Default)]
struct SimState {
    buffers: Option<Arc<BufferManager>>,
    pending: VecDeque<Pending>,
    last_ready: Option<Instant>,
    controls: HashMap<u32, i64>,
    completed: u64,
    fault: Option<String>,
}

/// Processes jobs one at a time with a fixed latency, stamping each output
/// buffer with the frame count and a timestamp.
pub struct SimulatedStage {
    stage: StageId,
    latency: Duration,
    plan: FaultPlan,
    epoch: Instant,
    state: Mutex<SimState>,
    ready: Condvar,
}

impl SimulatedStage {
    pub fn new(stage: StageId, latency: Duration) -> Self {
        Self {
            stage,
            latency,
            plan: FaultPlan::default(),
            epoch: Instant::now(),
            state: Mutex::new(SimState::default()),
            ready: Condvar::new(),
        }
    }

    pub fn with_faults(mut self, plan: FaultPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn control(&self, id: u32) -> Option<i64> {
        self.state.lock().controls.get(&id).copied()
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    fn stalled(&self, state: &SimState) -> bool {
        self.plan.stall_after.is_some_and(|n| state.completed >= n)
    }

    fn finish(&self, state: &mut SimState, job: StageJob) -> StageDone {
        state.completed += 1;
        let ok = !self
            .plan
            .error_every
            .is_some_and(|n| n > 0 && state.completed % n == 0);
        if self.plan.fault_after.is_some_and(|n| state.completed >= n) && state.fault.is_none() {
            state.fault = Some(format!("{} stopped responding", self.stage));
        }

        let timestamp_ns = self.epoch.elapsed().as_nanos() as u64;
        if let Some(buffers) = &state.buffers {
            for (_, handle) in &job.dst {
                let Ok(pool) = buffers.pool(handle.pool) else {
                    continue;
                };
                pool.write_meta(
                    handle.index,
                    BufferMeta {
                        frame_count: job.frame_count,
                        timestamp_ns,
                    },
                );
                pool.with_planes_mut(handle.index, |planes| {
                    if let Some(plane) = planes.first_mut() {
                        let stamp = job.frame_count.to_le_bytes();
                        let n = stamp.len().min(plane.len());
                        plane[..n].copy_from_slice(&stamp[..n]);
                    }
                });
            }
        }

        StageDone {
            frame_count: job.frame_count,
            ok,
            timestamp_ns,
        }
    }
}

impl HardwareStage for SimulatedStage {
    fn stage(&self) -> StageId {
        self.stage
    }

    fn create(&self, buffers: Arc<BufferManager>) -> Result<()> {
        let mut state = self.state.lock();
        state.buffers = Some(buffers);
        state.fault = None;
        debug!(stage = %self.stage, latency = ?self.latency, "Simulated stage created");
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.buffers = None;
        state.pending.clear();
        Ok(())
    }

    fn set_control(&self, id: u32, value: i64) -> Result<()> {
        self.state.lock().controls.insert(id, value);
        Ok(())
    }

    fn queue_buffer(&self, job: StageJob) -> Result<()> {
        let mut state = self.state.lock();
        if state.buffers.is_none() {
            return Err(Error::Hardware {
                stage: self.stage,
                reason: "queue_buffer before create".into(),
            });
        }
        if job.stage != self.stage {
            return Err(Error::Hardware {
                stage: self.stage,
                reason: format!("job for {} queued on {}", job.stage, self.stage),
            });
        }

        let now = Instant::now();
        let start = state.last_ready.map_or(now, |last| last.max(now));
        let ready_at = start + self.latency;
        state.last_ready = Some(ready_at);
        state.pending.push_back(Pending { ready_at, job });
        drop(state);

        self.ready.notify_one();
        Ok(())
    }

    fn dequeue_buffer(&self, timeout: Duration) -> Result<Option<StageDone>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            let now = Instant::now();
            let next = if self.stalled(&state) {
                None
            } else {
                state.pending.front().map(|p| p.ready_at)
            };

            if let Some(ready_at) = next {
                if ready_at <= now {
                    if let Some(pending) = state.pending.pop_front() {
                        return Ok(Some(self.finish(&mut state, pending.job)));
                    }
                }
            }
            if now >= deadline {
                return Ok(None);
            }

            let wake = next.map_or(deadline, |ready_at| ready_at.min(deadline));
            let _ = self.ready.wait_until(&mut state, wake);
        }
    }

    fn flush(&self) -> Vec<StageJob> {
        let mut state = self.state.lock();
        state.last_ready = None;
        let flushed: Vec<StageJob> = state.pending.drain(..).map(|p| p.job).collect();
        if !flushed.is_empty() {
            warn!(stage = %self.stage, jobs = flushed.len(), "Flushed pending jobs");
        }
        flushed
    }

    fn fault(&self) -> Option<String> {
        self.state.lock().fault.clone()
    }
}
