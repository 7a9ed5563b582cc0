//! Per-stage worker threads

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use super::dispatch::Completion;
use super::queue::{FrameQueue, PopError, Queued};
use super::PipelineContext;
use crate::buffer::BufferPosition;
use crate::error::Error;
use crate::frame::{EntityState, FrameKind, FrameRef};
use crate::hw::{HardwareStage, StageDone, StageJob};
use crate::stage::StageId;
use crate::utils;

/// Work item on a stage's input queue
pub enum StageInput {
    Frame(FrameRef),
}

impl Queued for StageInput {
    fn on_enqueue(&self) {
        let StageInput::Frame(frame) = self;
        frame.on_enqueue();
    }

    fn on_dequeue(&self) {
        let StageInput::Frame(frame) = self;
        frame.on_dequeue();
    }
}

/// Progress tracking for the watchdog
#[derive(Debug)]
pub struct StageHealth {
    in_flight: AtomicUsize,
    completed: AtomicU64,
    last_progress: Mutex<Instant>,
}

impl Default for StageHealth {
    fn default() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            last_progress: Mutex::new(Instant::now()),
        }
    }
}

impl StageHealth {
    pub(crate) fn submitted(&self) {
        if self.in_flight.fetch_add(1, Ordering::AcqRel) == 0 {
            *self.last_progress.lock() = Instant::now();
        }
    }

    pub(crate) fn completed(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.completed.fetch_add(1, Ordering::Relaxed);
        *self.last_progress.lock() = Instant::now();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// How long work has been outstanding without any completion
    pub fn stalled_for(&self, now: Instant) -> Option<Duration> {
        if self.in_flight() == 0 {
            return None;
        }
        Some(now.saturating_duration_since(*self.last_progress.lock()))
    }
}

/// Drives one worker group: a head stage plus the OTF stages fused into it.
pub(crate) struct StageWorker {
    pub(crate) head: StageId,
    pub(crate) group: Vec<StageId>,
    /// Root of the graph: creates frames instead of receiving them
    pub(crate) generator: bool,
    pub(crate) hw: Arc<dyn HardwareStage>,
    pub(crate) input: Arc<FrameQueue<StageInput>>,
    pub(crate) ctx: Arc<PipelineContext>,
    pub(crate) health: Arc<StageHealth>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) draining: Arc<AtomicBool>,
    pub(crate) core: Option<usize>,
    pub(crate) in_flight: HashMap<u64, (FrameRef, Instant)>,
}

impl StageWorker {
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("stage-{}", self.head))
            .spawn(move || self.run())
    }

    #[instrument(skip(self), fields(stage = %self.head))]
    fn run(mut self) {
        if let Some(core) = self.core {
            utils::pin_current_thread(core);
        }
        info!(group = ?self.group, generator = self.generator, "Stage worker started");

        let poll = self.ctx.poll_interval();
        while !self.stop.load(Ordering::Acquire) {
            self.drain_completions(Duration::ZERO);

            match self.input.wait_and_pop() {
                Ok(StageInput::Frame(frame)) => self.submit(frame),
                Err(PopError::TimedOut) => {
                    if self.generator {
                        self.generate();
                    } else if !self.in_flight.is_empty() {
                        self.drain_completions(poll);
                    }
                }
                Err(PopError::WokenUp) => {}
            }
        }

        self.flush();
        info!("Stage worker stopped");
    }

    /// Start a new frame if the head pool can take it.
    fn generate(&mut self) {
        if self.draining.load(Ordering::Acquire) {
            return;
        }
        let can_start = self
            .ctx
            .buffers
            .pool(self.head)
            .is_ok_and(|pool| pool.can_hand_out());
        if !can_start {
            return;
        }

        let frame = self
            .ctx
            .frames
            .create_frame(FrameKind::Preview, self.ctx.frame_specs());
        if self.ctx.take_skip() {
            frame.set_skip(true);
        }
        self.submit(frame);
    }

    fn submit(&mut self, frame: FrameRef) {
        match frame.entity_state(self.head) {
            Ok(EntityState::Requested) => {}
            Ok(state) => {
                debug!(frame = frame.count(), ?state, "Frame no longer needs this stage");
                self.emit(frame);
                return;
            }
            Err(e) => {
                warn!(frame = frame.count(), error = %e, "Frame not routed through this stage");
                if let Err(e) = self.ctx.frames.abort(&frame) {
                    warn!(frame = frame.count(), error = %e, "Abort failed");
                }
                return;
            }
        }

        for i in 0..self.group.len() {
            let stage = self.group[i];
            if !matches!(frame.entity_state(stage), Ok(EntityState::Requested)) {
                continue;
            }
            if let Err(e) = self.ctx.buffers.setup_entity(stage, &frame, None, None) {
                self.reject(frame, stage, e);
                return;
            }
        }

        let job = StageJob {
            frame_count: frame.count(),
            stage: self.head,
            src: frame.src_buffer(self.head),
            dst: self
                .group
                .iter()
                .filter_map(|s| frame.dst_buffer(*s).map(|h| (*s, h)))
                .collect(),
        };
        if let Err(e) = self.hw.queue_buffer(job) {
            self.reject(frame, self.head, e);
            return;
        }

        trace!(frame = frame.count(), "Submitted");
        self.health.submitted();
        self.in_flight.insert(frame.count(), (frame, Instant::now()));
    }

    /// The group cannot run for this frame: skip it and everything below it
    /// and let the dispatcher settle the frame.
    fn reject(&mut self, frame: FrameRef, stage: StageId, error: Error) {
        if error.is_transient() {
            debug!(frame = frame.count(), %stage, error = %error, "Skipping stage under backpressure");
        } else {
            warn!(frame = frame.count(), %stage, error = %error, "Stage rejected frame");
        }
        metrics::counter!("camstage_entity_skipped", "stage" => stage.as_str()).increment(1);

        frame.skip_from(self.head);
        self.emit(frame);
    }

    fn drain_completions(&mut self, timeout: Duration) {
        let mut wait = timeout;
        loop {
            match self.hw.dequeue_buffer(wait) {
                Ok(Some(done)) => self.complete(done),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Dequeue failed");
                    break;
                }
            }
            wait = Duration::ZERO;
        }
    }

    fn complete(&mut self, done: StageDone) {
        let Some((frame, submitted)) = self.in_flight.remove(&done.frame_count) else {
            warn!(frame = done.frame_count, "Completion for a frame not in flight");
            return;
        };
        self.health.completed();
        metrics::histogram!("camstage_stage_latency_us", "stage" => self.head.as_str())
            .record(submitted.elapsed().as_micros() as f64);

        if self.generator {
            frame.set_timestamp(done.timestamp_ns);
        }
        if !done.ok {
            warn!(frame = frame.count(), "Hardware reported a failed buffer");
        }
        for stage in &self.group {
            if let Some(dst) = frame.dst_buffer(*stage) {
                self.ctx.buffers.set_position(&dst, BufferPosition::InHal);
            }
            if let Err(e) = frame.signal_buffers(*stage, done.ok) {
                trace!(frame = frame.count(), %stage, error = %e, "Buffer signal ignored");
            }
        }
        self.emit(frame);
    }

    fn emit(&self, frame: FrameRef) {
        let completion = Completion {
            stage: self.head,
            frame,
        };
        if let Err(completion) = self.ctx.done.push_process_q(completion) {
            if let Err(e) = self.ctx.frames.abort(&completion.frame) {
                warn!(frame = completion.frame.count(), error = %e, "Abort failed");
            }
        }
    }

    /// Cancel hardware work and abort every frame still in flight.
    fn flush(&mut self) {
        let flushed = self.hw.flush();
        let aborted = self.in_flight.len();
        for (_, (frame, _)) in self.in_flight.drain() {
            self.health.completed();
            if let Err(e) = self.ctx.frames.abort(&frame) {
                warn!(frame = frame.count(), error = %e, "Abort failed");
            }
        }
        if aborted > 0 {
            debug!(flushed = flushed.len(), aborted, "Stage flushed");
        }
    }
}
