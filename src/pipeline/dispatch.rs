//! Completion dispatch: the single consumer of stage completions

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, instrument, trace, warn};

use super::queue::{FrameQueue, PopError, Queued};
use super::selector::CaptureSelector;
use super::topology::{Action, Consumer, DispatchTable};
use super::worker::StageInput;
use super::PipelineContext;
use crate::frame::{EntitySpec, EntityState, FrameRef};
use crate::stage::StageId;

/// A stage finished (or gave up on) its work for a frame
pub struct Completion {
    pub stage: StageId,
    pub frame: FrameRef,
}

impl Queued for Completion {
    fn on_enqueue(&self) {
        self.frame.on_enqueue();
    }

    fn on_dequeue(&self) {
        self.frame.on_dequeue();
    }
}

/// Receives finished outputs on behalf of the host
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, consumer: Consumer, stage: StageId, frame: &FrameRef);

    /// Output for `consumer` will not be produced for this frame
    fn failed(&self, consumer: Consumer, stage: StageId, frame: &FrameRef);
}

/// Drops preview frames in proportion when the sensor outpaces the display.
#[derive(Debug, Clone)]
pub struct PreviewThrottle {
    sensor_fps: u32,
    display_fps: u32,
    seen: u64,
    kept: u64,
}

impl PreviewThrottle {
    pub fn new(sensor_fps: u32, display_fps: u32) -> Self {
        Self {
            sensor_fps,
            display_fps,
            seen: 0,
            kept: 0,
        }
    }

    /// Whether the next preview frame should be processed
    pub fn admit(&mut self) -> bool {
        if self.display_fps == 0 || self.display_fps >= self.sensor_fps {
            return true;
        }
        self.seen += 1;
        let target = self.seen * u64::from(self.display_fps) / u64::from(self.sensor_fps);
        if target > self.kept {
            self.kept += 1;
            true
        } else {
            false
        }
    }
}

/// Applies the dispatch table to every completion: completes the stage,
/// then forwards, holds or delivers the frame, and finishes it once every
/// entity is terminal.
pub struct Dispatcher {
    table: DispatchTable,
    ctx: Arc<PipelineContext>,
    sink: Arc<dyn DeliverySink>,
    routes: HashMap<StageId, Arc<FrameQueue<StageInput>>>,
    selector: Option<Arc<CaptureSelector>>,
    capture_specs: Vec<EntitySpec>,
    throttle: PreviewThrottle,
}

impl Dispatcher {
    pub fn new(table: DispatchTable, ctx: Arc<PipelineContext>, sink: Arc<dyn DeliverySink>) -> Self {
        Self {
            table,
            ctx,
            sink,
            routes: HashMap::new(),
            selector: None,
            capture_specs: Vec::new(),
            throttle: PreviewThrottle::new(0, 0),
        }
    }

    pub fn with_routes<'a>(
        mut self,
        routes: impl IntoIterator<Item = (StageId, &'a Arc<FrameQueue<StageInput>>)>,
    ) -> Self {
        self.routes
            .extend(routes.into_iter().map(|(stage, q)| (stage, q.clone())));
        self
    }

    /// Hold completed frames for still capture, routing them through
    /// `capture_specs` while held.
    pub fn with_capture(mut self, selector: Arc<CaptureSelector>, capture_specs: Vec<EntitySpec>) -> Self {
        self.selector = Some(selector);
        self.capture_specs = capture_specs;
        self
    }

    pub fn with_throttle(mut self, throttle: PreviewThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("dispatch".into())
            .spawn(move || {
                info!("Dispatcher started");
                let done = self.ctx.done.clone();
                let poll = self.ctx.poll_interval();
                while !stop.load(Ordering::Acquire) {
                    match done.wait_and_pop_process_q(Some(poll)) {
                        Ok(completion) => self.handle(completion),
                        Err(PopError::TimedOut | PopError::WokenUp) => {}
                    }
                }
                info!("Dispatcher stopped");
            })
    }

    #[instrument(level = "trace", skip_all, fields(stage = %completion.stage, frame = completion.frame.count()))]
    pub fn handle(&mut self, completion: Completion) {
        let Completion { stage, frame } = completion;

        match frame.entity_state(stage) {
            Ok(EntityState::Processing) => self.finish_stage(stage, &frame),
            Ok(EntityState::FrameSkip | EntityState::Error) => self.report_failure(stage, &frame),
            Ok(state) => warn!(frame = frame.count(), %stage, ?state, "Unexpected completion"),
            Err(e) => warn!(frame = frame.count(), %stage, error = %e, "Completion for unknown entity"),
        }

        if let Err(e) = self.ctx.frames.finish_if_complete(&frame) {
            warn!(frame = frame.count(), error = %e, "Failed to finish frame");
        }
    }

    fn finish_stage(&mut self, stage: StageId, frame: &FrameRef) {
        if !frame.buffers_failed(stage) {
            match frame.set_entity_state(stage, EntityState::Complete) {
                Ok(()) => {
                    trace!(frame = frame.count(), %stage, "Stage complete");
                    self.run_actions(stage, frame);
                    return;
                }
                Err(e) => warn!(frame = frame.count(), %stage, error = %e, "Protocol violation"),
            }
        }

        if let Err(e) = frame.set_entity_state(stage, EntityState::Error) {
            debug!(frame = frame.count(), %stage, error = %e, "Entity already settled");
        }
        frame.skip_descendants(stage);
        self.report_failure(stage, frame);
    }

    fn report_failure(&self, stage: StageId, frame: &FrameRef) {
        metrics::counter!("camstage_entity_skipped", "stage" => stage.as_str()).increment(1);
        if let Some(consumer) = self.table.consumer_below(stage) {
            self.sink.failed(consumer, stage, frame);
        }
    }

    fn run_actions(&mut self, stage: StageId, frame: &FrameRef) {
        let actions = self.table.actions(stage).to_vec();
        for action in actions {
            match action {
                Action::CompleteFused(child) => {
                    if matches!(frame.entity_state(child), Ok(EntityState::Processing)) {
                        self.finish_stage(child, frame);
                    }
                }
                Action::Forward(next) => self.forward(next, frame),
                Action::HoldForCapture { stage, is_src } => self.hold(stage, is_src, frame),
                Action::Deliver(consumer) => self.sink.deliver(consumer, stage, frame),
            }
        }
    }

    fn forward(&mut self, next: StageId, frame: &FrameRef) {
        if !matches!(frame.entity_state(next), Ok(EntityState::Requested)) {
            return;
        }
        if frame.is_skip() {
            frame.skip_subtree(next);
            metrics::counter!("camstage_entity_skipped", "stage" => next.as_str()).increment(1);
            return;
        }
        if self.table.is_throttled(next) && !self.throttle.admit() {
            frame.skip_subtree(next);
            metrics::counter!("camstage_preview_dropped").increment(1);
            trace!(frame = frame.count(), "Preview frame dropped");
            return;
        }

        let Some(queue) = self.routes.get(&next) else {
            warn!(frame = frame.count(), stage = %next, "No route to stage");
            frame.skip_subtree(next);
            return;
        };
        if let Err(StageInput::Frame(frame)) = queue.push_process_q(StageInput::Frame(frame.clone())) {
            debug!(frame = frame.count(), stage = %next, "Stage queue full");
            frame.skip_subtree(next);
        }
    }

    fn hold(&mut self, stage: StageId, is_src: bool, frame: &FrameRef) {
        let Some(selector) = &self.selector else {
            return;
        };
        if frame.is_skip() {
            return;
        }
        if let Err(e) = frame.attach_entities(&self.capture_specs) {
            debug!(frame = frame.count(), error = %e, "Frame cannot be held");
            return;
        }
        if let Err(e) = selector.manage_frame_hold_list(frame.clone(), stage, is_src) {
            warn!(frame = frame.count(), error = %e, "Failed to hold frame");
            if let Some(producer) = frame.held_producer(stage, is_src) {
                frame.skip_consumers(producer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_keeps_display_rate() {
        let mut throttle = PreviewThrottle::new(120, 30);
        let kept = (0..120).filter(|_| throttle.admit()).count();
        assert_eq!(kept, 30);
    }

    #[test]
    fn test_throttle_passes_when_display_keeps_up() {
        let mut throttle = PreviewThrottle::new(30, 60);
        assert!((0..10).all(|_| throttle.admit()));
    }
}
