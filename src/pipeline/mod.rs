//! Stage graphs, the threads that drive them and the queues between them

pub mod dispatch;
pub mod factory;
pub mod queue;
pub mod ringbuf;
pub mod selector;
pub mod topology;
pub mod worker;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

pub use dispatch::{Completion, DeliverySink, Dispatcher, PreviewThrottle};
pub use factory::{PipeState, PipelineFactory};
pub use queue::{FrameQueue, PopError, Queued};
pub use selector::CaptureSelector;
pub use topology::{Action, Consumer, DispatchTable, StageGraph, StageNode, Topology};
pub use worker::{StageHealth, StageInput};

use crate::buffer::BufferManager;
use crate::frame::{EntitySpec, FrameManager};
use crate::PipelineConfig;

/// State shared by every thread of one session's pipeline
pub struct PipelineContext {
    pub buffers: Arc<BufferManager>,
    pub frames: Arc<FrameManager>,
    /// Completions from every stage, consumed by the dispatcher
    pub done: Arc<FrameQueue<Completion>>,
    pub config: PipelineConfig,
    /// Route of a freshly generated streaming frame
    specs: Vec<EntitySpec>,
    pending_skips: AtomicU32,
}

impl PipelineContext {
    pub fn new(
        buffers: Arc<BufferManager>,
        frames: Arc<FrameManager>,
        config: PipelineConfig,
        specs: Vec<EntitySpec>,
    ) -> Arc<Self> {
        let done = {
            let frames = frames.clone();
            FrameQueue::new("done").with_release_hook(move |completion: Completion| {
                if let Err(e) = frames.abort(&completion.frame) {
                    warn!(frame = completion.frame.count(), error = %e, "Abort on release failed");
                }
            })
        };

        Arc::new(Self {
            buffers,
            frames,
            done: Arc::new(done),
            config,
            specs,
            pending_skips: AtomicU32::new(0),
        })
    }

    pub fn frame_specs(&self) -> &[EntitySpec] {
        &self.specs
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    /// Mark the next `count` generated frames to be dropped after the sensor.
    pub fn skip_next(&self, count: u32) {
        self.pending_skips.store(count, Ordering::Release);
    }

    pub(crate) fn take_skip(&self) -> bool {
        self.pending_skips
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Human-readable snapshot for fault reports
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for stats in self.buffers.stats() {
            out.push_str(&format!(
                "pool {}: allocated={} available={} checked_out={} misses={}\n",
                stats.pool, stats.allocated, stats.available, stats.checked_out, stats.misses
            ));
        }
        out.push_str(&format!("done queue: {}\n", self.done.get_size_of_process_q()));
        for line in self.frames.dump() {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}
