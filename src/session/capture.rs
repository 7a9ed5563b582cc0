//! Still-capture thread: turns picture requests into reprocessing work

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::host::{HostBridge, Notification};
use crate::frame::FrameManager;
use crate::pipeline::queue::{FrameQueue, Queued};
use crate::pipeline::selector::HoldKey;
use crate::pipeline::{CaptureSelector, StageInput};
use crate::CaptureConfig;

pub(crate) struct CaptureRequest {
    pub(crate) count: u32,
}

impl Queued for CaptureRequest {}

pub(crate) struct CaptureWorker {
    pub(crate) requests: Arc<FrameQueue<CaptureRequest>>,
    pub(crate) selector: Arc<CaptureSelector>,
    pub(crate) frames: Arc<FrameManager>,
    /// Input of the first reprocessing stage
    pub(crate) target: Arc<FrameQueue<StageInput>>,
    pub(crate) host: Arc<HostBridge>,
    pub(crate) hold: HoldKey,
    pub(crate) config: CaptureConfig,
    pub(crate) stop: Arc<AtomicBool>,
}

impl CaptureWorker {
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run())
    }

    fn run(self) {
        info!("Capture thread started");
        self.requests
            .set_wait_time(Some(Duration::from_millis(self.config.select_wait_ms.max(1))));
        while !self.stop.load(Ordering::Acquire) {
            if let Ok(request) = self.requests.wait_and_pop() {
                self.capture(request);
            }
        }
        info!("Capture thread stopped");
    }

    #[instrument(skip_all, fields(count = request.count))]
    fn capture(&self, request: CaptureRequest) {
        for _ in 0..request.count {
            if self.stop.load(Ordering::Acquire) {
                return;
            }

            let Some(frame) = self.selector.select_frames(
                request.count,
                self.hold.stage,
                self.hold.is_src,
                self.config.select_retry_budget,
            ) else {
                // The rest of the burst cannot be served either
                while self.host.pictures_pending() > 0 {
                    self.host
                        .picture_failed("no frame available for capture".into());
                }
                return;
            };

            debug!(frame = frame.count(), "Reprocessing frame");
            self.host.notify(Notification::Shutter {
                frame_count: frame.count(),
            });

            if let Err(StageInput::Frame(frame)) =
                self.target.push_process_q(StageInput::Frame(frame.clone()))
            {
                warn!(frame = frame.count(), "Reprocessing queue full");
                if let Some(producer) = frame.held_producer(self.hold.stage, self.hold.is_src) {
                    frame.skip_consumers(producer);
                }
                if let Err(e) = self.frames.finish_if_complete(&frame) {
                    warn!(frame = frame.count(), error = %e, "Failed to finish frame");
                }
                self.host.picture_failed("reprocessing queue full".into());
            }

            // The selector handed its reference over; the pipeline keeps its own
            if let Err(e) = self.frames.release(&frame) {
                warn!(frame = frame.count(), error = %e, "Failed to release selected frame");
            }
        }
    }
}
