//! Host-facing camera session: owns the pipelines, the dispatcher and the
//! capture and health threads, and translates host requests into them.

mod capture;
mod host;
mod monitor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, error, info, instrument, warn};

pub use host::{DeliveryCounts, HostEvent, Notification};

use capture::{CaptureRequest, CaptureWorker};
use host::HostBridge;
use monitor::HealthMonitor;

use crate::buffer::{
    stage_layout, AcquirePolicy, BufferManager, BufferPool, PoolInfo, PoolStats,
};
use crate::error::{Error, Result};
use crate::frame::FrameManager;
use crate::hw::{controls, HardwareSet};
use crate::pipeline::selector::HoldKey;
use crate::pipeline::{
    CaptureSelector, DispatchTable, Dispatcher, FrameQueue, PipelineContext, PipelineFactory,
    PreviewThrottle, StageGraph, Topology,
};
use crate::stage::StageId;
use crate::SessionConfig;

/// Capture requests waiting for the capture thread
const CAPTURE_QUEUE_DEPTH: usize = 4;

/// Host commands applied while streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    FaceDetection(bool),
    StartZoom { level: i64 },
    StopZoom,
    /// Degrees, applied to still captures
    Orientation(u32),
    /// Drop the next N frames after the sensor
    SkipFrames(u32),
}

/// Controls currently in effect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeControls {
    pub face_detection: bool,
    pub zoom_level: i64,
    pub zooming: bool,
    pub orientation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    Previewing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub topology: &'static str,
    pub state: SessionState,
    pub frames_created: u64,
    pub frames_outstanding: usize,
    pub held_frames: usize,
    pub hold_evicted: u64,
    pub pools: Vec<PoolStats>,
    pub queues: Vec<(StageId, usize)>,
    pub done_queue: usize,
    pub recording_in_flight: usize,
    pub delivered: DeliveryCounts,
    pub faulted: bool,
}

struct Threads {
    stop: Arc<AtomicBool>,
    dispatch: JoinHandle<()>,
    capture: Option<JoinHandle<()>>,
    monitor: (flume::Sender<()>, JoinHandle<()>),
}

pub struct Session {
    config: SessionConfig,
    ctx: Arc<PipelineContext>,
    preview: PipelineFactory,
    reprocessing: Option<PipelineFactory>,
    selector: Option<Arc<CaptureSelector>>,
    table: DispatchTable,
    host: Arc<HostBridge>,
    hardware: HardwareSet,
    controls: ArcSwap<RuntimeControls>,
    capture_requests: Arc<FrameQueue<CaptureRequest>>,
    threads: Option<Threads>,
    state: SessionState,
}

fn build_pools(graphs: &[&StageGraph], config: &SessionConfig) -> Result<Vec<BufferPool>> {
    let mut pools = Vec::new();
    for node in graphs.iter().flat_map(|g| g.nodes()) {
        if !node.owns_buffer {
            continue;
        }
        let pool_config = config.buffers.pool(node.stage);
        let pool = BufferPool::new(node.stage);
        pool.set_info(PoolInfo {
            layout: stage_layout(node.stage, &config.sensor),
            min_count: pool_config.min_count,
            max_count: pool_config.max_count,
            mode: pool_config.mode,
        })?;
        pool.alloc()?;
        pools.push(pool);
    }
    Ok(pools)
}

fn validate(config: &SessionConfig) -> Result<()> {
    if config.sensor.width == 0 || config.sensor.height == 0 || config.sensor.fps == 0 {
        return Err(Error::InvalidState("configured with an empty sensor mode"));
    }
    if config.capture.hold_count == 0 {
        return Err(Error::InvalidState("configured with an empty hold list"));
    }
    Ok(())
}

impl Session {
    /// Build the pipelines for `config` on top of `hardware`. Buffers are
    /// allocated and every hardware stage is opened; nothing streams yet.
    #[instrument(skip_all)]
    pub fn open(config: SessionConfig, hardware: HardwareSet) -> Result<Self> {
        validate(&config)?;

        let topology = Topology::select(&config.topology);
        let graph = topology.graph();
        let reprocessing = config.topology.reprocessing && topology.supports_reprocessing();
        if config.topology.reprocessing && !reprocessing {
            warn!(topology = graph.name(), "Topology cannot feed still capture");
        }
        let capture_graph = reprocessing.then(|| Topology::Reprocessing.graph());

        let mut graphs = vec![&graph];
        graphs.extend(capture_graph.as_ref());

        let pools = build_pools(&graphs, &config)?;
        let buffers = Arc::new(BufferManager::new(
            pools,
            AcquirePolicy::from(&config.pipeline),
        ));
        let frames = Arc::new(FrameManager::new(buffers.clone()));
        let ctx = PipelineContext::new(
            buffers.clone(),
            frames.clone(),
            config.pipeline.clone(),
            graph.entity_specs(),
        );
        let table = DispatchTable::build(&graphs, reprocessing);

        let name = graph.name();
        let mut preview = PipelineFactory::new(graph, ctx.clone(), &hardware)?;
        preview.create()?;
        preview.init_pipes()?;

        let reprocessing = match capture_graph {
            Some(graph) => {
                let mut factory = PipelineFactory::new(graph, ctx.clone(), &hardware)?;
                factory.create()?;
                factory.init_pipes()?;
                Some(factory)
            }
            None => None,
        };

        let selector = reprocessing.as_ref().map(|_| {
            Arc::new(CaptureSelector::new(
                frames.clone(),
                config.capture.hold_count,
                Duration::from_millis(config.capture.select_wait_ms),
            ))
        });

        info!(
            topology = name,
            reprocessing = reprocessing.is_some(),
            pools = buffers.pools().count(),
            "Session opened"
        );

        Ok(Self {
            host: Arc::new(HostBridge::new(buffers, config.recording.max_in_flight)),
            config,
            ctx,
            preview,
            reprocessing,
            selector,
            table,
            hardware,
            controls: ArcSwap::from_pointee(RuntimeControls::default()),
            capture_requests: Arc::new(FrameQueue::new("capture").with_capacity(CAPTURE_QUEUE_DEPTH)),
            threads: None,
            state: SessionState::Opened,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Route host events to `target`. Events are dropped while no target is
    /// set or the channel is full.
    pub fn set_output_target(&self, target: flume::Sender<HostEvent>) {
        self.host.set_target(Some(target));
    }

    pub fn clear_output_target(&self) {
        self.host.set_target(None);
    }

    #[instrument(skip(self))]
    pub fn start_preview(&mut self) -> Result<()> {
        match self.state {
            SessionState::Opened => {}
            SessionState::Previewing => return Err(Error::InvalidState("already previewing")),
            SessionState::Closed => return Err(Error::InvalidState("closed")),
        }
        if self.host.is_faulted() {
            return Err(Error::InvalidState("faulted"));
        }

        self.preview.prepare_pipes(self.config.pipeline.prepare_count)?;
        self.preview.start_pipes()?;
        if let Some(factory) = &mut self.reprocessing {
            factory.prepare_pipes(0)?;
            factory.start_pipes()?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut dispatcher = Dispatcher::new(self.table.clone(), self.ctx.clone(), self.host.clone())
            .with_routes(self.preview.inputs())
            .with_throttle(PreviewThrottle::new(
                self.config.sensor.fps,
                self.config.display.fps,
            ));

        let mut capture = None;
        if let (Some(factory), Some(selector)) = (&self.reprocessing, &self.selector) {
            dispatcher = dispatcher
                .with_routes(factory.inputs())
                .with_capture(selector.clone(), factory.graph().entity_specs());

            let hold = self
                .preview
                .graph()
                .hold_point()
                .ok_or(Error::InvalidState("missing a capture hold point"))?;
            let target = factory
                .input(StageId::ReprocessIsp)
                .ok_or(Error::MissingHardware(StageId::ReprocessIsp))?;
            selector.reset_cancel();
            capture = Some(CaptureWorker {
                requests: self.capture_requests.clone(),
                selector: selector.clone(),
                frames: self.ctx.frames.clone(),
                target: target.clone(),
                host: self.host.clone(),
                hold: HoldKey {
                    stage: hold,
                    is_src: true,
                },
                config: self.config.capture.clone(),
                stop: stop.clone(),
            });
        }

        let dispatch = dispatcher.spawn(stop.clone())?;
        let capture = capture.map(CaptureWorker::spawn).transpose()?;

        let (stop_tx, stop_rx) = flume::bounded(1);
        let stages = self
            .preview
            .health()
            .chain(self.reprocessing.iter().flat_map(|f| f.health()))
            .map(|(stage, health, hw)| (stage, health.clone(), hw.clone()))
            .collect();
        let monitor = HealthMonitor {
            stages,
            ctx: self.ctx.clone(),
            host: self.host.clone(),
            config: self.config.monitor.clone(),
            stop: stop_rx,
        }
        .spawn()?;

        self.threads = Some(Threads {
            stop,
            dispatch,
            capture,
            monitor: (stop_tx, monitor),
        });
        self.state = SessionState::Previewing;
        self.host.notify(Notification::PreviewStarted);
        info!("Preview started");
        Ok(())
    }

    /// Stop streaming and return every frame and buffer. The session can
    /// start again afterwards.
    #[instrument(skip(self))]
    pub fn stop_preview(&mut self) -> Result<()> {
        if self.state != SessionState::Previewing {
            return Err(Error::InvalidState("not previewing"));
        }

        if let Some(threads) = self.threads.take() {
            threads.stop.store(true, Ordering::Release);

            if let Some(selector) = &self.selector {
                selector.cancel_picture();
            }
            self.capture_requests.wake_up();
            if let Some(handle) = threads.capture {
                if handle.join().is_err() {
                    error!("Capture thread panicked");
                }
            }

            let (stop_tx, monitor) = threads.monitor;
            let _ = stop_tx.try_send(());
            if monitor.join().is_err() {
                error!("Health monitor panicked");
            }

            if let Some(factory) = &mut self.reprocessing {
                factory.stop_pipes()?;
            }
            self.preview.stop_pipes()?;

            self.ctx.done.wake_up();
            if threads.dispatch.join().is_err() {
                error!("Dispatcher panicked");
            }
        }

        // The dispatcher may have queued work after the workers stopped
        self.preview.release_inputs();
        if let Some(factory) = &self.reprocessing {
            factory.release_inputs();
        }
        self.ctx.done.release();
        self.capture_requests.release();
        if let Some(selector) = &self.selector {
            selector.clear_list();
        }
        let leaked = self.ctx.frames.reclaim_all();
        self.ctx.buffers.reset_all();

        self.host.set_recording(false);
        let canceled = self.host.cancel_pictures();
        if canceled > 0 {
            self.host.notify(Notification::CaptureFailed {
                reason: "preview stopped".into(),
            });
        }

        self.preview.init_pipes()?;
        if let Some(factory) = &mut self.reprocessing {
            factory.init_pipes()?;
        }
        self.state = SessionState::Opened;
        self.host.notify(Notification::PreviewStopped);
        info!(leaked, "Preview stopped");
        Ok(())
    }

    pub fn start_recording(&self) -> Result<()> {
        if self.state != SessionState::Previewing {
            return Err(Error::InvalidState("not previewing"));
        }
        self.host.set_recording(true);
        info!("Recording started");
        Ok(())
    }

    pub fn stop_recording(&self) {
        self.host.set_recording(false);
        info!("Recording stopped");
    }

    pub fn is_recording(&self) -> bool {
        self.host.is_recording()
    }

    /// The host is done with a recording frame. Returns false for a frame
    /// the session does not consider in flight.
    pub fn release_recording_frame(&self, frame_count: u64) -> bool {
        self.host.release_recording_frame(frame_count)
    }

    /// Capture `count` still pictures from frames taken at or after now.
    #[instrument(skip(self))]
    pub fn take_picture(&self, count: u32) -> Result<()> {
        if self.state != SessionState::Previewing {
            return Err(Error::InvalidState("not previewing"));
        }
        if self.host.is_faulted() {
            return Err(Error::InvalidState("faulted"));
        }
        let Some(selector) = &self.selector else {
            return Err(Error::InvalidState("opened without still capture"));
        };
        if count == 0 {
            return Ok(());
        }

        selector.reset_cancel();
        selector.set_trigger(self.ctx.frames.last_frame_count().max(1));
        selector.set_is_first_frame(true);
        self.host.add_pending_pictures(count);
        if self
            .capture_requests
            .push_process_q(CaptureRequest { count })
            .is_err()
        {
            for _ in 0..count {
                self.host.picture_failed("too many capture requests".into());
            }
            return Err(Error::QueueFull("capture"));
        }
        debug!(count, trigger = selector.trigger(), "Picture requested");
        Ok(())
    }

    /// Abandon outstanding captures. Frames already handed to reprocessing
    /// still complete.
    pub fn cancel_picture(&self) {
        if let Some(selector) = &self.selector {
            selector.cancel_picture();
        }
        self.capture_requests.release();
        let canceled = self.host.cancel_pictures();
        info!(canceled, "Picture canceled");
    }

    pub fn send_command(&self, command: Command) -> Result<()> {
        debug!(?command, "Command");
        match command {
            Command::FaceDetection(on) => {
                self.update_controls(|c| c.face_detection = on);
                self.apply_control(StageId::Scaler, controls::FACE_DETECTION, i64::from(on))
            }
            Command::StartZoom { level } => {
                self.update_controls(|c| {
                    c.zoom_level = level;
                    c.zooming = true;
                });
                self.apply_control(StageId::Scaler, controls::ZOOM, level)
            }
            Command::StopZoom => {
                self.update_controls(|c| c.zooming = false);
                Ok(())
            }
            Command::Orientation(degrees) => {
                self.update_controls(|c| c.orientation = degrees % 360);
                self.apply_control(StageId::Jpeg, controls::ORIENTATION, i64::from(degrees % 360))
            }
            Command::SkipFrames(count) => {
                self.ctx.skip_next(count);
                Ok(())
            }
        }
    }

    pub fn controls(&self) -> Arc<RuntimeControls> {
        self.controls.load_full()
    }

    fn update_controls(&self, f: impl Fn(&mut RuntimeControls)) {
        self.controls.rcu(|current| {
            let mut next = RuntimeControls::clone(current);
            f(&mut next);
            next
        });
    }

    /// Controls for stages this session does not run are only recorded.
    fn apply_control(&self, stage: StageId, id: u32, value: i64) -> Result<()> {
        match self.hardware.get(stage) {
            Ok(hw) => hw.set_control(id, value),
            Err(_) => {
                debug!(%stage, id, "No hardware for control");
                Ok(())
            }
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.host.is_faulted()
    }

    pub fn stats(&self) -> SessionStats {
        let mut queues = self.preview.queue_sizes();
        if let Some(factory) = &self.reprocessing {
            queues.extend(factory.queue_sizes());
        }
        SessionStats {
            topology: self.preview.graph().name(),
            state: self.state,
            frames_created: self.ctx.frames.last_frame_count(),
            frames_outstanding: self.ctx.frames.outstanding(),
            held_frames: self.selector.as_ref().map_or(0, |s| s.size_of_hold_frames()),
            hold_evicted: self.selector.as_ref().map_or(0, |s| s.evicted()),
            pools: self.ctx.buffers.stats(),
            queues,
            done_queue: self.ctx.done.get_size_of_process_q(),
            recording_in_flight: self.host.recording_in_flight(),
            delivered: self.host.counts(),
            faulted: self.host.is_faulted(),
        }
    }

    /// Human-readable pipeline state
    pub fn dump(&self) -> String {
        let mut out = format!("session {:?} topology {}\n", self.state, self.preview.graph().name());
        for (stage, size) in self.stats().queues {
            out.push_str(&format!("queue {stage}: {size}\n"));
        }
        if let Some(selector) = &self.selector {
            out.push_str(&format!("held frames: {}\n", selector.size_of_hold_frames()));
        }
        out.push_str(&self.ctx.dump());
        out
    }

    /// Stop streaming, close the hardware and free every buffer.
    #[instrument(skip(self))]
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if self.state == SessionState::Previewing {
            self.stop_preview()?;
        }
        if let Some(factory) = &mut self.reprocessing {
            factory.destroy()?;
        }
        self.preview.destroy()?;
        self.ctx.buffers.deinit_all();
        self.host.set_target(None);
        self.state = SessionState::Closed;
        info!("Session closed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close session");
        }
    }
}
