use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use camstage::buffer::{
    AcquirePolicy, AllocationMode, BufferManager, BufferPool, PlaneLayout, PoolInfo,
};
use camstage::frame::{EntityState, FrameKind, FrameManager, FrameRef};
use camstage::hw::{controls, FaultPlan, HardwareSet, SimulatedStage};
use camstage::pipeline::{
    Consumer, DeliverySink, DispatchTable, Dispatcher, FrameQueue, PipeState, PipelineContext,
    PipelineFactory, PopError, StageGraph,
};
use camstage::{Command, HostEvent, Notification, Session, SessionConfig, StageId};

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("camstage=debug")
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<u64>>,
    /// Frame count, failed stage and that stage's entity state when reported
    failed: Mutex<Vec<(u64, StageId, EntityState)>>,
}

impl DeliverySink for RecordingSink {
    fn deliver(&self, _consumer: Consumer, _stage: StageId, frame: &FrameRef) {
        self.delivered.lock().push(frame.count());
    }

    fn failed(&self, _consumer: Consumer, stage: StageId, frame: &FrameRef) {
        if let Ok(state) = frame.entity_state(stage) {
            self.failed.lock().push((frame.count(), stage, state));
        }
    }
}

/// Sensor -> Isp -> Scaler driven by simulated hardware, without a session
struct Harness {
    ctx: Arc<PipelineContext>,
    factory: PipelineFactory,
    sink: Arc<RecordingSink>,
    stop: Arc<AtomicBool>,
    dispatch: Option<JoinHandle<()>>,
}

const STAGES: [StageId; 3] = [StageId::Sensor, StageId::Isp, StageId::Scaler];

fn harness(pool_counts: [usize; 3], latencies_ms: [u64; 3], prepare: usize, skip: u32) -> Harness {
    init_logs();
    let mut graph = StageGraph::linear("test", &STAGES);
    graph.node_mut(StageId::Scaler).unwrap().deliver = Some(Consumer::Preview);

    let pools = STAGES.iter().zip(pool_counts).map(|(stage, count)| {
        let pool = BufferPool::new(*stage);
        pool.set_info(PoolInfo {
            layout: PlaneLayout::new(vec![4096], true),
            min_count: count,
            max_count: count,
            mode: AllocationMode::AtOnce,
        })
        .unwrap();
        pool.alloc().unwrap();
        pool
    });
    let buffers = Arc::new(BufferManager::new(pools, AcquirePolicy::default()));
    let frames = Arc::new(FrameManager::new(buffers.clone()));
    let ctx = PipelineContext::new(
        buffers,
        frames,
        SessionConfig::default().pipeline,
        graph.entity_specs(),
    );
    ctx.skip_next(skip);

    let mut hardware = HardwareSet::new();
    for (stage, latency) in STAGES.iter().zip(latencies_ms) {
        hardware.insert(Arc::new(SimulatedStage::new(
            *stage,
            Duration::from_millis(latency),
        )));
    }

    let table = DispatchTable::build(&[&graph], false);
    let mut factory = PipelineFactory::new(graph, ctx.clone(), &hardware).unwrap();
    factory.create().unwrap();
    factory.init_pipes().unwrap();
    factory.prepare_pipes(prepare).unwrap();
    factory.start_pipes().unwrap();

    let sink = Arc::new(RecordingSink::default());
    let stop = Arc::new(AtomicBool::new(false));
    let dispatch = Dispatcher::new(table, ctx.clone(), sink.clone())
        .with_routes(factory.inputs())
        .spawn(stop.clone())
        .unwrap();

    Harness {
        ctx,
        factory,
        sink,
        stop,
        dispatch: Some(dispatch),
    }
}

impl Harness {
    fn wait_delivered(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.sink.delivered.lock().len() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn shutdown(&mut self) {
        self.factory.stop_pipes().unwrap();
        self.stop.store(true, Ordering::Release);
        self.ctx.done.wake_up();
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.join().unwrap();
        }
        self.factory.release_inputs();
        self.ctx.done.release();
        self.ctx.frames.reclaim_all();
    }

    /// State of `stage` on every live frame, by frame count
    fn sample(&self, stage: StageId) -> Vec<(u64, EntityState)> {
        let frames = &self.ctx.frames;
        (1..=frames.last_frame_count())
            .filter_map(|count| frames.get(count))
            .filter_map(|frame| frame.entity_state(stage).ok().map(|s| (frame.count(), s)))
            .collect()
    }

    fn assert_pools_whole(&self) {
        for stats in self.ctx.buffers.stats() {
            assert_eq!(stats.checked_out, 0, "{} pool leaked a buffer", stats.pool);
            assert_eq!(stats.available, stats.allocated, "{} pool", stats.pool);
        }
    }
}

#[test]
fn test_streams_in_frame_order() {
    let mut h = harness([4, 4, 2], [10, 4, 4], 4, 0);
    assert_eq!(h.factory.state(), PipeState::Streaming);
    assert!(h.wait_delivered(10, Duration::from_secs(5)));
    h.shutdown();

    let delivered = h.sink.delivered.lock().clone();
    assert!(delivered.windows(2).all(|w| w[0] < w[1]), "{delivered:?}");
    assert_eq!(h.factory.state(), PipeState::Stopped);
    h.assert_pools_whole();
    assert_eq!(h.ctx.frames.outstanding(), 0);
}

#[test]
fn test_startup_respects_pool_depths() {
    let mut h = harness([4, 4, 2], [20, 2, 15], 4, 0);

    let mut sensor_processing = [false; 4];
    let mut scaler_peak = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        for (count, state) in h.sample(StageId::Sensor) {
            if count <= 4 && state == EntityState::Processing {
                sensor_processing[count as usize - 1] = true;
            }
        }
        let scaler = h
            .sample(StageId::Scaler)
            .into_iter()
            .filter(|(_, state)| *state == EntityState::Processing)
            .count();
        assert!(scaler <= 2, "{scaler} scaler entities processing at once");
        scaler_peak = scaler_peak.max(scaler);

        if sensor_processing.iter().all(|seen| *seen) && h.sink.delivered.lock().len() >= 6 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    h.shutdown();

    assert_eq!(sensor_processing, [true; 4]);
    assert!(scaler_peak >= 1);
    h.assert_pools_whole();
}

#[test]
fn test_exhausted_pool_skips_stage_and_frame_completes() {
    // One scaler buffer held for 150ms: frames arriving meanwhile cannot get one
    let mut h = harness([4, 8, 1], [5, 2, 150], 0, 0);
    let scaler_failure = |h: &Harness| {
        h.sink
            .failed
            .lock()
            .iter()
            .find(|(_, stage, _)| *stage == StageId::Scaler)
            .copied()
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while scaler_failure(&h).is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    let (skipped, _, state) = scaler_failure(&h).expect("no scaler entity was skipped");
    assert_eq!(state, EntityState::FrameSkip);

    // The frame still completes and leaves the arena
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.ctx.frames.contains(skipped) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(!h.ctx.frames.contains(skipped));
    assert!(!h.sink.delivered.lock().contains(&skipped));

    h.shutdown();
    h.assert_pools_whole();
    assert_eq!(h.ctx.frames.outstanding(), 0);
}

#[test]
fn test_lifecycle_rejects_out_of_order_calls() {
    let mut h = harness([4, 4, 2], [10, 4, 4], 0, 0);
    assert!(h.factory.init_pipes().is_err());
    assert!(h.factory.prepare_pipes(1).is_err());
    h.shutdown();

    // A stopped factory can be brought back up
    h.factory.init_pipes().unwrap();
    h.factory.prepare_pipes(0).unwrap();
    assert_eq!(h.factory.state(), PipeState::Prepared);
    h.factory.destroy().unwrap();
    assert_eq!(h.factory.state(), PipeState::Destroyed);
}

#[test]
fn test_stop_mid_flight_returns_every_buffer() {
    // Slow downstream stages keep several frames in flight at once
    let mut h = harness([4, 4, 2], [5, 40, 40], 4, 0);
    std::thread::sleep(Duration::from_millis(60));
    h.shutdown();

    h.assert_pools_whole();
    assert_eq!(h.ctx.frames.outstanding(), 0);
    assert_eq!(h.ctx.done.get_size_of_process_q(), 0);
}

#[test]
fn test_skipped_frames_never_reach_output() {
    let mut h = harness([4, 4, 2], [5, 2, 2], 0, 3);
    assert!(h.wait_delivered(3, Duration::from_secs(5)));
    h.shutdown();

    let delivered = h.sink.delivered.lock().clone();
    assert!(delivered.iter().all(|count| *count > 3), "{delivered:?}");
    h.assert_pools_whole();
}

#[test]
fn test_queue_order_and_release() {
    let buffers = Arc::new(BufferManager::new(
        Vec::<BufferPool>::new(),
        AcquirePolicy::default(),
    ));
    let frames = Arc::new(FrameManager::new(buffers));
    let released = Arc::new(Mutex::new(Vec::new()));

    let queue = {
        let released = released.clone();
        FrameQueue::new("test").with_release_hook(move |frame: FrameRef| {
            released.lock().push(frame.count());
        })
    };
    for _ in 0..4 {
        queue
            .push_process_q(frames.create_frame(FrameKind::Preview, &[]))
            .unwrap();
    }

    let first = queue.wait_and_pop_process_q(Some(Duration::ZERO)).unwrap();
    assert_eq!(first.count(), 1);
    assert!(!first.is_enqueued());

    assert_eq!(queue.release(), 3);
    assert_eq!(*released.lock(), vec![2, 3, 4]);
    assert!(queue.is_empty());
    assert_eq!(
        queue.wait_and_pop_process_q(Some(Duration::from_millis(1))).err(),
        Some(PopError::TimedOut)
    );
}

fn small_config() -> SessionConfig {
    init_logs();
    let mut config = SessionConfig::default();
    config.sensor.width = 64;
    config.sensor.height = 48;
    config.sensor.fps = 60;
    config.display.fps = 60;
    config.simulation.stage_latency_us = 1000;
    config.monitor.interval_ms = 20;
    config
}

/// Drain events until `f` picks one out or the timeout passes.
fn wait_for<T>(
    rx: &flume::Receiver<HostEvent>,
    timeout: Duration,
    mut f: impl FnMut(&HostEvent) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(event) => {
                if let Some(found) = f(&event) {
                    return Some(found);
                }
            }
            Err(_) => return None,
        }
    }
    None
}

#[test]
fn test_session_preview_payload_is_the_frame() {
    let config = small_config();
    let hardware = HardwareSet::simulated(&config);
    let (tx, rx) = flume::bounded(256);
    let mut session = Session::open(config, hardware).unwrap();
    session.set_output_target(tx);
    session.start_preview().unwrap();

    let preview = wait_for(&rx, Duration::from_secs(5), |event| match event {
        HostEvent::Data {
            kind: Consumer::Preview,
            frame_count,
            payload,
        } => Some((*frame_count, payload.clone())),
        _ => None,
    });
    let (frame_count, payload) = preview.expect("no preview frame");
    assert_eq!(payload[..8], frame_count.to_le_bytes());

    session.stop_preview().unwrap();
    let stats = session.stats();
    assert!(stats.delivered.preview > 0);
    assert_eq!(stats.frames_outstanding, 0);
    assert!(stats.pools.iter().all(|p| p.checked_out == 0));
    session.close().unwrap();
}

#[test]
fn test_session_take_picture() {
    let mut config = small_config();
    config.topology.reprocessing = true;
    config.capture.hold_count = 2;
    let hardware = HardwareSet::simulated(&config);
    let (tx, rx) = flume::bounded(256);
    let mut session = Session::open(config, hardware).unwrap();
    session.set_output_target(tx);
    session.start_preview().unwrap();

    // Let the hold list fill
    assert!(wait_for(&rx, Duration::from_secs(5), |event| match event {
        HostEvent::Data {
            kind: Consumer::Preview,
            frame_count,
            ..
        } if *frame_count > 4 => Some(()),
        _ => None,
    })
    .is_some());

    session.take_picture(1).unwrap();
    let mut shutter = None;
    let mut picture = None;
    let done = wait_for(&rx, Duration::from_secs(5), |event| match event {
        HostEvent::Notify(Notification::Shutter { frame_count }) => {
            shutter = Some(*frame_count);
            None
        }
        HostEvent::Data {
            kind: Consumer::Picture,
            frame_count,
            payload,
        } => {
            picture = Some((*frame_count, payload.clone()));
            None
        }
        HostEvent::Notify(Notification::CaptureDone { frame_count }) => Some(*frame_count),
        HostEvent::Notify(Notification::CaptureFailed { reason }) => panic!("capture failed: {reason}"),
        _ => None,
    })
    .expect("no capture completion");

    let (picture_count, payload) = picture.expect("no picture data");
    assert_eq!(picture_count, done);
    assert_eq!(shutter, Some(done));
    assert_eq!(payload[..8], done.to_le_bytes());

    session.stop_preview().unwrap();
    let stats = session.stats();
    assert_eq!(stats.delivered.pictures, 1);
    assert_eq!(stats.held_frames, 0);
    assert_eq!(stats.frames_outstanding, 0);
    assert!(stats.pools.iter().all(|p| p.checked_out == 0));
}

#[test]
fn test_session_restarts_after_stop() {
    let config = small_config();
    let hardware = HardwareSet::simulated(&config);
    let (tx, rx) = flume::bounded(256);
    let mut session = Session::open(config, hardware).unwrap();
    session.set_output_target(tx);

    for _ in 0..2 {
        session.start_preview().unwrap();
        assert!(session.start_preview().is_err());
        assert!(wait_for(&rx, Duration::from_secs(5), |event| matches!(
            event,
            HostEvent::Data { .. }
        )
        .then_some(()))
        .is_some());
        session.stop_preview().unwrap();
    }
    assert!(session.stop_preview().is_err());
    session.close().unwrap();
    assert!(session.start_preview().is_err());
}

#[test]
fn test_take_picture_requires_still_capture() {
    let config = small_config();
    let hardware = HardwareSet::simulated(&config);
    let mut session = Session::open(config, hardware).unwrap();
    assert!(session.take_picture(1).is_err());
    session.start_preview().unwrap();
    assert!(session.take_picture(1).is_err());
    session.close().unwrap();
}

#[test]
fn test_commands_reach_hardware() {
    let config = small_config();
    let scaler = Arc::new(SimulatedStage::new(StageId::Scaler, Duration::from_millis(1)));
    let mut hardware = HardwareSet::simulated(&config);
    hardware.insert(scaler.clone());

    let session = Session::open(config, hardware).unwrap();
    session.send_command(Command::FaceDetection(true)).unwrap();
    session
        .send_command(Command::StartZoom { level: 3 })
        .unwrap();
    session.send_command(Command::StopZoom).unwrap();
    // No still-capture hardware in this session: only recorded
    session.send_command(Command::Orientation(450)).unwrap();

    assert_eq!(scaler.control(controls::FACE_DETECTION), Some(1));
    assert_eq!(scaler.control(controls::ZOOM), Some(3));
    let current = session.controls();
    assert!(current.face_detection);
    assert!(!current.zooming);
    assert_eq!(current.zoom_level, 3);
    assert_eq!(current.orientation, 90);
}

#[test]
fn test_recording_frames_are_bounded() {
    let mut config = small_config();
    config.recording.max_in_flight = 2;
    let hardware = HardwareSet::simulated(&config);
    let (tx, rx) = flume::bounded(256);
    let mut session = Session::open(config, hardware).unwrap();
    session.set_output_target(tx);

    assert!(session.start_recording().is_err());
    session.start_preview().unwrap();
    session.start_recording().unwrap();

    let mut recorded = Vec::new();
    wait_for(&rx, Duration::from_secs(5), |event| {
        if let HostEvent::DataWithTimestamp { frame_count, .. } = event {
            recorded.push(*frame_count);
        }
        // Keep going until the bound has clearly been hit
        (recorded.len() >= 2 && session.stats().delivered.preview > 8).then_some(())
    })
    .expect("no recording frames");

    assert!(session.stats().recording_in_flight <= 2);
    assert!(session.release_recording_frame(recorded[0]));
    assert!(!session.release_recording_frame(recorded[0]));

    session.stop_recording();
    assert_eq!(session.stats().recording_in_flight, 0);
    session.stop_preview().unwrap();
}

#[test]
fn test_hardware_fault_is_reported() {
    let config = small_config();
    let mut hardware = HardwareSet::simulated(&config);
    hardware.insert(Arc::new(
        SimulatedStage::new(StageId::Isp, Duration::from_millis(1)).with_faults(FaultPlan {
            fault_after: Some(3),
            ..FaultPlan::default()
        }),
    ));
    let (tx, rx) = flume::bounded(256);
    let mut session = Session::open(config, hardware).unwrap();
    session.set_output_target(tx);
    session.start_preview().unwrap();

    let stage = wait_for(&rx, Duration::from_secs(5), |event| match event {
        HostEvent::Notify(Notification::Error { stage, .. }) => Some(*stage),
        _ => None,
    })
    .expect("fault not reported");
    assert_eq!(stage, Some(StageId::Isp));
    assert!(session.is_faulted());

    session.stop_preview().unwrap();
    assert!(session.start_preview().is_err());
    session.close().unwrap();
}

#[test]
fn test_stalled_stage_is_reported() {
    let mut config = small_config();
    config.monitor.watchdog_ms = 100;
    let mut hardware = HardwareSet::simulated(&config);
    // Never completes within the watchdog window
    hardware.insert(Arc::new(SimulatedStage::new(
        StageId::Isp,
        Duration::from_secs(2),
    )));
    let (tx, rx) = flume::bounded(256);
    let mut session = Session::open(config, hardware).unwrap();
    session.set_output_target(tx);
    session.start_preview().unwrap();

    let (stage, reason) = wait_for(&rx, Duration::from_secs(5), |event| match event {
        HostEvent::Notify(Notification::Error { stage, reason }) => Some((*stage, reason.clone())),
        _ => None,
    })
    .expect("stall not reported");
    assert_eq!(stage, Some(StageId::Isp));
    assert!(reason.contains("no completion"), "{reason}");
    assert!(session.is_faulted());

    session.stop_preview().unwrap();
    assert!(session.stats().pools.iter().all(|p| p.checked_out == 0));
    session.close().unwrap();
}
