//! Events flowing to the host and the sink that produces them

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::buffer::BufferManager;
use crate::frame::FrameRef;
use crate::pipeline::{Consumer, DeliverySink};
use crate::stage::StageId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    PreviewStarted,
    PreviewStopped,
    /// Frame chosen for a still capture
    Shutter { frame_count: u64 },
    CaptureDone { frame_count: u64 },
    CaptureFailed { reason: String },
    /// Unrecoverable pipeline fault; the session must be closed
    Error { stage: Option<StageId>, reason: String },
}

#[derive(Debug, Clone)]
pub enum HostEvent {
    Notify(Notification),
    Data {
        kind: Consumer,
        frame_count: u64,
        payload: Bytes,
    },
    /// Recording frame; hand `frame_count` back through
    /// `Session::release_recording_frame` when done
    DataWithTimestamp {
        frame_count: u64,
        timestamp_ns: u64,
        payload: Bytes,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub preview: u64,
    pub pictures: u64,
    pub vision: u64,
    pub recording: u64,
    pub failed: u64,
    /// Events the host channel could not take
    pub dropped_events: u64,
}

#[derive(Default)]
struct Counters {
    preview: AtomicU64,
    pictures: AtomicU64,
    vision: AtomicU64,
    recording: AtomicU64,
    failed: AtomicU64,
    dropped_events: AtomicU64,
}

/// Copies finished outputs out of hardware buffers and sends them to the
/// host channel, if one is attached.
pub(crate) struct HostBridge {
    buffers: Arc<BufferManager>,
    target: ArcSwapOption<flume::Sender<HostEvent>>,
    recording: AtomicBool,
    recording_frames: Mutex<VecDeque<u64>>,
    max_recording: usize,
    pictures_pending: AtomicU32,
    faulted: AtomicBool,
    counters: CachePadded<Counters>,
}

impl HostBridge {
    pub(crate) fn new(buffers: Arc<BufferManager>, max_recording: usize) -> Self {
        Self {
            buffers,
            target: ArcSwapOption::empty(),
            recording: AtomicBool::new(false),
            recording_frames: Mutex::new(VecDeque::new()),
            max_recording: max_recording.max(1),
            pictures_pending: AtomicU32::new(0),
            faulted: AtomicBool::new(false),
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub(crate) fn set_target(&self, target: Option<flume::Sender<HostEvent>>) {
        self.target.store(target.map(Arc::new));
    }

    fn send(&self, event: HostEvent) -> bool {
        let Some(target) = self.target.load_full() else {
            return false;
        };
        match target.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                self.counters.dropped_events.fetch_add(1, Ordering::Relaxed);
                trace!(error = %e, "Host event dropped");
                false
            }
        }
    }

    pub(crate) fn notify(&self, notification: Notification) {
        debug!(?notification, "Notify host");
        self.send(HostEvent::Notify(notification));
    }

    pub(crate) fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Release);
        if !on {
            self.recording_frames.lock().clear();
        }
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub(crate) fn release_recording_frame(&self, frame_count: u64) -> bool {
        let mut frames = self.recording_frames.lock();
        match frames.iter().position(|c| *c == frame_count) {
            Some(i) => {
                frames.remove(i);
                true
            }
            None => false,
        }
    }

    pub(crate) fn recording_in_flight(&self) -> usize {
        self.recording_frames.lock().len()
    }

    fn record(&self, frame: &FrameRef, payload: Bytes) {
        let mut frames = self.recording_frames.lock();
        if frames.len() >= self.max_recording {
            metrics::counter!("camstage_recording_dropped").increment(1);
            debug!(frame = frame.count(), "Recording frame dropped, host holds too many");
            return;
        }
        frames.push_back(frame.count());
        drop(frames);

        let sent = self.send(HostEvent::DataWithTimestamp {
            frame_count: frame.count(),
            timestamp_ns: frame.timestamp(),
            payload,
        });
        if sent {
            self.counters.recording.fetch_add(1, Ordering::Relaxed);
        } else {
            self.release_recording_frame(frame.count());
        }
    }

    pub(crate) fn add_pending_pictures(&self, count: u32) {
        self.pictures_pending.fetch_add(count, Ordering::AcqRel);
    }

    /// Settle one outstanding picture. Returns false if none was pending.
    fn settle_picture(&self) -> bool {
        self.pictures_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn picture_failed(&self, reason: String) {
        if self.settle_picture() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.notify(Notification::CaptureFailed { reason });
        }
    }

    /// Forget every outstanding picture without notifying.
    pub(crate) fn cancel_pictures(&self) -> u32 {
        self.pictures_pending.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn pictures_pending(&self) -> u32 {
        self.pictures_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_faulted(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub(crate) fn counts(&self) -> DeliveryCounts {
        let c = &self.counters;
        DeliveryCounts {
            preview: c.preview.load(Ordering::Relaxed),
            pictures: c.pictures.load(Ordering::Relaxed),
            vision: c.vision.load(Ordering::Relaxed),
            recording: c.recording.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped_events: c.dropped_events.load(Ordering::Relaxed),
        }
    }
}

impl DeliverySink for HostBridge {
    fn deliver(&self, consumer: Consumer, stage: StageId, frame: &FrameRef) {
        let Some(payload) = frame
            .dst_buffer(stage)
            .and_then(|handle| self.buffers.copy_out(&handle))
        else {
            warn!(frame = frame.count(), %stage, "No output buffer to deliver");
            return;
        };

        let frame_count = frame.count();
        match consumer {
            Consumer::Preview => {
                self.counters.preview.fetch_add(1, Ordering::Relaxed);
                if self.is_recording() {
                    self.record(frame, payload.clone());
                }
                self.send(HostEvent::Data {
                    kind: consumer,
                    frame_count,
                    payload,
                });
            }
            Consumer::Picture => {
                self.counters.pictures.fetch_add(1, Ordering::Relaxed);
                self.settle_picture();
                self.send(HostEvent::Data {
                    kind: consumer,
                    frame_count,
                    payload,
                });
                self.notify(Notification::CaptureDone { frame_count });
            }
            Consumer::Vision => {
                self.counters.vision.fetch_add(1, Ordering::Relaxed);
                self.send(HostEvent::Data {
                    kind: consumer,
                    frame_count,
                    payload,
                });
            }
        }
    }

    fn failed(&self, consumer: Consumer, stage: StageId, frame: &FrameRef) {
        match consumer {
            Consumer::Picture => {
                self.picture_failed(format!("{stage} did not complete frame {}", frame.count()))
            }
            Consumer::Preview | Consumer::Vision => {
                trace!(frame = frame.count(), %stage, ?consumer, "Output skipped");
            }
        }
    }
}
