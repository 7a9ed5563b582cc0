//! Boundary to the hardware blocks that execute stages

mod simulated;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use simulated::{FaultPlan, SimulatedStage};

use crate::buffer::{BufferHandle, BufferManager};
use crate::error::{Error, Result};
use crate::pipeline::Topology;
use crate::stage::StageId;
use crate::SessionConfig;

/// Control identifiers understood by hardware stages
pub mod controls {
    pub const FACE_DETECTION: u32 = 0x01;
    pub const ZOOM: u32 = 0x02;
    pub const ORIENTATION: u32 = 0x03;
}

/// One unit of work for a hardware block
#[derive(Debug, Clone)]
pub struct StageJob {
    pub frame_count: u64,
    pub stage: StageId,
    pub src: Option<BufferHandle>,
    /// Output buffers of the head and every fused stage
    pub dst: Vec<(StageId, BufferHandle)>,
}

/// Result of a job, dequeued in submission order
#[derive(Debug, Clone, Copy)]
pub struct StageDone {
    pub frame_count: u64,
    pub ok: bool,
    pub timestamp_ns: u64,
}

/// A hardware block the pipeline drives. Calls come from the stage's own
/// worker thread, except `fault`, which the health monitor polls.
pub trait HardwareStage: Send + Sync {
    fn stage(&self) -> StageId;

    /// Open the device and map the pools it writes into.
    fn create(&self, buffers: Arc<BufferManager>) -> Result<()>;

    fn destroy(&self) -> Result<()>;

    fn set_control(&self, id: u32, value: i64) -> Result<()>;

    fn queue_buffer(&self, job: StageJob) -> Result<()>;

    /// Wait up to `timeout` for the next finished job.
    fn dequeue_buffer(&self, timeout: Duration) -> Result<Option<StageDone>>;

    /// Cancel queued work, returning the jobs that never ran.
    fn flush(&self) -> Vec<StageJob>;

    /// Unrecoverable device error, if one occurred
    fn fault(&self) -> Option<String> {
        None
    }
}

/// Hardware blocks available to a session, keyed by the stage they run
#[derive(Clone, Default)]
pub struct HardwareSet {
    stages: HashMap<StageId, Arc<dyn HardwareStage>>,
}

impl HardwareSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hw: Arc<dyn HardwareStage>) {
        self.stages.insert(hw.stage(), hw);
    }

    pub fn with(mut self, hw: Arc<dyn HardwareStage>) -> Self {
        self.insert(hw);
        self
    }

    pub fn get(&self, stage: StageId) -> Result<Arc<dyn HardwareStage>> {
        self.stages
            .get(&stage)
            .cloned()
            .ok_or(Error::MissingHardware(stage))
    }

    /// Simulated blocks for every worker a session with `config` runs. The
    /// sensor paces itself at the configured frame rate.
    pub fn simulated(config: &SessionConfig) -> Self {
        let frame_interval = Duration::from_secs_f64(1.0 / f64::from(config.sensor.fps.max(1)));
        let stage_latency = Duration::from_micros(config.simulation.stage_latency_us);

        let topology = Topology::select(&config.topology);
        let mut graphs = vec![topology.graph()];
        if config.topology.reprocessing && topology.supports_reprocessing() {
            graphs.push(Topology::Reprocessing.graph());
        }

        let mut set = HardwareSet::new();
        for graph in &graphs {
            for node in graph.heads() {
                let latency = if node.parent.is_none() {
                    frame_interval
                } else {
                    stage_latency
                };
                set.insert(Arc::new(SimulatedStage::new(node.stage, latency)));
            }
        }
        set
    }
}
