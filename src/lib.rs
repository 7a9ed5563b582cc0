pub mod buffer;
pub mod error;
pub mod frame;
pub mod hw;
pub mod pipeline;
pub mod session;
pub mod stage;
pub mod utils;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
pub use session::{Command, HostEvent, Notification, Session, SessionState, SessionStats};
pub use stage::{LinkMode, StageId};

use crate::buffer::AllocationMode;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sensor: SensorConfig,
    pub display: DisplayConfig,
    pub topology: TopologyConfig,
    pub buffers: BufferConfig,
    pub pipeline: PipelineConfig,
    pub capture: CaptureConfig,
    pub recording: RecordingConfig,
    pub monitor: MonitorConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub fps: u32,
    /// Bound of the host event channel
    pub event_queue: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub link: LinkMode,
    pub stabilization: bool,
    pub dual_camera: bool,
    pub high_speed: bool,
    pub vision_only: bool,
    /// Hold bayer frames and run the still-capture graph
    pub reprocessing: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_count: usize,
    pub max_count: usize,
    pub mode: AllocationMode,
}

impl PoolConfig {
    pub const fn fixed(count: usize) -> Self {
        Self {
            min_count: count,
            max_count: count,
            mode: AllocationMode::AtOnce,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Used for any stage without an entry in `pools`
    pub default_pool: PoolConfig,
    pub pools: BTreeMap<StageId, PoolConfig>,
}

impl BufferConfig {
    pub fn pool(&self, stage: StageId) -> PoolConfig {
        self.pools.get(&stage).copied().unwrap_or(self.default_pool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frames queued on the sensor before streaming starts
    pub prepare_count: usize,
    pub buffer_wait_ms: u64,
    pub buffer_retry_count: u32,
    /// Consecutive pool misses before backpressure is logged at warn
    pub backpressure_warn_threshold: u32,
    pub poll_interval_ms: u64,
    pub pin_stage_threads: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Frames kept in the hold list
    pub hold_count: usize,
    pub select_retry_budget: u32,
    pub select_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Recording frames the host may hold before new ones are dropped
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    /// Outstanding work without a completion for this long is a fault
    pub watchdog_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Per-job latency of non-sensor simulated stages
    pub stage_latency_us: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sensor: SensorConfig {
                width: 1920,
                height: 1080,
                fps: 30,
            },
            display: DisplayConfig {
                fps: 30,
                event_queue: 16,
            },
            topology: TopologyConfig::default(),
            buffers: BufferConfig::default(),
            pipeline: PipelineConfig {
                prepare_count: 4,
                buffer_wait_ms: 10,
                buffer_retry_count: 3,
                backpressure_warn_threshold: 8,
                poll_interval_ms: 2,
                pin_stage_threads: false,
            },
            capture: CaptureConfig {
                hold_count: 1,
                select_retry_budget: 20,
                select_wait_ms: 100,
            },
            recording: RecordingConfig { max_in_flight: 8 },
            monitor: MonitorConfig {
                interval_ms: 500,
                watchdog_ms: 2000,
            },
            simulation: SimulationConfig {
                stage_latency_us: 4000,
            },
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        let pools = [
            (StageId::Sensor, PoolConfig::fixed(8)),
            (StageId::Scaler, PoolConfig::fixed(6)),
            (StageId::Jpeg, PoolConfig::fixed(2)),
            (
                StageId::ReprocessIsp,
                PoolConfig {
                    min_count: 1,
                    max_count: 2,
                    mode: AllocationMode::OnDemand,
                },
            ),
        ];
        Self {
            default_pool: PoolConfig::fixed(4),
            pools: pools.into_iter().collect(),
        }
    }
}
