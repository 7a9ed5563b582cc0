//! Buffer pools and the per-session buffer manager

mod manager;
mod pool;

pub use manager::{AcquirePolicy, BufferManager};
pub use pool::{
    AllocationMode, BufferHandle, BufferMeta, BufferPool, BufferPosition, PlaneLayout, PoolInfo,
    PoolStats,
};

use crate::stage::StageId;
use crate::SensorConfig;

/// Stats plane size written by the 3A block per frame
const STATS_PLANE_SIZE: usize = 16 * 1024;

/// Plane layout each stage writes, derived from the sensor mode.
pub fn stage_layout(stage: StageId, sensor: &SensorConfig) -> PlaneLayout {
    let pixels = (sensor.width as usize * sensor.height as usize).max(2);
    match stage {
        // 16-bit packed bayer
        StageId::Sensor => PlaneLayout::new(vec![pixels * 2], true),
        StageId::Stats => PlaneLayout::new(vec![STATS_PLANE_SIZE], true),
        // NV12: luma + interleaved chroma
        StageId::Isp
        | StageId::Tpu
        | StageId::Fusion
        | StageId::Scaler
        | StageId::ReprocessIsp
        | StageId::ReprocessScaler => PlaneLayout::new(vec![pixels, pixels / 2], true),
        StageId::Jpeg => PlaneLayout::new(vec![pixels / 2], false),
    }
}
