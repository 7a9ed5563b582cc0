//! Hardware stage identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

/// One fixed hardware processing step of the image pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Sensor capture (bayer output)
    Sensor,
    /// Demosaic + 3A statistics
    Stats,
    /// ISP color pipeline
    Isp,
    /// Stabilization / temporal processing unit
    Tpu,
    /// Dual-camera fusion
    Fusion,
    /// Scaler, feeds display and recording
    Scaler,
    /// ISP pass over a held bayer buffer
    ReprocessIsp,
    /// Scaler pass for still capture
    ReprocessScaler,
    /// Compressed-capture output
    Jpeg,
}

impl StageId {
    pub const ALL: [StageId; 9] = [
        StageId::Sensor,
        StageId::Stats,
        StageId::Isp,
        StageId::Tpu,
        StageId::Fusion,
        StageId::Scaler,
        StageId::ReprocessIsp,
        StageId::ReprocessScaler,
        StageId::Jpeg,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Sensor => "sensor",
            StageId::Stats => "stats",
            StageId::Isp => "isp",
            StageId::Tpu => "tpu",
            StageId::Fusion => "fusion",
            StageId::Scaler => "scaler",
            StageId::ReprocessIsp => "reprocess_isp",
            StageId::ReprocessScaler => "reprocess_scaler",
            StageId::Jpeg => "jpeg",
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Stages that only run for still capture.
    pub fn is_reprocessing(self) -> bool {
        matches!(
            self,
            StageId::ReprocessIsp | StageId::ReprocessScaler | StageId::Jpeg
        )
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage is attached to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Memory-to-memory: the stage has its own queue and worker
    #[default]
    M2m,
    /// On-the-fly: fused with the parent, completes together with it
    Otf,
}

/// Compact set of stages, used for a frame's requested-stage mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageSet(u16);

impl StageSet {
    pub const EMPTY: StageSet = StageSet(0);

    pub fn insert(&mut self, stage: StageId) {
        self.0 |= stage.bit();
    }

    pub fn remove(&mut self, stage: StageId) {
        self.0 &= !stage.bit();
    }

    pub fn contains(&self, stage: StageId) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = StageId> + '_ {
        StageId::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl FromIterator<StageId> for StageSet {
    fn from_iter<I: IntoIterator<Item = StageId>>(iter: I) -> Self {
        let mut set = StageSet::EMPTY;
        for stage in iter {
            set.insert(stage);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_set() {
        let mut set: StageSet = [StageId::Sensor, StageId::Isp].into_iter().collect();
        assert!(set.contains(StageId::Sensor));
        assert!(!set.contains(StageId::Stats));
        assert_eq!(set.len(), 2);

        set.remove(StageId::Sensor);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![StageId::Isp]);
    }

    #[test]
    fn test_stage_names_are_unique() {
        let mut names: Vec<_> = StageId::ALL.iter().map(|s| s.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), StageId::ALL.len());
    }
}
