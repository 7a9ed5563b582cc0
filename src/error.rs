//! Error taxonomy for the orchestration engine

use thiserror::Error;

use crate::frame::{BufferState, EntityState};
use crate::pipeline::factory::PipeState;
use crate::stage::StageId;

#[derive(Debug, Error)]
pub enum Error {
    /// Transient backpressure: the pool had nothing to hand out
    #[error("no buffer available in {pool} pool")]
    BufferUnavailable { pool: StageId },

    #[error("unknown buffer pool: {0}")]
    UnknownPool(StageId),

    #[error("buffer pool {0} is not configured")]
    PoolNotConfigured(StageId),

    #[error("invalid buffer pool configuration for {pool}: {reason}")]
    InvalidPoolInfo { pool: StageId, reason: String },

    #[error("failed to allocate buffer {index} ({size} bytes) for {pool} pool")]
    Allocation {
        pool: StageId,
        index: usize,
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("frame {frame} has no entity for stage {stage}")]
    UnknownEntity { frame: u64, stage: StageId },

    #[error("frame {frame} stage {stage}: invalid entity transition {from:?} -> {to:?}")]
    InvalidTransition {
        frame: u64,
        stage: StageId,
        from: EntityState,
        to: EntityState,
    },

    #[error("frame {frame} stage {stage}: buffer not ready ({state:?})")]
    BufferNotReady {
        frame: u64,
        stage: StageId,
        state: BufferState,
    },

    #[error("frame {frame} stage {stage}: parent {parent} has not finished")]
    ParentPending {
        frame: u64,
        stage: StageId,
        parent: StageId,
    },

    #[error("frame {0} is not managed by this session")]
    UnknownFrame(u64),

    #[error("pipeline {op} called while {state:?}")]
    Lifecycle { op: &'static str, state: PipeState },

    #[error("queue {0} is full")]
    QueueFull(&'static str),

    #[error("hardware stage {stage} fault: {reason}")]
    Hardware { stage: StageId, reason: String },

    #[error("no hardware provided for stage {0}")]
    MissingHardware(StageId),

    #[error("session is {0}")]
    InvalidState(&'static str),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Backpressure errors are retried or degraded locally, never surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BufferUnavailable { .. } | Error::QueueFull(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
