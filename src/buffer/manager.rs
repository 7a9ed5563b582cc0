//! Registry of per-stage buffer pools

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::pool::{BufferHandle, BufferPool, BufferPosition, PoolStats};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::stage::StageId;
use crate::PipelineConfig;

/// How long `acquire` keeps trying before reporting backpressure
#[derive(Debug, Clone, Copy)]
pub struct AcquirePolicy {
    pub wait: Duration,
    pub retries: u32,
    /// Consecutive misses after which a pool is reported at warn level
    pub warn_threshold: u32,
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(10),
            retries: 3,
            warn_threshold: 8,
        }
    }
}

impl From<&PipelineConfig> for AcquirePolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            wait: Duration::from_millis(config.buffer_wait_ms),
            retries: config.buffer_retry_count,
            warn_threshold: config.backpressure_warn_threshold,
        }
    }
}

pub struct BufferManager {
    pools: HashMap<StageId, Arc<BufferPool>>,
    policy: AcquirePolicy,
}

impl BufferManager {
    pub fn new(pools: impl IntoIterator<Item = BufferPool>, policy: AcquirePolicy) -> Self {
        let pools = pools
            .into_iter()
            .map(|pool| (pool.id(), Arc::new(pool)))
            .collect();
        Self { pools, policy }
    }

    pub fn pool(&self, stage: StageId) -> Result<&Arc<BufferPool>> {
        self.pools.get(&stage).ok_or(Error::UnknownPool(stage))
    }

    pub fn has_pool(&self, stage: StageId) -> bool {
        self.pools.contains_key(&stage)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<BufferPool>> {
        self.pools.values()
    }

    /// Take a buffer from `stage`'s pool, waiting a bounded number of times.
    pub fn acquire(&self, stage: StageId, position: BufferPosition) -> Result<BufferHandle> {
        let pool = self.pool(stage)?;

        for attempt in 0..=self.policy.retries {
            match pool.get_buffer(position) {
                Ok((_, handle)) => return Ok(handle),
                Err(Error::BufferUnavailable { .. }) if attempt < self.policy.retries => {
                    pool.wait_for_buffer(self.policy.wait);
                }
                Err(Error::BufferUnavailable { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        let misses = pool.misses();
        if misses >= self.policy.warn_threshold {
            warn!(pool = %stage, misses, "Buffer pool exhausted");
        } else {
            debug!(pool = %stage, misses, "Buffer pool empty");
        }
        metrics::counter!("camstage_buffer_unavailable", "pool" => stage.as_str()).increment(1);

        Err(Error::BufferUnavailable { pool: stage })
    }

    /// Return a buffer to its pool.
    pub fn release(&self, handle: &BufferHandle) -> bool {
        match self.pools.get(&handle.pool) {
            Some(pool) => pool.put_handle(handle),
            None => {
                warn!(pool = %handle.pool, index = handle.index, "Release to unknown pool");
                false
            }
        }
    }

    /// Record where a checked-out buffer now sits.
    pub fn set_position(&self, handle: &BufferHandle, position: BufferPosition) {
        if let Some(pool) = self.pools.get(&handle.pool) {
            pool.set_position(handle.index, position);
        }
    }

    /// Bind buffers to `frame`'s entity for `stage` and mark it processing.
    ///
    /// An explicit `src` or `dst` is used as given. Otherwise the input aliases
    /// the parent's output and the output is taken from `stage`'s own pool.
    #[instrument(level = "trace", skip(self, frame), fields(frame = frame.count()))]
    pub fn setup_entity(
        &self,
        stage: StageId,
        frame: &Frame,
        src: Option<BufferHandle>,
        dst: Option<BufferHandle>,
    ) -> Result<()> {
        let plan = frame.entity_plan(stage)?;

        let mut acquired = None;
        let dst = match dst {
            Some(handle) => Some(handle),
            None if plan.needs_dst => {
                let handle = self.acquire(stage, BufferPosition::InDriver)?;
                acquired = Some(handle);
                Some(handle)
            }
            None => None,
        };

        if let Err(e) = frame.setup_entity(stage, src, dst) {
            if let Some(handle) = acquired {
                self.release(&handle);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn copy_out(&self, handle: &BufferHandle) -> Option<Bytes> {
        self.pools.get(&handle.pool)?.copy_out(handle.index)
    }

    pub fn reset_all(&self) {
        for pool in self.pools.values() {
            pool.reset_buffers();
        }
    }

    pub fn deinit_all(&self) {
        for pool in self.pools.values() {
            pool.deinit();
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.values().map(|p| p.stats()).collect();
        stats.sort_by_key(|s| s.pool);
        stats
    }
}
