//! Per-stage work record attached to a frame

use crate::buffer::BufferHandle;
use crate::error::{Error, Result};
use crate::stage::StageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Routed through this stage, not yet submitted
    Requested,
    /// Buffers bound, hardware owns the work
    Processing,
    Complete,
    Error,
    /// Stage will not run for this frame
    FrameSkip,
}

impl EntityState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntityState::Complete | EntityState::Error | EntityState::FrameSkip
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    NoRequest,
    Requested,
    Processing,
    Complete,
    Error,
}

/// Static routing facts for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySpec {
    pub stage: StageId,
    pub parent: Option<StageId>,
    /// Reads the parent's output buffer
    pub consumes_parent: bool,
    /// Writes into a buffer from its own pool
    pub needs_dst: bool,
}

/// What a caller must provide to set up an entity
#[derive(Debug, Clone, Copy)]
pub struct EntityPlan {
    pub state: EntityState,
    pub needs_dst: bool,
    pub consumes_parent: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferSlot {
    pub(crate) state: BufferState,
    pub(crate) handle: Option<BufferHandle>,
}

impl BufferSlot {
    const EMPTY: BufferSlot = BufferSlot {
        state: BufferState::NoRequest,
        handle: None,
    };
}

#[derive(Debug, Clone)]
pub(crate) struct Entity {
    pub(crate) spec: EntitySpec,
    pub(crate) state: EntityState,
    /// Aliases the parent's `dst`; never returned to a pool through this slot
    pub(crate) src: BufferSlot,
    /// Owned output buffer
    pub(crate) dst: BufferSlot,
}

impl Entity {
    pub(crate) fn new(spec: EntitySpec) -> Self {
        Self {
            spec,
            state: EntityState::Requested,
            src: BufferSlot::EMPTY,
            dst: if spec.needs_dst {
                BufferSlot {
                    state: BufferState::Requested,
                    handle: None,
                }
            } else {
                BufferSlot::EMPTY
            },
        }
    }

    pub(crate) fn stage(&self) -> StageId {
        self.spec.stage
    }

    pub(crate) fn plan(&self) -> EntityPlan {
        EntityPlan {
            state: self.state,
            needs_dst: self.spec.needs_dst,
            consumes_parent: self.spec.consumes_parent,
        }
    }

    /// Bind buffers and enter `Processing`. A `Complete` entity may be set up
    /// again (rework) once its previous output buffer has been returned.
    pub(crate) fn setup(
        &mut self,
        frame: u64,
        src: Option<BufferHandle>,
        dst: Option<BufferHandle>,
    ) -> Result<()> {
        match self.state {
            EntityState::Requested => {}
            EntityState::Complete if self.dst.handle.is_none() => {}
            from => {
                return Err(Error::InvalidTransition {
                    frame,
                    stage: self.stage(),
                    from,
                    to: EntityState::Processing,
                })
            }
        }

        if self.spec.needs_dst && dst.is_none() {
            return Err(Error::BufferNotReady {
                frame,
                stage: self.stage(),
                state: self.dst.state,
            });
        }
        if self.spec.consumes_parent && src.is_none() {
            return Err(Error::BufferNotReady {
                frame,
                stage: self.stage(),
                state: BufferState::NoRequest,
            });
        }

        if let Some(handle) = src {
            self.src = BufferSlot {
                state: BufferState::Processing,
                handle: Some(handle),
            };
        }
        if let Some(handle) = dst {
            self.dst = BufferSlot {
                state: BufferState::Processing,
                handle: Some(handle),
            };
        }
        self.state = EntityState::Processing;
        Ok(())
    }

    pub(crate) fn transition(&mut self, frame: u64, to: EntityState) -> Result<()> {
        let allowed = match (self.state, to) {
            (EntityState::Requested, EntityState::FrameSkip | EntityState::Error) => true,
            (EntityState::Processing, EntityState::Complete) => matches!(
                self.dst.state,
                BufferState::Complete | BufferState::NoRequest
            ),
            (EntityState::Processing, EntityState::Error | EntityState::FrameSkip) => true,
            _ => false,
        };

        if !allowed {
            return Err(Error::InvalidTransition {
                frame,
                stage: self.stage(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Record the hardware's verdict on this entity's buffers.
    pub(crate) fn signal_buffers(&mut self, frame: u64, ok: bool) -> Result<()> {
        if self.state != EntityState::Processing {
            return Err(Error::BufferNotReady {
                frame,
                stage: self.stage(),
                state: self.dst.state,
            });
        }

        let done = if ok {
            BufferState::Complete
        } else {
            BufferState::Error
        };
        for slot in [&mut self.src, &mut self.dst] {
            if slot.state == BufferState::Processing {
                slot.state = done;
            }
        }
        Ok(())
    }
}
