//! Frames, their per-stage entities and the frame arena

mod entity;
#[allow(clippy::module_inception)]
mod frame;
mod manager;

pub use entity::{BufferState, EntityPlan, EntitySpec, EntityState};
pub use frame::{Frame, FrameKind, FrameRef};
pub use manager::FrameManager;
