//! Builds a stage graph into running worker threads and tears it down

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, instrument, warn};

use super::queue::FrameQueue;
use super::topology::StageGraph;
use super::worker::{StageHealth, StageInput, StageWorker};
use super::PipelineContext;
use crate::error::{Error, Result};
use crate::frame::FrameKind;
use crate::hw::{HardwareSet, HardwareStage};
use crate::stage::StageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Uninitialized,
    Created,
    Initialized,
    Prepared,
    Streaming,
    Stopped,
    Destroyed,
}

struct Pipe {
    head: StageId,
    group: Vec<StageId>,
    generator: bool,
    hw: Arc<dyn HardwareStage>,
    input: Arc<FrameQueue<StageInput>>,
    health: Arc<StageHealth>,
}

/// Owns one worker group per memory-to-memory stage of a graph.
///
/// Lifecycle: `create` -> `init_pipes` -> `prepare_pipes` -> `start_pipes`
/// -> `stop_pipes` -> (`init_pipes` ...) -> `destroy`. Calls out of order
/// fail with [`Error::Lifecycle`].
pub struct PipelineFactory {
    graph: StageGraph,
    ctx: Arc<PipelineContext>,
    pipes: Vec<Pipe>,
    workers: Vec<(StageId, JoinHandle<()>)>,
    stop: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    state: PipeState,
}

impl PipelineFactory {
    pub fn new(graph: StageGraph, ctx: Arc<PipelineContext>, hardware: &HardwareSet) -> Result<Self> {
        let pipes = graph
            .heads()
            .map(|node| {
                let frames = ctx.frames.clone();
                let input = FrameQueue::new(node.stage.as_str()).with_release_hook(
                    move |input: StageInput| {
                        let StageInput::Frame(frame) = input;
                        if let Err(e) = frames.abort(&frame) {
                            warn!(frame = frame.count(), error = %e, "Abort on release failed");
                        }
                    },
                );
                input.set_wait_time(Some(ctx.poll_interval()));
                Ok(Pipe {
                    head: node.stage,
                    group: graph.group(node.stage),
                    generator: node.parent.is_none(),
                    hw: hardware.get(node.stage)?,
                    input: Arc::new(input),
                    health: Arc::new(StageHealth::default()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            graph,
            ctx,
            pipes,
            workers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            state: PipeState::Uninitialized,
        })
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    fn require_state(&self, op: &'static str, allowed: &[PipeState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::Lifecycle {
                op,
                state: self.state,
            })
        }
    }

    /// Open every hardware stage.
    #[instrument(skip(self), fields(graph = self.graph.name()))]
    pub fn create(&mut self) -> Result<()> {
        self.require_state("create", &[PipeState::Uninitialized, PipeState::Destroyed])?;
        for pipe in &self.pipes {
            pipe.hw.create(self.ctx.buffers.clone())?;
        }
        self.state = PipeState::Created;
        debug!(pipes = self.pipes.len(), "Pipes created");
        Ok(())
    }

    pub fn init_pipes(&mut self) -> Result<()> {
        self.require_state("init_pipes", &[PipeState::Created, PipeState::Stopped])?;
        self.stop.store(false, Ordering::Release);
        self.draining.store(false, Ordering::Release);
        self.state = PipeState::Initialized;
        Ok(())
    }

    /// Queue `prepare_count` frames on every generator so streaming starts
    /// with the hardware queues primed.
    pub fn prepare_pipes(&mut self, prepare_count: usize) -> Result<()> {
        self.require_state("prepare_pipes", &[PipeState::Initialized])?;
        for pipe in self.pipes.iter().filter(|p| p.generator) {
            for _ in 0..prepare_count {
                let frame = self
                    .ctx
                    .frames
                    .create_frame(FrameKind::Internal, self.ctx.frame_specs());
                if let Err(StageInput::Frame(frame)) =
                    pipe.input.push_process_q(StageInput::Frame(frame))
                {
                    self.ctx.frames.abort(&frame)?;
                }
            }
        }
        self.state = PipeState::Prepared;
        Ok(())
    }

    /// Spawn one worker thread per pipe.
    #[instrument(skip(self), fields(graph = self.graph.name()))]
    pub fn start_pipes(&mut self) -> Result<()> {
        self.require_state("start_pipes", &[PipeState::Prepared])?;
        let pin = self.ctx.config.pin_stage_threads;

        let mut failure = None;
        for (slot, pipe) in self.pipes.iter().enumerate() {
            let worker = StageWorker {
                head: pipe.head,
                group: pipe.group.clone(),
                generator: pipe.generator,
                hw: pipe.hw.clone(),
                input: pipe.input.clone(),
                ctx: self.ctx.clone(),
                health: pipe.health.clone(),
                stop: self.stop.clone(),
                draining: self.draining.clone(),
                core: pin.then_some(slot),
                in_flight: HashMap::new(),
            };
            match worker.spawn() {
                Ok(handle) => self.workers.push((pipe.head, handle)),
                Err(e) => {
                    error!(stage = %pipe.head, error = %e, "Failed to spawn stage worker");
                    failure = Some(e);
                    break;
                }
            }
        }

        self.state = PipeState::Streaming;
        if let Some(e) = failure {
            self.stop_pipes()?;
            return Err(e.into());
        }
        info!(workers = self.workers.len(), "Pipes streaming");
        Ok(())
    }

    /// Ask generators to stop producing frames; work in flight continues.
    pub fn set_stop_flag(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Stop every worker, downstream first, then drain the input queues.
    #[instrument(skip(self), fields(graph = self.graph.name()))]
    pub fn stop_pipes(&mut self) -> Result<()> {
        self.require_state("stop_pipes", &[PipeState::Streaming])?;
        self.draining.store(true, Ordering::Release);
        self.stop.store(true, Ordering::Release);

        while let Some((stage, handle)) = self.workers.pop() {
            if let Some(pipe) = self.pipes.iter().find(|p| p.head == stage) {
                pipe.input.wake_up();
            }
            if handle.join().is_err() {
                error!(%stage, "Stage worker panicked");
            }
        }

        self.release_inputs();
        self.state = PipeState::Stopped;
        info!("Pipes stopped");
        Ok(())
    }

    /// Abort every frame still queued on a worker input.
    pub fn release_inputs(&self) -> usize {
        let released: usize = self.pipes.iter().map(|p| p.input.release()).sum();
        if released > 0 {
            debug!(released, "Released queued frames");
        }
        released
    }

    /// Close every hardware stage, stopping first if needed.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == PipeState::Destroyed {
            return Ok(());
        }
        if self.state == PipeState::Streaming {
            self.stop_pipes()?;
        }
        if self.state != PipeState::Uninitialized {
            for pipe in &self.pipes {
                pipe.hw.destroy()?;
            }
        }
        self.state = PipeState::Destroyed;
        Ok(())
    }

    /// Input queue of the worker running `stage`
    pub fn input(&self, stage: StageId) -> Option<&Arc<FrameQueue<StageInput>>> {
        let head = self.graph.head_of(stage)?;
        self.pipes.iter().find(|p| p.head == head).map(|p| &p.input)
    }

    /// Input queues keyed by head stage
    pub fn inputs(&self) -> impl Iterator<Item = (StageId, &Arc<FrameQueue<StageInput>>)> {
        self.pipes.iter().map(|p| (p.head, &p.input))
    }

    pub fn health(&self) -> impl Iterator<Item = (StageId, &Arc<StageHealth>, &Arc<dyn HardwareStage>)> {
        self.pipes.iter().map(|p| (p.head, &p.health, &p.hw))
    }

    pub fn queue_sizes(&self) -> Vec<(StageId, usize)> {
        self.pipes
            .iter()
            .map(|p| (p.head, p.input.get_size_of_process_q()))
            .collect()
    }
}

impl Drop for PipelineFactory {
    fn drop(&mut self) {
        if self.state == PipeState::Streaming {
            let _ = self.stop_pipes();
        }
    }
}
