//! Stage graphs and the completion dispatch table

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::frame::EntitySpec;
use crate::stage::{LinkMode, StageId};
use crate::TopologyConfig;

/// Who receives a stage's output outside the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consumer {
    Preview,
    Picture,
    Vision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageNode {
    pub stage: StageId,
    pub parent: Option<StageId>,
    pub link: LinkMode,
    pub consumes_parent: bool,
    pub owns_buffer: bool,
    pub deliver: Option<Consumer>,
    /// Completion pins the stage's input for still capture
    pub hold_for_capture: bool,
    /// Subject to preview rate throttling
    pub throttled: bool,
}

impl StageNode {
    fn root(stage: StageId) -> Self {
        Self {
            stage,
            parent: None,
            link: LinkMode::M2m,
            consumes_parent: false,
            owns_buffer: true,
            deliver: None,
            hold_for_capture: false,
            throttled: false,
        }
    }

    fn child(stage: StageId, parent: StageId, link: LinkMode) -> Self {
        Self {
            parent: Some(parent),
            link,
            // OTF children read their parent's output on the fly, not from memory
            consumes_parent: link == LinkMode::M2m,
            ..Self::root(stage)
        }
    }

    pub fn entity_spec(&self) -> EntitySpec {
        EntitySpec {
            stage: self.stage,
            parent: self.parent,
            consumes_parent: self.consumes_parent,
            needs_dst: self.owns_buffer,
        }
    }
}

/// Directed tree of stages for one topology.
#[derive(Debug, Clone)]
pub struct StageGraph {
    name: &'static str,
    nodes: Vec<StageNode>,
}

impl StageGraph {
    /// Nodes must be listed parents first.
    pub fn new(name: &'static str, nodes: Vec<StageNode>) -> Self {
        Self { name, nodes }
    }

    /// `stages[0]` feeds `stages[1]` and so on, all memory-to-memory.
    pub fn linear(name: &'static str, stages: &[StageId]) -> Self {
        let nodes = stages
            .iter()
            .enumerate()
            .map(|(i, stage)| match i {
                0 => StageNode::root(*stage),
                _ => StageNode::child(*stage, stages[i - 1], LinkMode::M2m),
            })
            .collect();
        Self::new(name, nodes)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn nodes(&self) -> &[StageNode] {
        &self.nodes
    }

    pub fn node(&self, stage: StageId) -> Option<&StageNode> {
        self.nodes.iter().find(|n| n.stage == stage)
    }

    pub fn node_mut(&mut self, stage: StageId) -> Option<&mut StageNode> {
        self.nodes.iter_mut().find(|n| n.stage == stage)
    }

    pub fn contains(&self, stage: StageId) -> bool {
        self.node(stage).is_some()
    }

    pub fn stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.nodes.iter().map(|n| n.stage)
    }

    pub fn children(&self, stage: StageId) -> impl Iterator<Item = &StageNode> {
        self.nodes.iter().filter(move |n| n.parent == Some(stage))
    }

    /// First node of each worker group, in routing order. OTF children run
    /// inside their parent's group.
    pub fn heads(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes.iter().filter(|n| n.link == LinkMode::M2m)
    }

    /// `head` followed by the OTF stages fused into it
    pub fn group(&self, head: StageId) -> Vec<StageId> {
        let mut group = vec![head];
        let mut i = 0;
        while i < group.len() {
            let parent = group[i];
            group.extend(
                self.children(parent)
                    .filter(|n| n.link == LinkMode::Otf)
                    .map(|n| n.stage),
            );
            i += 1;
        }
        group
    }

    /// Head whose worker runs `stage`
    pub fn head_of(&self, stage: StageId) -> Option<StageId> {
        let mut node = self.node(stage)?;
        while node.link == LinkMode::Otf {
            node = self.node(node.parent?)?;
        }
        Some(node.stage)
    }

    pub fn entity_specs(&self) -> Vec<EntitySpec> {
        self.nodes.iter().map(StageNode::entity_spec).collect()
    }

    /// Stage whose input is pinned for still capture, if any
    pub fn hold_point(&self) -> Option<StageId> {
        self.nodes
            .iter()
            .find(|n| n.hold_for_capture)
            .map(|n| n.stage)
    }

    /// External consumer reached from `stage`, searching downstream
    pub fn consumer_below(&self, stage: StageId) -> Option<Consumer> {
        let node = self.node(stage)?;
        if let Some(consumer) = node.deliver {
            return Some(consumer);
        }
        self.children(stage)
            .find_map(|child| self.consumer_below(child.stage))
    }
}

/// Supported pipeline shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// sensor -> stats -> isp -> scaler
    Preview { link: LinkMode },
    /// Preview with a stabilization pass before the scaler
    Stabilized { link: LinkMode },
    /// Fully fused front end, throttled to the display rate
    HighSpeed,
    /// Preview with a fusion pass merging a second sensor
    DualCamera { link: LinkMode },
    /// Sensor output straight to the vision consumer
    VisionOnly,
    /// Still capture from a held bayer buffer
    Reprocessing,
}

impl Topology {
    /// Pick the streaming topology for a session
    pub fn select(config: &TopologyConfig) -> Topology {
        if config.vision_only {
            Topology::VisionOnly
        } else if config.high_speed {
            Topology::HighSpeed
        } else if config.dual_camera {
            Topology::DualCamera { link: config.link }
        } else if config.stabilization {
            Topology::Stabilized { link: config.link }
        } else {
            Topology::Preview { link: config.link }
        }
    }

    pub fn graph(&self) -> StageGraph {
        match *self {
            Topology::Preview { link } => preview_graph(link),
            Topology::Stabilized { link } => stabilized_graph(link),
            Topology::HighSpeed => high_speed_graph(),
            Topology::DualCamera { link } => dual_camera_graph(link),
            Topology::VisionOnly => vision_graph(),
            Topology::Reprocessing => reprocessing_graph(),
        }
    }

    /// Whether frames of this topology can feed still capture
    pub fn supports_reprocessing(&self) -> bool {
        self.graph().hold_point().is_some()
    }
}

fn front_end(link: LinkMode) -> Vec<StageNode> {
    let mut stats = StageNode::child(StageId::Stats, StageId::Sensor, link);
    stats.hold_for_capture = true;
    vec![
        StageNode::root(StageId::Sensor),
        stats,
        StageNode::child(StageId::Isp, StageId::Stats, LinkMode::M2m),
    ]
}

fn preview_output(parent: StageId) -> StageNode {
    StageNode {
        deliver: Some(Consumer::Preview),
        ..StageNode::child(StageId::Scaler, parent, LinkMode::M2m)
    }
}

fn preview_graph(link: LinkMode) -> StageGraph {
    let mut nodes = front_end(link);
    nodes.push(preview_output(StageId::Isp));
    StageGraph::new("preview", nodes)
}

fn stabilized_graph(link: LinkMode) -> StageGraph {
    let mut nodes = front_end(link);
    nodes.push(StageNode::child(StageId::Tpu, StageId::Isp, LinkMode::M2m));
    nodes.push(preview_output(StageId::Tpu));
    StageGraph::new("stabilized", nodes)
}

fn dual_camera_graph(link: LinkMode) -> StageGraph {
    let mut nodes = front_end(link);
    nodes.push(StageNode::child(StageId::Fusion, StageId::Isp, LinkMode::M2m));
    nodes.push(preview_output(StageId::Fusion));
    StageGraph::new("dual_camera", nodes)
}

fn high_speed_graph() -> StageGraph {
    let mut scaler = preview_output(StageId::Isp);
    scaler.throttled = true;
    StageGraph::new(
        "high_speed",
        vec![
            StageNode::root(StageId::Sensor),
            StageNode::child(StageId::Stats, StageId::Sensor, LinkMode::Otf),
            StageNode::child(StageId::Isp, StageId::Stats, LinkMode::Otf),
            scaler,
        ],
    )
}

fn vision_graph() -> StageGraph {
    let mut sensor = StageNode::root(StageId::Sensor);
    sensor.deliver = Some(Consumer::Vision);
    StageGraph::new("vision", vec![sensor])
}

fn reprocessing_graph() -> StageGraph {
    StageGraph::new(
        "reprocessing",
        vec![
            // Reads the held bayer of a streaming frame
            StageNode::child(StageId::ReprocessIsp, StageId::Sensor, LinkMode::M2m),
            StageNode::child(StageId::ReprocessScaler, StageId::ReprocessIsp, LinkMode::M2m),
            StageNode {
                deliver: Some(Consumer::Picture),
                ..StageNode::child(StageId::Jpeg, StageId::ReprocessScaler, LinkMode::M2m)
            },
        ],
    )
}

/// What the dispatcher does when a stage completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Fused child finished together with its parent
    CompleteFused(StageId),
    /// Queue the frame on the next stage's input
    Forward(StageId),
    /// Pin the frame in the capture selector's hold list
    HoldForCapture { stage: StageId, is_src: bool },
    /// Copy the output to the host
    Deliver(Consumer),
}

/// Per-stage completion actions, built once per session from its graphs.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    rows: HashMap<StageId, Vec<Action>>,
    throttled: Vec<StageId>,
    consumers: HashMap<StageId, Consumer>,
}

impl DispatchTable {
    pub fn build(graphs: &[&StageGraph], hold_enabled: bool) -> Self {
        let mut table = DispatchTable::default();

        for graph in graphs {
            for node in graph.nodes() {
                let mut row = Vec::new();
                // Hold before forwarding so a held frame is never complete
                if node.hold_for_capture && hold_enabled {
                    row.push(Action::HoldForCapture {
                        stage: node.stage,
                        is_src: true,
                    });
                }
                for child in graph.children(node.stage) {
                    row.push(match child.link {
                        LinkMode::Otf => Action::CompleteFused(child.stage),
                        LinkMode::M2m => Action::Forward(child.stage),
                    });
                }
                if let Some(consumer) = node.deliver {
                    row.push(Action::Deliver(consumer));
                }
                if node.throttled {
                    table.throttled.push(node.stage);
                }
                if let Some(consumer) = graph.consumer_below(node.stage) {
                    table.consumers.insert(node.stage, consumer);
                }
                table.rows.insert(node.stage, row);
            }
        }
        table
    }

    pub fn actions(&self, stage: StageId) -> &[Action] {
        self.rows.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_throttled(&self, stage: StageId) -> bool {
        self.throttled.contains(&stage)
    }

    pub fn consumer_below(&self, stage: StageId) -> Option<Consumer> {
        self.consumers.get(&stage).copied()
    }
}
