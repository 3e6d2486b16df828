//! Arena-backed dataflow graph.
//!
//! Nodes live in a `Vec` and are addressed by [`NodeId`]; edges are plain
//! id pairs with ports, indexed per node by producer and by consumer.
//! Nothing holds references into the arena, so the
//! graph can be shared immutably while legality state and placement state
//! are mutated elsewhere.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{BalancerError, BalancerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Training phase a node belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeEpochType {
    #[default]
    Forward,
    Backward,
    Optimizer,
}

impl NodeEpochType {
    pub const ALL: [NodeEpochType; 3] = [
        NodeEpochType::Forward,
        NodeEpochType::Backward,
        NodeEpochType::Optimizer,
    ];
}

/// Tensor shape in tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    #[serde(default = "one")]
    pub w: u32,
    #[serde(default = "one")]
    pub z: u32,
    pub rt: u32,
    pub ct: u32,
}

fn one() -> u32 {
    1
}

impl Default for Shape {
    fn default() -> Self {
        Self::tiles(1, 1)
    }
}

impl Shape {
    pub fn tiles(rt: u32, ct: u32) -> Self {
        Self { w: 1, z: 1, rt, ct }
    }

    pub fn rt(&self) -> u32 {
        self.rt
    }

    pub fn ct(&self) -> u32 {
        self.ct
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatmulKind {
    Dense,
    Sparse,
    Depthwise,
}

/// Attributes of a compute op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpAttrs {
    pub op_type: String,
    #[serde(default)]
    pub matmul: Option<MatmulKind>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Set on a dense matmul that may be placed as one unit with the sparse matmul feeding it.
    #[serde(default)]
    pub pair_with_sparse: bool,
    #[serde(default)]
    pub gradient_op: bool,
    #[serde(default)]
    pub recompute: bool,
}

impl OpAttrs {
    pub fn new(op_type: &str) -> Self {
        Self {
            op_type: op_type.to_string(),
            matmul: None,
            tags: BTreeSet::new(),
            pair_with_sparse: false,
            gradient_op: false,
            recompute: false,
        }
    }

    pub fn matmul(kind: MatmulKind) -> Self {
        Self {
            matmul: Some(kind),
            ..Self::new("matmul")
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Input,
    Output,
    Queue {
        #[serde(default)]
        buffering: bool,
    },
    Op(OpAttrs),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub shape: Shape,
    pub epoch_type: NodeEpochType,
}

impl Node {
    pub fn op(&self) -> Option<&OpAttrs> {
        match &self.kind {
            NodeKind::Op(attrs) => Some(attrs),
            _ => None,
        }
    }

    pub fn is_op(&self) -> bool {
        matches!(self.kind, NodeKind::Op(_))
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, NodeKind::Input)
    }

    pub fn is_output(&self) -> bool {
        matches!(self.kind, NodeKind::Output)
    }

    pub fn is_queue(&self) -> bool {
        matches!(self.kind, NodeKind::Queue { .. })
    }

    pub fn is_buffering_queue(&self) -> bool {
        matches!(self.kind, NodeKind::Queue { buffering: true })
    }

    pub fn is_matmul(&self) -> bool {
        self.op().is_some_and(|op| op.matmul.is_some())
    }

    pub fn is_sparse_matmul(&self) -> bool {
        self.op().is_some_and(|op| op.matmul == Some(MatmulKind::Sparse))
    }

    pub fn is_dense_matmul(&self) -> bool {
        self.op().is_some_and(|op| op.matmul == Some(MatmulKind::Dense))
    }

    pub fn is_matmul_not_sparse(&self) -> bool {
        self.is_matmul() && !self.is_sparse_matmul()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.op().is_some_and(|op| op.tags.contains(tag))
    }

    /// Short type label, `"matmul"`, `"input"`, `"queue"`, ...
    pub fn type_name(&self) -> &str {
        match &self.kind {
            NodeKind::Input => "input",
            NodeKind::Output => "output",
            NodeKind::Queue { .. } => "queue",
            NodeKind::Op(attrs) => &attrs.op_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    Data,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub producer: NodeId,
    pub producer_port: u32,
    pub consumer: NodeId,
    pub consumer_port: u32,
    pub edge_type: EdgeType,
}

/// Serializable description a [`Graph`] is built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub shape: Shape,
    #[serde(default)]
    pub epoch_type: NodeEpochType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    #[serde(default)]
    pub from_port: u32,
    pub to: String,
    #[serde(default)]
    pub to_port: u32,
    #[serde(default = "data_edge")]
    pub edge_type: EdgeType,
}

fn data_edge() -> EdgeType {
    EdgeType::Data
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// Per node, indices into `edges` of its incoming edges.
    operand_edges: Vec<Vec<usize>>,
    /// Per node, indices into `edges` of its outgoing edges.
    user_edges: Vec<Vec<usize>>,
    by_name: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn from_spec(spec: &GraphSpec) -> BalancerResult<Self> {
        let mut graph = Graph::new(&spec.name);
        for node in &spec.nodes {
            graph.add_node(&node.name, node.kind.clone(), node.shape, node.epoch_type)?;
        }
        for edge in &spec.edges {
            let producer = graph.id_of(&edge.from)?;
            let consumer = graph.id_of(&edge.to)?;
            graph.push_edge(Edge {
                producer,
                producer_port: edge.from_port,
                consumer,
                consumer_port: edge.to_port,
                edge_type: edge.edge_type,
            });
        }
        Ok(graph)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        shape: Shape,
        epoch_type: NodeEpochType,
    ) -> BalancerResult<NodeId> {
        if self.by_name.contains_key(name) {
            return Err(BalancerError::precondition(format!("duplicate node name {name}")));
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            kind,
            shape,
            epoch_type,
        });
        self.operand_edges.push(Vec::new());
        self.user_edges.push(Vec::new());
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn add_op(&mut self, name: &str, attrs: OpAttrs, shape: Shape) -> BalancerResult<NodeId> {
        self.add_node(name, NodeKind::Op(attrs), shape, NodeEpochType::Forward)
    }

    pub fn add_input(&mut self, name: &str, shape: Shape) -> BalancerResult<NodeId> {
        self.add_node(name, NodeKind::Input, shape, NodeEpochType::Forward)
    }

    pub fn add_output(&mut self, name: &str, shape: Shape) -> BalancerResult<NodeId> {
        self.add_node(name, NodeKind::Output, shape, NodeEpochType::Forward)
    }

    pub fn add_queue(&mut self, name: &str, buffering: bool, shape: Shape) -> BalancerResult<NodeId> {
        self.add_node(name, NodeKind::Queue { buffering }, shape, NodeEpochType::Forward)
    }

    /// Add a data edge and return it.
    pub fn connect(&mut self, producer: NodeId, producer_port: u32, consumer: NodeId, consumer_port: u32) -> Edge {
        let edge = Edge {
            producer,
            producer_port,
            consumer,
            consumer_port,
            edge_type: EdgeType::Data,
        };
        self.push_edge(edge);
        edge
    }

    pub fn add_control_edge(&mut self, producer: NodeId, consumer: NodeId) -> Edge {
        let edge = Edge {
            producer,
            producer_port: 0,
            consumer,
            consumer_port: 0,
            edge_type: EdgeType::Control,
        };
        self.push_edge(edge);
        edge
    }

    fn push_edge(&mut self, edge: Edge) {
        let index = self.edges.len();
        self.edges.push(edge);
        self.operand_edges[edge.consumer.0].push(index);
        self.user_edges[edge.producer.0].push(index);
    }

    fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.operand_edges[id.0].iter().map(|i| &self.edges[*i])
    }

    fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.user_edges[id.0].iter().map(|i| &self.edges[*i])
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn id_of(&self, name: &str) -> BalancerResult<NodeId> {
        self.find(name)
            .ok_or_else(|| BalancerError::UnknownNode(name.to_string()))
    }

    pub fn node_by_name(&self, name: &str) -> BalancerResult<&Node> {
        Ok(self.node(self.id_of(name)?))
    }

    /// Incoming data edges of `id`, ordered by consumer port.
    pub fn operand_data_edges(&self, id: NodeId) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .incoming(id)
            .filter(|e| e.edge_type == EdgeType::Data)
            .copied()
            .collect();
        edges.sort_by_key(|e| e.consumer_port);
        edges
    }

    /// Incoming data edges of `id` that pass `filter`.
    pub fn operand_data_edges_filtered(&self, id: NodeId, filter: impl Fn(&Edge) -> bool) -> Vec<Edge> {
        self.operand_data_edges(id)
            .into_iter()
            .filter(|e| filter(e))
            .collect()
    }

    /// Outgoing data edges of `id`, in insertion order.
    pub fn user_data_edges(&self, id: NodeId) -> Vec<Edge> {
        self.outgoing(id)
            .filter(|e| e.edge_type == EdgeType::Data)
            .copied()
            .collect()
    }

    pub fn data_operands(&self, id: NodeId) -> Vec<NodeId> {
        self.operand_data_edges(id).iter().map(|e| e.producer).collect()
    }

    pub fn data_users(&self, id: NodeId) -> Vec<NodeId> {
        self.user_data_edges(id).iter().map(|e| e.consumer).collect()
    }

    /// All edges of any type from `producer` to `consumer`.
    pub fn edges_between(&self, producer: NodeId, consumer: NodeId) -> Vec<Edge> {
        self.outgoing(producer)
            .filter(|e| e.consumer == consumer)
            .copied()
            .collect()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Whether `dense` is marked for pairing and consumes `sparse` directly.
    pub fn should_pair_with_sparse(&self, dense: NodeId, sparse: NodeId) -> bool {
        let dense_node = self.node(dense);
        dense_node.is_matmul_not_sparse()
            && dense_node.op().is_some_and(|op| op.pair_with_sparse)
            && self.node(sparse).is_sparse_matmul()
            && self.data_operands(dense).contains(&sparse)
    }

    pub fn contains_bwd_nodes(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.epoch_type != NodeEpochType::Forward)
    }

    pub fn contains_recompute_nodes(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.op().is_some_and(|op| op.recompute))
    }

    /// Nodes feeding an output node.
    pub fn output_ops(&self) -> Vec<NodeId> {
        let mut ops: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.is_output())
            .flat_map(|n| self.data_operands(n.id))
            .filter(|id| self.node(*id).is_op())
            .collect();
        ops.sort();
        ops.dedup();
        ops
    }
}
