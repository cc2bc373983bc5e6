//! Graph Nodes
//!
//! This module defines the node and edge types that live in the dependency
//! graph. Nodes are deliberately thin: an id and the tag of the node type
//! that knows how to compute it. Everything else (params, values, dirty
//! state) is keyed by [`NodeId`] in the structures that own it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;

/// Output slot read by an edge when the caller does not name one.
pub const DEFAULT_OUTPUT: &str = "out";

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Name of a node type ("sphere", "merge", "point-light", ...).
///
/// Cheap to clone; nodes of the same type share the allocation when the tag
/// is created once and cloned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(Arc<str>);

impl TypeTag {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeTag {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A directed connection from one node's output slot into another node's
/// input slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    /// The node producing the value.
    pub source: NodeId,

    /// Which of the source's outputs is delivered.
    pub source_output: String,

    /// The node consuming the value.
    pub target: NodeId,

    /// The input slot the value lands in. At most one edge per slot.
    pub target_slot: String,
}

impl Edge {
    pub fn new(
        source: NodeId,
        source_output: impl Into<String>,
        target: NodeId,
        target_slot: impl Into<String>,
    ) -> Self {
        Self {
            source,
            source_output: source_output.into(),
            target,
            target_slot: target_slot.into(),
        }
    }
}

/// A node in the dependency graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    /// Which node type computes this node.
    type_tag: TypeTag,

    /// Incoming edges, keyed by the input slot they occupy.
    /// Slot order is insertion order, which keeps traversals deterministic.
    inputs: IndexMap<String, Edge>,

    /// Outgoing edges. Most nodes feed only a handful of consumers.
    outputs: SmallVec<[Edge; 4]>,
}

impl Node {
    /// Create a new node with a freshly generated id.
    pub fn new(type_tag: TypeTag) -> Self {
        Self::with_id(NodeId::new(), type_tag)
    }

    /// Create a node with a caller-chosen id.
    pub fn with_id(id: NodeId, type_tag: TypeTag) -> Self {
        Self {
            id,
            type_tag,
            inputs: IndexMap::new(),
            outputs: SmallVec::new(),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's type tag.
    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    /// The edge occupying `slot`, if any.
    pub fn input(&self, slot: &str) -> Option<&Edge> {
        self.inputs.get(slot)
    }

    /// All incoming edges in slot order.
    pub fn inputs(&self) -> impl Iterator<Item = &Edge> {
        self.inputs.values()
    }

    /// All outgoing edges.
    pub fn outputs(&self) -> &[Edge] {
        &self.outputs
    }

    /// Distinct upstream nodes, in slot order.
    pub fn dependencies(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut seen = SmallVec::<[NodeId; 8]>::new();
        self.inputs.values().filter_map(move |edge| {
            if seen.contains(&edge.source) {
                None
            } else {
                seen.push(edge.source);
                Some(edge.source)
            }
        })
    }

    /// Distinct downstream nodes, in connection order.
    pub fn dependents(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut seen = SmallVec::<[NodeId; 8]>::new();
        self.outputs.iter().filter_map(move |edge| {
            if seen.contains(&edge.target) {
                None
            } else {
                seen.push(edge.target);
                Some(edge.target)
            }
        })
    }

    pub(crate) fn attach_input(&mut self, edge: Edge) {
        self.inputs.insert(edge.target_slot.clone(), edge);
    }

    pub(crate) fn detach_input(&mut self, slot: &str) -> Option<Edge> {
        self.inputs.shift_remove(slot)
    }

    pub(crate) fn attach_output(&mut self, edge: Edge) {
        self.outputs.push(edge);
    }

    pub(crate) fn detach_output(&mut self, edge: &Edge) {
        self.outputs.retain(|existing| existing != edge);
    }
}
